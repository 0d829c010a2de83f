//! The type compiler.
//!
//! `compile` walks the descriptor graph depth-first from the root message,
//! selects an archetype for every field, assigns presence bits and the
//! hot/cold layout (descending alignment, so the packing itself introduces
//! no padding), emits the field-parser records with their probe links, and
//! builds the tag and number lookup tables. The output is an immutable
//! [`Library`] shared behind an `Arc`.
//!
//! Recompiling with a [`Profile`] re-runs the same pipeline with cold
//! hints; the depth-first order is deterministic, so profile counters
//! indexed by the old library's type ids line up with the new one.

use std::collections::HashMap;
use std::sync::Arc;

use crate::archetype::{self, Archetype};
use crate::base::HEADER_SIZE;
use crate::descriptor::{Cardinality, DescriptorPool, FieldDescriptor, Kind, MessageDescriptor};
use crate::profile::Profile;
use crate::swiss::IndexTable;
use crate::tables::{
    FieldMeta, FieldParser, Library, Offset, Type, TypeData, TypeId, TypeParser, NO_PARSER,
    NO_TYPE,
};
use crate::utils::align_up;
use crate::CompileError;

const MAX_FIELD_NUMBER: u32 = (1 << 29) - 1;

/// Resolves extension fields for a containing message at compile time.
/// Extensions the resolver knows parse as ordinary fields; all other
/// extension numbers surface as unknown fields.
pub trait ExtensionResolver: Send + Sync {
    fn extensions_of(&self, message_full_name: &str) -> Vec<FieldDescriptor>;
}

impl ExtensionResolver for DescriptorPool {
    /// A plain pool knows no extensions.
    fn extensions_of(&self, _message_full_name: &str) -> Vec<FieldDescriptor> {
        Vec::new()
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Placement {
    Hot,
    Cold,
}

#[derive(Clone, Default)]
pub struct CompileOptions {
    pub(crate) extensions: Option<Arc<dyn ExtensionResolver>>,
    pub(crate) placements: HashMap<(String, u32), Placement>,
}

impl CompileOptions {
    pub fn new() -> CompileOptions {
        CompileOptions::default()
    }

    pub fn with_extension_resolver(mut self, resolver: Arc<dyn ExtensionResolver>) -> Self {
        self.extensions = Some(resolver);
        self
    }

    /// Force a field hot or cold regardless of profile data.
    pub fn with_placement(mut self, message: &str, number: u32, placement: Placement) -> Self {
        self.placements.insert((message.to_string(), number), placement);
        self
    }

    fn placement(&self, message: &str, number: u32) -> Option<Placement> {
        self.placements.get(&(message.to_string(), number)).copied()
    }
}

/// Compile a message type from a pool. Pure: recompiling the same inputs
/// yields semantically equivalent types.
pub fn compile(
    pool: &DescriptorPool,
    message: &str,
    options: &CompileOptions,
) -> Result<Type, CompileError> {
    compile_inner(Arc::new(pool.clone()), message, options.clone(), None)
}

/// Compile from a serialized `google.protobuf.FileDescriptorSet`.
pub fn compile_for_bytes(
    file_descriptor_set: &[u8],
    message: &str,
    options: &CompileOptions,
) -> Result<Type, CompileError> {
    let pool = DescriptorPool::from_file_descriptor_set(file_descriptor_set)?;
    compile_inner(Arc::new(pool), message, options.clone(), None)
}

pub(crate) fn recompile(ty: &Type, profile: &Profile) -> Result<Type, CompileError> {
    let lib = &ty.lib;
    // Profiles are indexed by the library's depth-first type ids, which are
    // rooted at the original compile root; re-rooting would shift them.
    let root = lib.descriptor_of(lib.root).full_name.clone();
    let new_root = compile_inner(lib.pool.clone(), &root, lib.options.clone(), Some(profile))?;
    if ty.id == lib.root {
        return Ok(new_root);
    }
    let name = lib.descriptor_of(ty.id).full_name.clone();
    new_root
        .sibling(&name)
        .ok_or(CompileError::NotFound(name))
}

fn compile_inner(
    pool: Arc<DescriptorPool>,
    root: &str,
    options: CompileOptions,
    profile: Option<&Profile>,
) -> Result<Type, CompileError> {
    let root_idx = pool
        .index_of(root)
        .ok_or_else(|| CompileError::NotFound(root.to_string()))?;

    // Depth-first discovery; each reachable message gets one TypeId in
    // visit order (cycles deduplicate through `id_of`).
    let mut order: Vec<u32> = Vec::new();
    let mut id_of: HashMap<u32, TypeId> = HashMap::new();
    let mut ext_of: Vec<Vec<FieldDescriptor>> = Vec::new();
    let mut work = vec![root_idx];
    while let Some(mi) = work.pop() {
        if id_of.contains_key(&mi) {
            continue;
        }
        id_of.insert(mi, order.len() as TypeId);
        order.push(mi);
        let desc = pool.by_index(mi);
        let exts = options
            .extensions
            .as_ref()
            .map(|r| r.extensions_of(&desc.full_name))
            .unwrap_or_default();
        for field in desc.fields.iter().chain(exts.iter()) {
            if let Some(target) = referenced_type(field) {
                let ti = pool
                    .index_of(target)
                    .ok_or_else(|| CompileError::NotFound(target.to_string()))?;
                work.push(ti);
            }
        }
        ext_of.push(exts);
    }

    let mut types = Vec::with_capacity(order.len());
    for (tid, &mi) in order.iter().enumerate() {
        types.push(build_type(
            &pool,
            mi,
            tid as TypeId,
            &id_of,
            &options,
            profile,
            &ext_of[tid],
        )?);
    }

    let by_name: HashMap<String, TypeId> = order
        .iter()
        .enumerate()
        .map(|(tid, &mi)| (pool.by_index(mi).full_name.clone(), tid as TypeId))
        .collect();
    let root_id = id_of[&root_idx];
    let library = Library {
        types: types.into_boxed_slice(),
        by_name,
        pool,
        options,
        root: root_id,
    };
    Ok(Type {
        lib: Arc::new(library),
        id: root_id,
    })
}

/// The message type a field links to, if any (message fields and
/// message-valued maps).
fn referenced_type(field: &FieldDescriptor) -> Option<&str> {
    let is_message = match field.cardinality {
        Cardinality::Map => field.map_value == Some(Kind::Message),
        _ => field.kind == Kind::Message,
    };
    if is_message {
        field.type_name.as_deref()
    } else {
        None
    }
}

struct LayoutSlot {
    /// Field index, or the oneof ordinal for a shared oneof slot.
    key: SlotKey,
    size: u32,
    align: u32,
}

enum SlotKey {
    Field(usize),
    Oneof(usize),
}

#[allow(clippy::too_many_arguments)]
fn build_type(
    pool: &DescriptorPool,
    mi: u32,
    self_id: TypeId,
    id_of: &HashMap<u32, TypeId>,
    options: &CompileOptions,
    profile: Option<&Profile>,
    exts: &[FieldDescriptor],
) -> Result<TypeData, CompileError> {
    let desc: &MessageDescriptor = pool.by_index(mi);
    let syntax = desc.syntax;
    let all: Vec<&FieldDescriptor> = desc.fields.iter().chain(exts.iter()).collect();

    for field in &all {
        if field.number == 0 || field.number > MAX_FIELD_NUMBER {
            return Err(CompileError::MalformedDescriptor);
        }
    }

    let archs: Vec<Archetype> = all.iter().map(|f| archetype::select(f, syntax)).collect();

    // Oneofs with fewer than two variants degrade to optional fields.
    let active: Vec<bool> = desc.oneofs.iter().map(|o| o.fields.len() >= 2).collect();
    let mut oneof_ord = vec![u32::MAX; desc.oneofs.len()];
    let mut num_oneofs = 0u32;
    for (oi, is_active) in active.iter().enumerate() {
        if *is_active {
            oneof_ord[oi] = num_oneofs;
            num_oneofs += 1;
        }
    }
    let eff_oneof: Vec<Option<usize>> = all
        .iter()
        .map(|f| {
            f.oneof_index
                .map(|oi| oi as usize)
                .filter(|&oi| active.get(oi).copied().unwrap_or(false))
        })
        .collect();

    // Presence bits. Bit 0 is the shared scratch bit, so every field has a
    // valid bit to set.
    let mut bit_cursor = 1u32;
    let mut bit_of = vec![0u32; all.len()];
    for (i, arch) in archs.iter().enumerate() {
        let mut bits = arch.bits;
        if eff_oneof[i].is_some() {
            bits = 0;
        } else if all[i].oneof_index.is_some()
            && !matches!(all[i].kind, Kind::Message | Kind::Group)
        {
            // degraded single-variant oneof: plain explicit presence
            bits = 1;
        }
        if bits > 0 {
            bit_of[i] = bit_cursor;
            bit_cursor += bits;
        }
    }
    let bit_words = bit_cursor.div_ceil(32);
    let meta_words = bit_words + num_oneofs;

    // Layout slots: one per non-oneof field, one per active oneof.
    let mut oneof_extent = vec![(0u32, 1u32); desc.oneofs.len()];
    let mut hot_slots: Vec<LayoutSlot> = Vec::new();
    let mut cold_slots: Vec<LayoutSlot> = Vec::new();
    for (i, arch) in archs.iter().enumerate() {
        if arch.size == 0 {
            continue;
        }
        if let Some(oi) = eff_oneof[i] {
            let extent = &mut oneof_extent[oi];
            extent.0 = extent.0.max(arch.size);
            extent.1 = extent.1.max(arch.align);
            continue;
        }
        let cold = arch.cold_ok
            && match options.placement(&desc.full_name, all[i].number) {
                Some(Placement::Cold) => true,
                Some(Placement::Hot) => false,
                None => profile.is_some_and(|p| p.is_cold(self_id, i as u32)),
            };
        let slot = LayoutSlot {
            key: SlotKey::Field(i),
            size: arch.size,
            align: arch.align,
        };
        if cold {
            cold_slots.push(slot);
        } else {
            hot_slots.push(slot);
        }
    }
    for (oi, &(size, align)) in oneof_extent.iter().enumerate() {
        if active[oi] && size > 0 {
            hot_slots.push(LayoutSlot {
                key: SlotKey::Oneof(oi),
                size,
                align,
            });
        }
    }

    // Descending alignment; the sort is stable, so equal-alignment fields
    // keep descriptor order.
    hot_slots.sort_by(|a, b| b.align.cmp(&a.align));
    cold_slots.sort_by(|a, b| b.align.cmp(&a.align));

    let mut data_of = vec![0i32; all.len()];
    let mut oneof_off = vec![0u32; desc.oneofs.len()];
    let mut cursor = meta_words as usize * 4;
    for slot in &hot_slots {
        cursor = align_up(cursor, slot.align as usize);
        match slot.key {
            SlotKey::Field(i) => data_of[i] = cursor as i32,
            SlotKey::Oneof(oi) => oneof_off[oi] = cursor as u32,
        }
        cursor += slot.size as usize;
    }
    let hot_end = align_up(cursor, 8);
    if HEADER_SIZE + hot_end > i32::MAX as usize {
        return Err(CompileError::TooComplex);
    }
    let block_size = (HEADER_SIZE + hot_end) as u32;

    let mut cold_cursor = 0usize;
    for slot in &cold_slots {
        cold_cursor = align_up(cold_cursor, slot.align as usize);
        match slot.key {
            SlotKey::Field(i) => data_of[i] = !(cold_cursor as i32),
            SlotKey::Oneof(_) => unreachable!("oneof slots never go cold"),
        }
        cold_cursor += slot.size as usize;
    }
    if cold_cursor > i32::MAX as usize {
        return Err(CompileError::TooComplex);
    }
    let cold_size = align_up(cold_cursor, 8) as u32;

    // Per-field offsets and reflective metadata.
    let mut offsets = Vec::with_capacity(all.len());
    let mut metas = Vec::with_capacity(all.len());
    for (i, field) in all.iter().enumerate() {
        let offset = match eff_oneof[i] {
            Some(oi) => Offset {
                bit: bit_words + oneof_ord[oi],
                data: oneof_off[oi] as i32,
                number: field.number,
            },
            None => Offset {
                bit: bit_of[i],
                data: data_of[i],
                number: 0,
            },
        };
        offsets.push(offset);

        let child = match referenced_type(field) {
            Some(target) => {
                let ti = pool
                    .index_of(target)
                    .ok_or_else(|| CompileError::NotFound(target.to_string()))?;
                id_of[&ti]
            }
            None => NO_TYPE,
        };
        metas.push(FieldMeta {
            offset,
            number: field.number,
            index: i as u32,
            kind: field.kind,
            card: field.cardinality,
            child,
            map_key: field.map_key.unwrap_or(Kind::Int32),
            map_value: field.map_value.unwrap_or(Kind::Int32),
            accessor: archs[i].accessor,
        });
    }

    // Field-parser records: one per accepted wire type, descriptor order.
    let mut records: Vec<FieldParser> = Vec::new();
    let mut first_of = vec![NO_PARSER; all.len()];
    for (i, field) in all.iter().enumerate() {
        if archs[i].parsers.is_empty() {
            continue;
        }
        first_of[i] = records.len() as u32;
        for &(wire_type, thunk) in &archs[i].parsers {
            records.push(FieldParser {
                tag: (field.number << 3 | wire_type) as u64,
                offset: offsets[i],
                child: metas[i].child,
                next_ok: NO_PARSER,
                next_err: NO_PARSER,
                field: i as u32,
                aux: archs[i].aux,
                thunk,
            });
        }
    }
    // Probe chain over the whole record sequence.
    let num_records = records.len();
    for (r, record) in records.iter_mut().enumerate() {
        record.next_err = if r + 1 < num_records {
            (r + 1) as u32
        } else {
            NO_PARSER
        };
    }
    // Success links: repeated/map fields expect runs of themselves; other
    // fields predict the next field in descriptor order, wrapping.
    let parsed_fields: Vec<usize> = (0..all.len())
        .filter(|&i| first_of[i] != NO_PARSER)
        .collect();
    for (pos, &i) in parsed_fields.iter().enumerate() {
        let next_field = parsed_fields[(pos + 1) % parsed_fields.len()];
        let on_success = match all[i].cardinality {
            Cardinality::Repeated | Cardinality::Map => first_of[i],
            _ => first_of[next_field],
        };
        let start = first_of[i] as usize;
        let end = start + archs[i].parsers.len();
        for record in &mut records[start..end] {
            record.next_ok = on_success;
        }
    }

    let tag_pairs: Vec<(u32, u32)> = records
        .iter()
        .enumerate()
        .map(|(r, record)| (record.tag as u32, r as u32))
        .collect();
    let number_pairs: Vec<(u32, u32)> = all
        .iter()
        .enumerate()
        .map(|(i, field)| (field.number, i as u32))
        .collect();

    let required: Vec<i32> = all
        .iter()
        .enumerate()
        .filter(|(_, f)| f.required)
        .map(|(i, f)| {
            if f.kind == Kind::Message {
                !(i as i32)
            } else {
                i as i32
            }
        })
        .collect();

    Ok(TypeData {
        block_size,
        cold_size,
        bit_words,
        fields: metas.into_boxed_slice(),
        extensions: exts.to_vec().into_boxed_slice(),
        parser: TypeParser {
            entries: records.into_boxed_slice(),
            tags: IndexTable::build(&tag_pairs),
        },
        numbers: IndexTable::build(&number_pairs),
        required: required.into_boxed_slice(),
        descriptor: mi,
    })
}
