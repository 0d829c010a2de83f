//! Compiled parse tables and the type graph.
//!
//! `compile` turns a descriptor graph into an immutable [`Library`] of
//! [`TypeData`] nodes cross-linked by [`TypeId`]. A node carries the message
//! layout (sizes, bit words), the reflective field table, and the parser
//! table the VM dispatches over. The graph is never mutated after compile
//! and may be shared freely across threads.

use std::collections::HashMap;
use std::sync::Arc;

use crate::compile::CompileOptions;
use crate::decoding::ParseFn;
use crate::descriptor::{Cardinality, DescriptorPool, Kind, MessageDescriptor};
use crate::profile::Profile;
use crate::reflection::AccessorFn;
use crate::swiss::IndexTable;
use crate::CompileError;

pub(crate) type TypeId = u32;
pub(crate) const NO_TYPE: TypeId = u32::MAX;
pub(crate) const NO_PARSER: u32 = u32::MAX;

/// Where a field lives. `data >= 0` is a hot-region byte offset; `data < 0`
/// means `!data` is the cold-region offset. `bit` locates the presence bit
/// (bit 0 is the shared scratch bit) or, for oneof members, the oneof's
/// `which` word. `number` is the oneof field number, zero otherwise.
#[derive(Copy, Clone, Debug)]
pub(crate) struct Offset {
    pub bit: u32,
    pub data: i32,
    pub number: u32,
}

impl Offset {
    #[inline(always)]
    pub(crate) fn is_cold(&self) -> bool {
        self.data < 0
    }

    #[inline(always)]
    pub(crate) fn cold_offset(&self) -> u32 {
        debug_assert!(self.data < 0);
        !self.data as u32
    }

    #[inline(always)]
    pub(crate) fn hot_offset(&self) -> u32 {
        debug_assert!(self.data >= 0);
        self.data as u32
    }
}

/// One dispatch record for one (field, wire type) pair.
#[derive(Copy, Clone)]
pub(crate) struct FieldParser {
    /// Expected encoded tag (`number << 3 | wire_type`).
    pub tag: u64,
    pub offset: Offset,
    /// Referenced message type, for message fields and message-valued maps.
    pub child: TypeId,
    /// Record to try first after this one succeeds.
    pub next_ok: u32,
    /// Next record in the probe chain on a tag mismatch.
    pub next_err: u32,
    /// Index into the type's field table.
    pub field: u32,
    /// Archetype-specific payload (packed element width, map key/value
    /// kinds).
    pub aux: u32,
    pub thunk: ParseFn,
}

pub(crate) struct TypeParser {
    pub entries: Box<[FieldParser]>,
    /// Encoded wire tag → entry index.
    pub tags: IndexTable,
}

impl TypeParser {
    pub(crate) fn first(&self) -> u32 {
        if self.entries.is_empty() {
            NO_PARSER
        } else {
            0
        }
    }
}

/// Reflective field table entry: storage location plus the accessor thunk
/// that interprets it.
pub(crate) struct FieldMeta {
    pub offset: Offset,
    pub number: u32,
    pub index: u32,
    pub kind: Kind,
    pub card: Cardinality,
    pub child: TypeId,
    pub map_key: Kind,
    pub map_value: Kind,
    pub accessor: AccessorFn,
}

pub(crate) struct TypeData {
    /// Full message block size: header + bitset words + hot fields,
    /// 8-aligned.
    pub block_size: u32,
    pub cold_size: u32,
    pub bit_words: u32,
    pub fields: Box<[FieldMeta]>,
    /// Descriptors for extension fields appended by the resolver; the field
    /// table covers descriptor fields first, then these.
    pub extensions: Box<[crate::descriptor::FieldDescriptor]>,
    pub parser: TypeParser,
    /// Field number → field table index.
    pub numbers: IndexTable,
    /// Required-field entries: a non-negative value is a scalar field
    /// index, a bitwise-complemented one is a message field needing
    /// recursion.
    pub required: Box<[i32]>,
    /// Index of the descriptor in the owning pool.
    pub descriptor: u32,
}

/// The immutable output of one `compile` call: every message type reachable
/// from the root, the descriptor pool that produced them, and the options
/// needed to recompile.
pub struct Library {
    pub(crate) types: Box<[TypeData]>,
    pub(crate) by_name: HashMap<String, TypeId>,
    pub(crate) pool: Arc<DescriptorPool>,
    pub(crate) options: CompileOptions,
    pub(crate) root: TypeId,
}

impl Library {
    #[inline(always)]
    pub(crate) fn ty(&self, id: TypeId) -> &TypeData {
        &self.types[id as usize]
    }

    pub(crate) fn descriptor_of(&self, id: TypeId) -> &MessageDescriptor {
        self.pool.by_index(self.ty(id).descriptor)
    }
}

/// A compiled message type: a cheap, clonable handle into a [`Library`].
#[derive(Clone)]
pub struct Type {
    pub(crate) lib: Arc<Library>,
    pub(crate) id: TypeId,
}

impl Type {
    pub fn descriptor(&self) -> &MessageDescriptor {
        self.lib.descriptor_of(self.id)
    }

    pub fn full_name(&self) -> &str {
        &self.descriptor().full_name
    }

    /// Bytes a freshly allocated message of this type occupies (header,
    /// presence bits and hot fields).
    pub fn message_size(&self) -> usize {
        self.lib.ty(self.id).block_size as usize
    }

    /// Handle for another message type compiled into the same library
    /// (e.g. to parse a nested type directly).
    pub fn sibling(&self, full_name: &str) -> Option<Type> {
        self.lib.by_name.get(full_name).map(|&id| Type {
            lib: self.lib.clone(),
            id,
        })
    }

    /// Create an empty profile sized for this type's library.
    pub fn new_profile(&self) -> Profile {
        Profile::for_library(&self.lib)
    }

    /// Re-run the compiler with the original options plus cold hints
    /// derived from `profile`. The existing type remains valid.
    pub fn recompile(&self, profile: &Profile) -> Result<Type, CompileError> {
        crate::compile::recompile(self, profile)
    }
}

impl core::fmt::Debug for Type {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Type")
            .field("name", &self.full_name())
            .field("message_size", &self.message_size())
            .finish()
    }
}
