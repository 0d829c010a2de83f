//! The archetype catalog.
//!
//! An archetype is the per-field policy tuple the compiler selects from
//! `(cardinality, kind, syntax)`: storage layout (size, alignment), how
//! many presence bits the field needs, the accessor thunk that interprets
//! the storage, and the list of `(wire type, parse thunk)` records to emit.
//!
//! Notable policies:
//!  - proto2 strings keep the string accessor but take the bytes parser
//!    (no UTF-8 enforcement);
//!  - repeated message fields claim one bit as their outlined-mode flag;
//!  - group kinds yield the empty archetype: recognized, never parsed,
//!    surfaced as unknown bytes at runtime.

use crate::decoding::{self, map_aux, ParseFn};
use crate::descriptor::{Cardinality, FieldDescriptor, Kind, Syntax};
use crate::reflection::{self, AccessorFn};
use crate::wire;

pub(crate) struct Archetype {
    pub size: u32,
    pub align: u32,
    /// Presence bits to allocate (outlined-mode flag for repeated
    /// messages).
    pub bits: u32,
    /// Whether profile/compile hints may move this field to the cold
    /// region.
    pub cold_ok: bool,
    pub accessor: AccessorFn,
    /// `(wire type, thunk)` records, probe-priority order.
    pub parsers: Vec<(u32, ParseFn)>,
    pub aux: u32,
}

struct ScalarPolicy {
    size: u32,
    align: u32,
    accessor: AccessorFn,
    thunk: ParseFn,
    rep: ParseFn,
    rep_packed: Option<ParseFn>,
}

fn scalar_policy(kind: Kind) -> ScalarPolicy {
    match kind {
        Kind::Int32 | Kind::Uint32 | Kind::Enum => ScalarPolicy {
            size: 4,
            align: 4,
            accessor: if kind == Kind::Uint32 {
                reflection::a_u32
            } else {
                reflection::a_i32
            },
            thunk: decoding::t_varint32,
            rep: decoding::t_rep_varint32,
            rep_packed: Some(decoding::t_rep_varint32_packed),
        },
        Kind::Int64 | Kind::Uint64 => ScalarPolicy {
            size: 8,
            align: 8,
            accessor: if kind == Kind::Uint64 {
                reflection::a_u64
            } else {
                reflection::a_i64
            },
            thunk: decoding::t_varint64,
            rep: decoding::t_rep_varint64,
            rep_packed: Some(decoding::t_rep_varint64_packed),
        },
        Kind::Sint32 => ScalarPolicy {
            size: 4,
            align: 4,
            accessor: reflection::a_i32,
            thunk: decoding::t_sint32,
            rep: decoding::t_rep_sint32,
            rep_packed: Some(decoding::t_rep_sint32_packed),
        },
        Kind::Sint64 => ScalarPolicy {
            size: 8,
            align: 8,
            accessor: reflection::a_i64,
            thunk: decoding::t_sint64,
            rep: decoding::t_rep_sint64,
            rep_packed: Some(decoding::t_rep_sint64_packed),
        },
        Kind::Bool => ScalarPolicy {
            size: 1,
            align: 1,
            accessor: reflection::a_bool,
            thunk: decoding::t_bool,
            rep: decoding::t_rep_bool,
            rep_packed: Some(decoding::t_rep_bool_packed),
        },
        Kind::Fixed32 | Kind::Sfixed32 | Kind::Float => ScalarPolicy {
            size: 4,
            align: 4,
            accessor: match kind {
                Kind::Float => reflection::a_f32,
                Kind::Fixed32 => reflection::a_u32,
                _ => reflection::a_i32,
            },
            thunk: decoding::t_fixed32,
            rep: decoding::t_rep_fixed32,
            rep_packed: Some(decoding::t_rep_fixed32_packed),
        },
        Kind::Fixed64 | Kind::Sfixed64 | Kind::Double => ScalarPolicy {
            size: 8,
            align: 8,
            accessor: match kind {
                Kind::Double => reflection::a_f64,
                Kind::Fixed64 => reflection::a_u64,
                _ => reflection::a_i64,
            },
            thunk: decoding::t_fixed64,
            rep: decoding::t_rep_fixed64,
            rep_packed: Some(decoding::t_rep_fixed64_packed),
        },
        Kind::String => ScalarPolicy {
            size: 8,
            align: 4,
            accessor: reflection::a_string,
            thunk: decoding::t_string,
            rep: decoding::t_rep_string,
            rep_packed: None,
        },
        Kind::Bytes => ScalarPolicy {
            size: 8,
            align: 4,
            accessor: reflection::a_bytes,
            thunk: decoding::t_bytes,
            rep: decoding::t_rep_bytes,
            rep_packed: None,
        },
        Kind::Message => ScalarPolicy {
            size: 8,
            align: 8,
            accessor: reflection::a_message,
            thunk: decoding::t_message,
            rep: decoding::t_rep_message,
            rep_packed: None,
        },
        Kind::Group => ScalarPolicy {
            size: 0,
            align: 1,
            accessor: reflection::a_none,
            thunk: decoding::t_bytes, // unreachable; groups emit no records
            rep: decoding::t_bytes,
            rep_packed: None,
        },
    }
}

pub(crate) fn select(field: &FieldDescriptor, syntax: Syntax) -> Archetype {
    if field.kind == Kind::Group {
        return Archetype {
            size: 0,
            align: 1,
            bits: 0,
            cold_ok: false,
            accessor: reflection::a_none,
            parsers: Vec::new(),
            aux: 0,
        };
    }

    // Proto2 strings keep the string layout and accessor but parse through
    // the bytes thunk; the utf8 aux bit stays clear either way.
    let utf8 = field.kind == Kind::String && syntax == Syntax::Proto3;
    let aux = utf8 as u32;

    match field.cardinality {
        Cardinality::Map => Archetype {
            size: 8,
            align: 8,
            bits: 0,
            cold_ok: false,
            accessor: reflection::a_map,
            parsers: vec![(wire::WT_LEN, decoding::t_map as ParseFn)],
            aux: map_aux::pack(
                field.map_key.unwrap_or(Kind::Int32),
                field.map_value.unwrap_or(Kind::Int32),
                syntax == Syntax::Proto3,
            ),
        },
        Cardinality::Repeated => {
            let policy = scalar_policy(field.kind);
            let natural = field.kind.wire_type();
            let mut parsers: Vec<(u32, ParseFn)> = Vec::new();
            match policy.rep_packed {
                Some(packed) if field.packed => {
                    parsers.push((wire::WT_LEN, packed));
                    parsers.push((natural, policy.rep));
                }
                Some(packed) => {
                    parsers.push((natural, policy.rep));
                    parsers.push((wire::WT_LEN, packed));
                }
                None => parsers.push((natural, policy.rep)),
            }
            Archetype {
                size: 16,
                align: 8,
                bits: (field.kind == Kind::Message) as u32,
                cold_ok: false,
                accessor: reflection::a_list,
                parsers,
                aux,
            }
        }
        Cardinality::Singular | Cardinality::Optional => {
            let policy = scalar_policy(field.kind);
            let thunk = if field.kind == Kind::String && syntax == Syntax::Proto2 {
                decoding::t_bytes
            } else {
                policy.thunk
            };
            let bits = (field.cardinality == Cardinality::Optional
                && field.kind != Kind::Message
                && field.oneof_index.is_none()) as u32;
            Archetype {
                size: policy.size,
                align: policy.align,
                bits,
                cold_ok: field.kind != Kind::Message && field.oneof_index.is_none(),
                accessor: policy.accessor,
                parsers: vec![(field.kind.wire_type(), thunk)],
                aux,
            }
        }
    }
}
