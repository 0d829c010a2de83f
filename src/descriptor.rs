//! Runtime message descriptors.
//!
//! Descriptors are the immutable input of the type compiler. A
//! [`DescriptorPool`] is built either programmatically (tests, embedders
//! that already hold schema data) or by decoding a serialized
//! `google.protobuf.FileDescriptorSet` with the hand-rolled reader below.
//! The pool is an opaque collaborator from the compiler's point of view: it
//! exposes lookup by name and by field number, nothing else is assumed.

use std::collections::HashMap;

use crate::wire;
use crate::CompileError;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Syntax {
    Proto2,
    Proto3,
}

/// Protobuf scalar/composite kinds, matching `FieldDescriptorProto.Type`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Kind {
    Double,
    Float,
    Int64,
    Uint64,
    Int32,
    Fixed64,
    Fixed32,
    Bool,
    String,
    Bytes,
    Uint32,
    Sfixed32,
    Sfixed64,
    Sint32,
    Sint64,
    Enum,
    Message,
    Group,
}

impl Kind {
    /// Wire type used by a non-repeated (or unpacked) value of this kind.
    pub(crate) fn wire_type(self) -> u32 {
        match self {
            Kind::Int32
            | Kind::Int64
            | Kind::Uint32
            | Kind::Uint64
            | Kind::Sint32
            | Kind::Sint64
            | Kind::Bool
            | Kind::Enum => wire::WT_VARINT,
            Kind::Fixed64 | Kind::Sfixed64 | Kind::Double => wire::WT_FIXED64,
            Kind::Fixed32 | Kind::Sfixed32 | Kind::Float => wire::WT_FIXED32,
            Kind::String | Kind::Bytes | Kind::Message => wire::WT_LEN,
            Kind::Group => wire::WT_START_GROUP,
        }
    }

    pub(crate) fn is_packable(self) -> bool {
        !matches!(self, Kind::String | Kind::Bytes | Kind::Message | Kind::Group)
    }

    /// Stable small integer used to pack kinds into parser aux words.
    pub(crate) fn code(self) -> u8 {
        match self {
            Kind::Double => 0,
            Kind::Float => 1,
            Kind::Int64 => 2,
            Kind::Uint64 => 3,
            Kind::Int32 => 4,
            Kind::Fixed64 => 5,
            Kind::Fixed32 => 6,
            Kind::Bool => 7,
            Kind::String => 8,
            Kind::Bytes => 9,
            Kind::Uint32 => 10,
            Kind::Sfixed32 => 11,
            Kind::Sfixed64 => 12,
            Kind::Sint32 => 13,
            Kind::Sint64 => 14,
            Kind::Enum => 15,
            Kind::Message => 16,
            Kind::Group => 17,
        }
    }

    pub(crate) fn from_code(code: u8) -> Kind {
        match code {
            0 => Kind::Double,
            1 => Kind::Float,
            2 => Kind::Int64,
            3 => Kind::Uint64,
            4 => Kind::Int32,
            5 => Kind::Fixed64,
            6 => Kind::Fixed32,
            7 => Kind::Bool,
            8 => Kind::String,
            9 => Kind::Bytes,
            10 => Kind::Uint32,
            11 => Kind::Sfixed32,
            12 => Kind::Sfixed64,
            13 => Kind::Sint32,
            14 => Kind::Sint64,
            15 => Kind::Enum,
            16 => Kind::Message,
            _ => Kind::Group,
        }
    }
}

/// Explicit- vs implicit-presence singular, repeated, or map.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Cardinality {
    /// Proto3 implicit presence: present iff the stored value is non-zero.
    Singular,
    /// Tracked presence (proto2 optional/required, proto3 `optional`,
    /// singular messages).
    Optional,
    Repeated,
    Map,
}

#[derive(Clone, Debug)]
pub struct FieldDescriptor {
    pub name: String,
    pub number: u32,
    pub kind: Kind,
    pub cardinality: Cardinality,
    /// Proto2 `required`.
    pub required: bool,
    /// Resolved packedness for repeated primitive fields.
    pub packed: bool,
    /// Index into the containing message's oneof list.
    pub oneof_index: Option<u32>,
    /// Full name of the referenced message type, for message/group kinds
    /// and message-valued maps.
    pub type_name: Option<String>,
    pub map_key: Option<Kind>,
    pub map_value: Option<Kind>,
    /// Index within the containing message, assigned by the pool.
    pub index: u32,
}

impl FieldDescriptor {
    pub fn scalar(name: &str, number: u32, kind: Kind) -> FieldDescriptor {
        FieldDescriptor {
            name: name.to_string(),
            number,
            kind,
            cardinality: Cardinality::Singular,
            required: false,
            packed: false,
            oneof_index: None,
            type_name: None,
            map_key: None,
            map_value: None,
            index: 0,
        }
    }

    pub fn optional(name: &str, number: u32, kind: Kind) -> FieldDescriptor {
        FieldDescriptor {
            cardinality: Cardinality::Optional,
            ..Self::scalar(name, number, kind)
        }
    }

    pub fn repeated(name: &str, number: u32, kind: Kind) -> FieldDescriptor {
        FieldDescriptor {
            cardinality: Cardinality::Repeated,
            packed: kind.is_packable(),
            ..Self::scalar(name, number, kind)
        }
    }

    pub fn message(name: &str, number: u32, type_name: &str) -> FieldDescriptor {
        FieldDescriptor {
            cardinality: Cardinality::Optional,
            type_name: Some(type_name.to_string()),
            ..Self::scalar(name, number, Kind::Message)
        }
    }

    pub fn repeated_message(name: &str, number: u32, type_name: &str) -> FieldDescriptor {
        FieldDescriptor {
            cardinality: Cardinality::Repeated,
            packed: false,
            ..Self::message(name, number, type_name)
        }
    }

    pub fn map(name: &str, number: u32, key: Kind, value: Kind) -> FieldDescriptor {
        FieldDescriptor {
            cardinality: Cardinality::Map,
            kind: Kind::Message,
            map_key: Some(key),
            map_value: Some(value),
            ..Self::scalar(name, number, Kind::Message)
        }
    }

    pub fn map_message(name: &str, number: u32, key: Kind, type_name: &str) -> FieldDescriptor {
        FieldDescriptor {
            type_name: Some(type_name.to_string()),
            ..Self::map(name, number, key, Kind::Message)
        }
    }

    pub fn with_oneof(mut self, oneof_index: u32) -> FieldDescriptor {
        self.oneof_index = Some(oneof_index);
        self
    }

    pub fn with_required(mut self) -> FieldDescriptor {
        self.cardinality = Cardinality::Optional;
        self.required = true;
        self
    }

    pub fn with_packed(mut self, packed: bool) -> FieldDescriptor {
        self.packed = packed;
        self
    }

    pub(crate) fn is_list(&self) -> bool {
        self.cardinality == Cardinality::Repeated
    }

    pub(crate) fn is_map(&self) -> bool {
        self.cardinality == Cardinality::Map
    }
}

#[derive(Clone, Debug)]
pub struct OneofDescriptor {
    pub name: String,
    /// Indices of member fields within the containing message.
    pub fields: Vec<u32>,
}

#[derive(Clone, Debug)]
pub struct MessageDescriptor {
    pub full_name: String,
    pub syntax: Syntax,
    pub fields: Vec<FieldDescriptor>,
    pub oneofs: Vec<OneofDescriptor>,
    /// Synthesized map-entry message (`map_entry` option).
    pub map_entry: bool,
}

impl MessageDescriptor {
    pub fn new(full_name: &str, syntax: Syntax) -> MessageDescriptor {
        MessageDescriptor {
            full_name: full_name.to_string(),
            syntax,
            fields: Vec::new(),
            oneofs: Vec::new(),
            map_entry: false,
        }
    }

    pub fn with_fields(mut self, fields: Vec<FieldDescriptor>) -> MessageDescriptor {
        self.fields = fields;
        self
    }

    pub fn with_oneofs(mut self, names: &[&str]) -> MessageDescriptor {
        self.oneofs = names
            .iter()
            .map(|n| OneofDescriptor {
                name: n.to_string(),
                fields: Vec::new(),
            })
            .collect();
        self
    }

    pub fn field_by_number(&self, number: u32) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.number == number)
    }

    pub fn field_by_name(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn oneof_by_name(&self, name: &str) -> Option<&OneofDescriptor> {
        self.oneofs.iter().find(|o| o.name == name)
    }
}

/// An immutable set of message descriptors indexed by full name.
#[derive(Clone, Default)]
pub struct DescriptorPool {
    pub(crate) messages: Vec<MessageDescriptor>,
    by_name: HashMap<String, u32>,
}

impl DescriptorPool {
    pub fn new() -> DescriptorPool {
        DescriptorPool::default()
    }

    /// Register a message, assigning field indices and oneof membership.
    pub fn add_message(&mut self, mut message: MessageDescriptor) -> Result<(), CompileError> {
        if self.by_name.contains_key(&message.full_name) {
            return Err(CompileError::MalformedDescriptor);
        }
        for oneof in &mut message.oneofs {
            oneof.fields.clear();
        }
        for (i, field) in message.fields.iter_mut().enumerate() {
            field.index = i as u32;
            if let Some(oi) = field.oneof_index {
                if field.cardinality == Cardinality::Singular {
                    // oneof members always track presence
                    field.cardinality = Cardinality::Optional;
                }
                let oneof = message
                    .oneofs
                    .get_mut(oi as usize)
                    .ok_or(CompileError::MalformedDescriptor)?;
                oneof.fields.push(i as u32);
            }
        }
        let id = self.messages.len() as u32;
        self.by_name.insert(message.full_name.clone(), id);
        self.messages.push(message);
        Ok(())
    }

    pub fn message(&self, full_name: &str) -> Option<&MessageDescriptor> {
        self.index_of(full_name)
            .map(|i| &self.messages[i as usize])
    }

    pub(crate) fn index_of(&self, full_name: &str) -> Option<u32> {
        self.by_name
            .get(full_name.strip_prefix('.').unwrap_or(full_name))
            .copied()
    }

    pub(crate) fn by_index(&self, index: u32) -> &MessageDescriptor {
        &self.messages[index as usize]
    }

    /// Decode a serialized `google.protobuf.FileDescriptorSet`.
    pub fn from_file_descriptor_set(bytes: &[u8]) -> Result<DescriptorPool, CompileError> {
        let mut pool = DescriptorPool::new();
        let mut r = Reader::new(bytes);
        while !r.at_end() {
            let (number, wt) = r.tag()?;
            match (number, wt) {
                (1, wire::WT_LEN) => {
                    let file = r.sub()?;
                    parse_file(file, &mut pool)?;
                }
                _ => r.skip(wt)?,
            }
        }
        pool.resolve_maps();
        Ok(pool)
    }

    /// Rewrite repeated fields targeting map-entry messages into map fields.
    fn resolve_maps(&mut self) {
        let entry_info: HashMap<String, (Kind, Kind, Option<String>)> = self
            .messages
            .iter()
            .filter(|m| m.map_entry)
            .filter_map(|m| {
                let key = m.field_by_number(1)?;
                let value = m.field_by_number(2)?;
                Some((
                    m.full_name.clone(),
                    (key.kind, value.kind, value.type_name.clone()),
                ))
            })
            .collect();

        for message in &mut self.messages {
            for field in &mut message.fields {
                if field.cardinality != Cardinality::Repeated || field.kind != Kind::Message {
                    continue;
                }
                let Some(target) = &field.type_name else {
                    continue;
                };
                let target = target.strip_prefix('.').unwrap_or(target);
                if let Some((key, value, value_type)) = entry_info.get(target) {
                    field.cardinality = Cardinality::Map;
                    field.map_key = Some(*key);
                    field.map_value = Some(*value);
                    field.type_name = value_type.clone();
                    field.packed = false;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// FileDescriptorSet wire reader
// ---------------------------------------------------------------------------

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn tag(&mut self) -> Result<(u32, u32), CompileError> {
        let tag = wire::read_tag(self.buf, &mut self.pos, self.buf.len())
            .map_err(|_| CompileError::MalformedDescriptor)?;
        if tag >> 3 == 0 {
            return Err(CompileError::MalformedDescriptor);
        }
        Ok((tag >> 3, tag & 7))
    }

    fn varint(&mut self) -> Result<u64, CompileError> {
        wire::read_varint(self.buf, &mut self.pos, self.buf.len())
            .map_err(|_| CompileError::MalformedDescriptor)
    }

    fn sub(&mut self) -> Result<Reader<'a>, CompileError> {
        let len = wire::read_size(self.buf, &mut self.pos, self.buf.len())
            .map_err(|_| CompileError::MalformedDescriptor)?;
        if len > self.buf.len() - self.pos {
            return Err(CompileError::MalformedDescriptor);
        }
        let sub = Reader {
            buf: &self.buf[self.pos..self.pos + len],
            pos: 0,
        };
        self.pos += len;
        Ok(sub)
    }

    fn string(&mut self) -> Result<String, CompileError> {
        let sub = self.sub()?;
        String::from_utf8(sub.buf.to_vec()).map_err(|_| CompileError::MalformedDescriptor)
    }

    fn skip(&mut self, wt: u32) -> Result<(), CompileError> {
        match wt {
            wire::WT_VARINT => {
                self.varint()?;
            }
            wire::WT_FIXED64 => {
                self.pos += 8;
            }
            wire::WT_FIXED32 => {
                self.pos += 4;
            }
            wire::WT_LEN => {
                self.sub()?;
            }
            _ => return Err(CompileError::MalformedDescriptor),
        }
        if self.pos > self.buf.len() {
            return Err(CompileError::MalformedDescriptor);
        }
        Ok(())
    }
}

fn parse_file(mut r: Reader<'_>, pool: &mut DescriptorPool) -> Result<(), CompileError> {
    let mut package = String::new();
    let mut syntax = Syntax::Proto2;
    let mut messages = Vec::new();
    while !r.at_end() {
        let (number, wt) = r.tag()?;
        match (number, wt) {
            (2, wire::WT_LEN) => package = r.string()?,
            (4, wire::WT_LEN) => messages.push(r.sub()?),
            (12, wire::WT_LEN) => {
                if r.string()? == "proto3" {
                    syntax = Syntax::Proto3;
                }
            }
            _ => r.skip(wt)?,
        }
    }
    for message in messages {
        parse_message(message, &package, syntax, pool)?;
    }
    Ok(())
}

fn parse_message(
    mut r: Reader<'_>,
    scope: &str,
    syntax: Syntax,
    pool: &mut DescriptorPool,
) -> Result<(), CompileError> {
    let mut name = String::new();
    let mut fields = Vec::new();
    let mut oneof_names = Vec::new();
    let mut nested = Vec::new();
    let mut map_entry = false;
    while !r.at_end() {
        let (number, wt) = r.tag()?;
        match (number, wt) {
            (1, wire::WT_LEN) => name = r.string()?,
            (2, wire::WT_LEN) => fields.push(parse_field(r.sub()?, syntax)?),
            (3, wire::WT_LEN) => nested.push(r.sub()?),
            (7, wire::WT_LEN) => {
                // MessageOptions
                let mut opts = r.sub()?;
                while !opts.at_end() {
                    let (n, w) = opts.tag()?;
                    if n == 7 && w == wire::WT_VARINT {
                        map_entry = opts.varint()? != 0;
                    } else {
                        opts.skip(w)?;
                    }
                }
            }
            (8, wire::WT_LEN) => {
                // OneofDescriptorProto
                let mut oneof = r.sub()?;
                let mut oneof_name = String::new();
                while !oneof.at_end() {
                    let (n, w) = oneof.tag()?;
                    if n == 1 && w == wire::WT_LEN {
                        oneof_name = oneof.string()?;
                    } else {
                        oneof.skip(w)?;
                    }
                }
                oneof_names.push(oneof_name);
            }
            _ => r.skip(wt)?,
        }
    }
    if name.is_empty() {
        return Err(CompileError::MalformedDescriptor);
    }
    let full_name = if scope.is_empty() {
        name
    } else {
        format!("{scope}.{name}")
    };

    let mut message = MessageDescriptor::new(&full_name, syntax);
    message.map_entry = map_entry;
    message.oneofs = oneof_names
        .into_iter()
        .map(|name| OneofDescriptor {
            name,
            fields: Vec::new(),
        })
        .collect();
    message.fields = fields;
    pool.add_message(message)?;

    for sub in nested {
        parse_message(sub, &full_name, syntax, pool)?;
    }
    Ok(())
}

fn parse_field(mut r: Reader<'_>, syntax: Syntax) -> Result<FieldDescriptor, CompileError> {
    let mut field = FieldDescriptor::scalar("", 0, Kind::Int32);
    let mut label = 1u64;
    let mut packed_opt: Option<bool> = None;
    let mut proto3_optional = false;
    while !r.at_end() {
        let (number, wt) = r.tag()?;
        match (number, wt) {
            (1, wire::WT_LEN) => field.name = r.string()?,
            (3, wire::WT_VARINT) => field.number = r.varint()? as u32,
            (4, wire::WT_VARINT) => label = r.varint()?,
            (5, wire::WT_VARINT) => {
                field.kind = match r.varint()? {
                    1 => Kind::Double,
                    2 => Kind::Float,
                    3 => Kind::Int64,
                    4 => Kind::Uint64,
                    5 => Kind::Int32,
                    6 => Kind::Fixed64,
                    7 => Kind::Fixed32,
                    8 => Kind::Bool,
                    9 => Kind::String,
                    10 => Kind::Group,
                    11 => Kind::Message,
                    12 => Kind::Bytes,
                    13 => Kind::Uint32,
                    14 => Kind::Enum,
                    15 => Kind::Sfixed32,
                    16 => Kind::Sfixed64,
                    17 => Kind::Sint32,
                    18 => Kind::Sint64,
                    _ => return Err(CompileError::MalformedDescriptor),
                };
            }
            (6, wire::WT_LEN) => field.type_name = Some(r.string()?),
            (8, wire::WT_LEN) => {
                // FieldOptions
                let mut opts = r.sub()?;
                while !opts.at_end() {
                    let (n, w) = opts.tag()?;
                    if n == 2 && w == wire::WT_VARINT {
                        packed_opt = Some(opts.varint()? != 0);
                    } else {
                        opts.skip(w)?;
                    }
                }
            }
            (9, wire::WT_VARINT) => field.oneof_index = Some(r.varint()? as u32),
            (17, wire::WT_VARINT) => proto3_optional = r.varint()? != 0,
            _ => r.skip(wt)?,
        }
    }
    if field.number == 0 {
        return Err(CompileError::MalformedDescriptor);
    }

    field.cardinality = match label {
        3 => Cardinality::Repeated,
        2 => {
            field.required = true;
            Cardinality::Optional
        }
        _ => match syntax {
            Syntax::Proto2 => Cardinality::Optional,
            Syntax::Proto3 => {
                if proto3_optional
                    || field.oneof_index.is_some()
                    || matches!(field.kind, Kind::Message | Kind::Group)
                {
                    Cardinality::Optional
                } else {
                    Cardinality::Singular
                }
            }
        },
    };
    field.packed = field.cardinality == Cardinality::Repeated
        && field.kind.is_packable()
        && packed_opt.unwrap_or(syntax == Syntax::Proto3);
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_programmatic_pool() {
        let mut pool = DescriptorPool::new();
        pool.add_message(
            MessageDescriptor::new("test.S", Syntax::Proto3).with_fields(vec![
                FieldDescriptor::scalar("a", 1, Kind::Int32),
                FieldDescriptor::scalar("b", 2, Kind::String),
                FieldDescriptor::scalar("c", 3, Kind::Bool),
            ]),
        )
        .unwrap();

        let m = pool.message("test.S").unwrap();
        assert_eq!(m.fields.len(), 3);
        assert_eq!(m.field_by_number(2).unwrap().name, "b");
        assert_eq!(m.field_by_name("c").unwrap().index, 2);
        assert!(pool.message("test.T").is_none());
    }

    #[test]
    fn test_duplicate_message_rejected() {
        let mut pool = DescriptorPool::new();
        pool.add_message(MessageDescriptor::new("dup", Syntax::Proto3))
            .unwrap();
        assert!(matches!(
            pool.add_message(MessageDescriptor::new("dup", Syntax::Proto3)),
            Err(CompileError::MalformedDescriptor)
        ));
    }

    #[test]
    fn test_oneof_membership() {
        let mut pool = DescriptorPool::new();
        pool.add_message(
            MessageDescriptor::new("test.O", Syntax::Proto3)
                .with_oneofs(&["k"])
                .with_fields(vec![
                    FieldDescriptor::scalar("a", 1, Kind::Int32).with_oneof(0),
                    FieldDescriptor::scalar("b", 2, Kind::String).with_oneof(0),
                ]),
        )
        .unwrap();
        let m = pool.message("test.O").unwrap();
        assert_eq!(m.oneofs[0].fields, vec![0, 1]);
    }

    #[test]
    fn test_malformed_descriptor_bytes() {
        assert!(matches!(
            DescriptorPool::from_file_descriptor_set(&[0x0A, 0xFF]),
            Err(CompileError::MalformedDescriptor)
        ));
    }
}
