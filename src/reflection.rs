//! Runtime reflection over parsed messages.
//!
//! A [`Message`] is a copyable `(context, pointer)` handle borrowing its
//! [`Shared`]. Field access goes through the accessor thunks embedded in the
//! compiled type's field table; each thunk interprets the raw storage for
//! one archetype and reports presence per the field's rule (bit, oneof
//! `which` word, non-zero value, non-empty range, non-null pointer).
//!
//! List and map accesses materialize lightweight index-only views
//! ([`ListView`], [`MapView`]) over the arena storage or the zero-copy
//! borrows the parser installed.

use std::borrow::Cow;

use core::ptr::NonNull;

use crate::base::{RawMessage, RepStorage};
use crate::descriptor::{Cardinality, FieldDescriptor, Kind, MessageDescriptor, OneofDescriptor};
use crate::shared::Shared;
use crate::swiss::{KeyCtx, KeyProbe, RawMap, RawMapIter};
use crate::tables::{FieldMeta, Library, TypeData, NO_TYPE};
use crate::wire::Zc;
use crate::{ParseError, UnmarshalOptions};

pub(crate) type AccessorFn = for<'s> fn(Message<'s>, &'s FieldMeta) -> Option<Value<'s>>;

/// A parsed (or still-empty) message. Copyable; borrows its `Shared`, so
/// `Shared::free` cannot be called while any handle is live.
#[derive(Clone, Copy)]
pub struct Message<'s> {
    pub(crate) shared: &'s Shared,
    pub(crate) raw: RawMessage,
}

impl<'s> Message<'s> {
    fn lib(&self) -> &'s Library {
        self.shared
            .library()
            .expect("live message without a library")
    }

    fn tyd(&self) -> &'s TypeData {
        self.lib().ty(self.raw.type_id())
    }

    pub(crate) fn src(&self) -> &'s [u8] {
        self.shared.src(self.raw.src_idx())
    }

    pub fn descriptor(&self) -> &'s MessageDescriptor {
        self.lib().descriptor_of(self.raw.type_id())
    }

    /// Parse `data` into this message with default options. The input is
    /// copied into the context's arena, so it only needs to outlive the
    /// call.
    pub fn unmarshal(&self, data: &[u8]) -> Result<(), ParseError> {
        crate::decoding::unmarshal(self.shared, self.raw, data, &UnmarshalOptions::default())
    }

    /// Parse with explicit options. Under `allow_alias` the input is not
    /// copied; the signature ties its lifetime to the context borrow.
    pub fn unmarshal_with(
        &self,
        data: &'s [u8],
        options: &UnmarshalOptions,
    ) -> Result<(), ParseError> {
        crate::decoding::unmarshal(self.shared, self.raw, data, options)
    }

    /// The field's value, or `None` when absent per its presence rule.
    pub fn get(&self, field: &FieldDescriptor) -> Option<Value<'s>> {
        self.get_by_number(field.number)
    }

    /// Like `get`, falling back to the kind's default for absent scalars.
    pub fn get_or_default(&self, field: &FieldDescriptor) -> Option<Value<'s>> {
        self.get(field).or_else(|| default_value(field))
    }

    /// Lookup by field number; also reaches extension fields appended by
    /// the compile-time resolver.
    pub fn get_by_number(&self, number: u32) -> Option<Value<'s>> {
        let tyd = self.tyd();
        let idx = tyd.numbers.lookup(number)?;
        let meta = &tyd.fields[idx as usize];
        (meta.accessor)(*self, meta)
    }

    pub fn has(&self, field: &FieldDescriptor) -> bool {
        self.get(field).is_some()
    }

    /// Visit populated fields in descriptor index order. Returning `false`
    /// stops the walk.
    pub fn range(&self, mut visit: impl FnMut(&'s FieldDescriptor, Value<'s>) -> bool) {
        let tyd = self.tyd();
        for meta in tyd.fields.iter() {
            if let Some(value) = (meta.accessor)(*self, meta) {
                let field = self.field_descriptor(meta.index as usize);
                if !visit(field, value) {
                    return;
                }
            }
        }
    }

    fn field_descriptor(&self, index: usize) -> &'s FieldDescriptor {
        let desc = self.descriptor();
        let tyd = self.tyd();
        if index < desc.fields.len() {
            &desc.fields[index]
        } else {
            &tyd.extensions[index - desc.fields.len()]
        }
    }

    /// The active member of a oneof, read from its `which` word.
    pub fn which_oneof(&self, oneof: &OneofDescriptor) -> Option<&'s FieldDescriptor> {
        let tyd = self.tyd();
        let &first = oneof.fields.first()?;
        let meta = tyd.fields.get(first as usize)?;
        if meta.offset.number != 0 {
            let which = self.raw.word(meta.offset.bit);
            if which == 0 {
                return None;
            }
            let idx = tyd.numbers.lookup(which)?;
            Some(self.field_descriptor(idx as usize))
        } else {
            // single-variant oneof, degraded to a plain optional field
            if (meta.accessor)(*self, meta).is_some() {
                Some(self.field_descriptor(first as usize))
            } else {
                None
            }
        }
    }

    /// Concatenation of the recorded unknown-field ranges; borrowed when a
    /// single contiguous range suffices.
    pub fn unknown(&self) -> Cow<'s, [u8]> {
        let ranges = self.shared.unknown_ranges(self.raw.cold_idx());
        let src = self.src();
        match ranges.len() {
            0 => Cow::Borrowed(&[][..]),
            1 => Cow::Borrowed(ranges[0].bytes(src)),
            _ => {
                let mut out = Vec::new();
                for range in ranges {
                    out.extend_from_slice(range.bytes(src));
                }
                Cow::Owned(out)
            }
        }
    }

    /// Messages are read-only once parsed; `clear` is a no-op on a message
    /// that was never unmarshaled and unsupported afterwards.
    pub fn clear(&self) -> Result<(), Unsupported> {
        if self.raw.src_idx() < 0 {
            Ok(())
        } else {
            Err(Unsupported)
        }
    }

    /// Check that every transitive required field is present; reports the
    /// path of the first unset one.
    pub fn check_initialized(&self) -> Result<(), NotInitialized> {
        self.check_init_inner("")
    }

    fn check_init_inner(&self, prefix: &str) -> Result<(), NotInitialized> {
        let tyd = self.tyd();
        for &entry in tyd.required.iter() {
            let index = if entry >= 0 {
                entry as usize
            } else {
                (!entry) as usize
            };
            let meta = &tyd.fields[index];
            if (meta.accessor)(*self, meta).is_none() {
                return Err(NotInitialized {
                    field: format!("{prefix}{}", self.field_descriptor(index).name),
                });
            }
        }
        for meta in tyd.fields.iter() {
            if meta.child == NO_TYPE {
                continue;
            }
            let name = &self.field_descriptor(meta.index as usize).name;
            match (meta.accessor)(*self, meta) {
                Some(Value::Message(child)) => {
                    child.check_init_inner(&format!("{prefix}{name}."))?;
                }
                Some(Value::List(list)) => {
                    for (i, item) in list.iter().enumerate() {
                        if let Value::Message(child) = item {
                            child.check_init_inner(&format!("{prefix}{name}[{i}]."))?;
                        }
                    }
                }
                Some(Value::Map(map)) => {
                    for (key, value) in map.iter() {
                        if let Value::Message(child) = value {
                            child.check_init_inner(&format!("{prefix}{name}[{key:?}]."))?;
                        }
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }
}

impl core::fmt::Debug for Message<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut s = f.debug_struct(&self.descriptor().full_name);
        self.range(|field, value| {
            s.field(&field.name, &value);
            true
        });
        s.finish()
    }
}

/// A kind's zero value; `None` for message kinds and repeated fields,
/// which have no scalar default.
pub fn default_value<'a>(field: &FieldDescriptor) -> Option<Value<'a>> {
    if field.is_list() || field.is_map() {
        return None;
    }
    Some(match field.kind {
        Kind::Bool => Value::Bool(false),
        Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 | Kind::Enum => Value::I32(0),
        Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => Value::I64(0),
        Kind::Uint32 | Kind::Fixed32 => Value::U32(0),
        Kind::Uint64 | Kind::Fixed64 => Value::U64(0),
        Kind::Float => Value::F32(0.0),
        Kind::Double => Value::F64(0.0),
        Kind::String => Value::Str(""),
        Kind::Bytes => Value::Bytes(&[]),
        Kind::Message | Kind::Group => return None,
    })
}

/// A dynamically-typed field value.
#[derive(Clone, Copy)]
pub enum Value<'s> {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(&'s str),
    Bytes(&'s [u8]),
    Message(Message<'s>),
    List(ListView<'s>),
    Map(MapView<'s>),
}

impl<'s> Value<'s> {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::I32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::U64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Value::F32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::F64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&'s str> {
        match self {
            Value::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&'s [u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_message(&self) -> Option<Message<'s>> {
        match self {
            Value::Message(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<ListView<'s>> {
        match self {
            Value::List(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<MapView<'s>> {
        match self {
            Value::Map(v) => Some(*v),
            _ => None,
        }
    }
}

impl core::fmt::Debug for Value<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match *self {
            Value::Bool(v) => v.fmt(f),
            Value::I32(v) => v.fmt(f),
            Value::I64(v) => v.fmt(f),
            Value::U32(v) => v.fmt(f),
            Value::U64(v) => v.fmt(f),
            Value::F32(v) => v.fmt(f),
            Value::F64(v) => v.fmt(f),
            Value::Str(v) => v.fmt(f),
            Value::Bytes(v) => v.fmt(f),
            Value::Message(ref v) => v.fmt(f),
            Value::List(ref v) => v.fmt(f),
            Value::Map(ref v) => v.fmt(f),
        }
    }
}

// ---------------------------------------------------------------------------
// List views
// ---------------------------------------------------------------------------

/// An index-only view over a repeated field's storage.
#[derive(Clone, Copy)]
pub struct ListView<'s> {
    shared: &'s Shared,
    src: &'s [u8],
    kind: Kind,
    repr: ListRepr,
}

#[derive(Clone, Copy)]
enum ListRepr {
    /// Arena element array.
    Elems { ptr: *const u8, len: usize },
    /// Zero-copy borrow of one-byte varints.
    ZcVarint { offset: usize, len: usize },
    /// Zero-copy borrow of fixed-width elements.
    ZcFixed {
        offset: usize,
        len: usize,
        width: usize,
    },
    /// Packed message headers at a fixed stride.
    InlineMsgs {
        ptr: *const u8,
        len: usize,
        stride: usize,
    },
    /// Spilled pointer slice.
    Outlined { ptr: *const *mut u8, len: usize },
}

impl<'s> ListView<'s> {
    pub fn len(&self) -> usize {
        match self.repr {
            ListRepr::Elems { len, .. }
            | ListRepr::ZcVarint { len, .. }
            | ListRepr::ZcFixed { len, .. }
            | ListRepr::InlineMsgs { len, .. }
            | ListRepr::Outlined { len, .. } => len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Panics on out-of-bounds, like slice indexing.
    pub fn get(&self, index: usize) -> Value<'s> {
        assert!(index < self.len(), "list index out of bounds");
        match self.repr {
            ListRepr::Elems { ptr, .. } => self.elem_value(ptr, index),
            ListRepr::ZcVarint { offset, .. } => {
                let byte = self.src[offset + index] as u64;
                varint_word_value(byte, self.kind)
            }
            ListRepr::ZcFixed { offset, width, .. } => {
                let pos = offset + index * width;
                let word = if width == 4 {
                    u32::from_le_bytes(self.src[pos..pos + 4].try_into().unwrap()) as u64
                } else {
                    u64::from_le_bytes(self.src[pos..pos + 8].try_into().unwrap())
                };
                fixed_word_value(word, self.kind)
            }
            ListRepr::InlineMsgs { ptr, stride, .. } => {
                let raw = unsafe { ptr.add(index * stride) as *mut u8 };
                Value::Message(Message {
                    shared: self.shared,
                    raw: RawMessage(unsafe { NonNull::new_unchecked(raw) }),
                })
            }
            ListRepr::Outlined { ptr, .. } => {
                let raw = unsafe { *ptr.add(index) };
                Value::Message(Message {
                    shared: self.shared,
                    raw: RawMessage(unsafe { NonNull::new_unchecked(raw) }),
                })
            }
        }
    }

    fn elem_value(&self, ptr: *const u8, index: usize) -> Value<'s> {
        unsafe {
            match self.kind {
                Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 | Kind::Enum => {
                    Value::I32(*(ptr as *const i32).add(index))
                }
                Kind::Uint32 | Kind::Fixed32 => Value::U32(*(ptr as *const u32).add(index)),
                Kind::Float => Value::F32(f32::from_bits(*(ptr as *const u32).add(index))),
                Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => {
                    Value::I64(*(ptr as *const i64).add(index))
                }
                Kind::Uint64 | Kind::Fixed64 => Value::U64(*(ptr as *const u64).add(index)),
                Kind::Double => Value::F64(f64::from_bits(*(ptr as *const u64).add(index))),
                Kind::Bool => Value::Bool(*(ptr.add(index)) != 0),
                Kind::String => {
                    let zc = *(ptr as *const Zc).add(index);
                    str_or_bytes(zc.bytes(self.src))
                }
                Kind::Bytes => {
                    let zc = *(ptr as *const Zc).add(index);
                    Value::Bytes(zc.bytes(self.src))
                }
                Kind::Message | Kind::Group => unreachable!("message lists use message reprs"),
            }
        }
    }

    pub fn iter(&self) -> ListIter<'s> {
        ListIter {
            view: *self,
            index: 0,
        }
    }
}

impl<'s> IntoIterator for &ListView<'s> {
    type Item = Value<'s>;
    type IntoIter = ListIter<'s>;

    fn into_iter(self) -> ListIter<'s> {
        self.iter()
    }
}

pub struct ListIter<'s> {
    view: ListView<'s>,
    index: usize,
}

impl<'s> Iterator for ListIter<'s> {
    type Item = Value<'s>;

    fn next(&mut self) -> Option<Value<'s>> {
        if self.index < self.view.len() {
            let value = self.view.get(self.index);
            self.index += 1;
            Some(value)
        } else {
            None
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.view.len() - self.index;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for ListIter<'_> {}

impl core::fmt::Debug for ListView<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

/// Decode a one-byte varint element per the list's kind.
fn varint_word_value<'s>(word: u64, kind: Kind) -> Value<'s> {
    match kind {
        Kind::Int32 | Kind::Enum => Value::I32(word as i32),
        Kind::Sint32 => Value::I32(crate::wire::zigzag32(word as u32)),
        Kind::Int64 => Value::I64(word as i64),
        Kind::Sint64 => Value::I64(crate::wire::zigzag64(word)),
        Kind::Uint32 => Value::U32(word as u32),
        Kind::Uint64 => Value::U64(word),
        Kind::Bool => Value::Bool(word != 0),
        _ => unreachable!("not a varint kind"),
    }
}

fn fixed_word_value<'s>(word: u64, kind: Kind) -> Value<'s> {
    match kind {
        Kind::Fixed32 => Value::U32(word as u32),
        Kind::Sfixed32 => Value::I32(word as u32 as i32),
        Kind::Float => Value::F32(f32::from_bits(word as u32)),
        Kind::Fixed64 => Value::U64(word),
        Kind::Sfixed64 => Value::I64(word as i64),
        Kind::Double => Value::F64(f64::from_bits(word)),
        _ => unreachable!("not a fixed-width kind"),
    }
}

fn str_or_bytes(bytes: &[u8]) -> Value<'_> {
    // Invalid UTF-8 can only be stored under AllowInvalidUtf8; surface it
    // as bytes rather than lying about str validity.
    match core::str::from_utf8(bytes) {
        Ok(s) => Value::Str(s),
        Err(_) => Value::Bytes(bytes),
    }
}

// ---------------------------------------------------------------------------
// Map views
// ---------------------------------------------------------------------------

/// A read-only view over a map field.
#[derive(Clone, Copy)]
pub struct MapView<'s> {
    shared: &'s Shared,
    src: &'s [u8],
    map: Option<&'s RawMap>,
    key_kind: Kind,
    value_kind: Kind,
}

/// Lookup key for [`MapView::get`].
#[derive(Clone, Copy, Debug)]
pub enum MapKey<'a> {
    Bool(bool),
    I32(i32),
    I64(i64),
    U32(u32),
    U64(u64),
    Str(&'a str),
}

impl<'s> MapView<'s> {
    pub fn len(&self) -> usize {
        self.map.map_or(0, |m| m.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: MapKey<'_>) -> Option<Value<'s>> {
        let map = self.map?;
        let str_keys = self.key_kind == Kind::String;
        let probe = match key {
            MapKey::Str(s) if str_keys => KeyProbe::Bytes(s.as_bytes()),
            MapKey::Str(_) => return None,
            _ if str_keys => return None,
            MapKey::Bool(v) => KeyProbe::Int(v as u64),
            MapKey::I32(v) => KeyProbe::Int(v as i64 as u64),
            MapKey::I64(v) => KeyProbe::Int(v as u64),
            MapKey::U32(v) => KeyProbe::Int(v as u64),
            MapKey::U64(v) => KeyProbe::Int(v),
        };
        let ctx = KeyCtx {
            str_keys,
            src: self.src,
        };
        let word = map.get(&probe, &ctx)?;
        Some(self.value_of(word))
    }

    pub fn contains(&self, key: MapKey<'_>) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> MapIter<'s> {
        MapIter {
            view: *self,
            inner: self.map.map(|m| m.iter()),
        }
    }

    fn key_of(&self, word: u64) -> Value<'s> {
        match self.key_kind {
            Kind::Bool => Value::Bool(word != 0),
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 => Value::I32(word as i32),
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => Value::I64(word as i64),
            Kind::Uint32 | Kind::Fixed32 => Value::U32(word as u32),
            Kind::Uint64 | Kind::Fixed64 => Value::U64(word),
            Kind::String => str_or_bytes(Zc::unpack(word).bytes(self.src)),
            _ => unreachable!("invalid map key kind"),
        }
    }

    fn value_of(&self, word: u64) -> Value<'s> {
        match self.value_kind {
            Kind::Bool => Value::Bool(word != 0),
            Kind::Int32 | Kind::Sint32 | Kind::Sfixed32 | Kind::Enum => Value::I32(word as i32),
            Kind::Int64 | Kind::Sint64 | Kind::Sfixed64 => Value::I64(word as i64),
            Kind::Uint32 | Kind::Fixed32 => Value::U32(word as u32),
            Kind::Uint64 | Kind::Fixed64 => Value::U64(word),
            Kind::Float => Value::F32(f32::from_bits(word as u32)),
            Kind::Double => Value::F64(f64::from_bits(word)),
            Kind::String => str_or_bytes(Zc::unpack(word).bytes(self.src)),
            Kind::Bytes => Value::Bytes(Zc::unpack(word).bytes(self.src)),
            Kind::Message => Value::Message(Message {
                shared: self.shared,
                raw: RawMessage(unsafe { NonNull::new_unchecked(word as *mut u8) }),
            }),
            Kind::Group => unreachable!("invalid map value kind"),
        }
    }
}

pub struct MapIter<'s> {
    view: MapView<'s>,
    inner: Option<RawMapIter<'s>>,
}

impl<'s> Iterator for MapIter<'s> {
    type Item = (Value<'s>, Value<'s>);

    fn next(&mut self) -> Option<(Value<'s>, Value<'s>)> {
        let slot = self.inner.as_mut()?.next()?;
        Some((self.view.key_of(slot.key), self.view.value_of(slot.val)))
    }
}

impl core::fmt::Debug for MapView<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_map()
            .entries(self.iter().map(|(k, v)| (k, v)))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Mutation attempted on a parsed, read-only message.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Unsupported;

impl core::fmt::Display for Unsupported {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str("parsed messages are read-only")
    }
}

impl std::error::Error for Unsupported {}

/// A required field (possibly nested) is unset.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct NotInitialized {
    pub field: String,
}

impl core::fmt::Display for NotInitialized {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "required field {} is not set", self.field)
    }
}

impl std::error::Error for NotInitialized {}

// ---------------------------------------------------------------------------
// Accessor thunks
// ---------------------------------------------------------------------------

fn scalar_ptr(msg: &Message<'_>, meta: &FieldMeta) -> Option<*const u8> {
    let offset = meta.offset;
    if offset.data >= 0 {
        Some(msg.raw.data_ptr(offset.hot_offset()) as *const u8)
    } else {
        let cold = msg.shared.cold_data(msg.raw.cold_idx())?;
        Some(unsafe { cold.as_ptr().add(offset.cold_offset() as usize) } as *const u8)
    }
}

/// Resolve the storage pointer iff the field is present: oneof `which`
/// match, presence bit, or the kind's implicit-presence test.
fn presence_scalar(
    msg: &Message<'_>,
    meta: &FieldMeta,
    implicit: impl FnOnce(*const u8) -> bool,
) -> Option<*const u8> {
    let offset = meta.offset;
    if offset.number != 0 {
        if msg.raw.word(offset.bit) != offset.number {
            return None;
        }
        return scalar_ptr(msg, meta);
    }
    let ptr = scalar_ptr(msg, meta)?;
    let present = if meta.card == Cardinality::Optional {
        msg.raw.bit(offset.bit)
    } else {
        implicit(ptr)
    };
    present.then_some(ptr)
}

pub(crate) fn a_i32<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    let ptr = presence_scalar(&msg, meta, |p| unsafe { *(p as *const u32) } != 0)?;
    Some(Value::I32(unsafe { *(ptr as *const i32) }))
}

pub(crate) fn a_u32<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    let ptr = presence_scalar(&msg, meta, |p| unsafe { *(p as *const u32) } != 0)?;
    Some(Value::U32(unsafe { *(ptr as *const u32) }))
}

pub(crate) fn a_i64<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    let ptr = presence_scalar(&msg, meta, |p| unsafe { *(p as *const u64) } != 0)?;
    Some(Value::I64(unsafe { *(ptr as *const i64) }))
}

pub(crate) fn a_u64<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    let ptr = presence_scalar(&msg, meta, |p| unsafe { *(p as *const u64) } != 0)?;
    Some(Value::U64(unsafe { *(ptr as *const u64) }))
}

/// Floats test the raw bits so -0.0 counts as present and NaN never goes
/// through a float compare.
pub(crate) fn a_f32<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    let ptr = presence_scalar(&msg, meta, |p| unsafe { *(p as *const u32) } != 0)?;
    Some(Value::F32(f32::from_bits(unsafe { *(ptr as *const u32) })))
}

pub(crate) fn a_f64<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    let ptr = presence_scalar(&msg, meta, |p| unsafe { *(p as *const u64) } != 0)?;
    Some(Value::F64(f64::from_bits(unsafe { *(ptr as *const u64) })))
}

pub(crate) fn a_bool<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    let ptr = presence_scalar(&msg, meta, |p| unsafe { *p } != 0)?;
    Some(Value::Bool(unsafe { *ptr } != 0))
}

pub(crate) fn a_string<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    let ptr = presence_scalar(&msg, meta, |p| unsafe { (*(p as *const Zc)).len } != 0)?;
    let zc = unsafe { *(ptr as *const Zc) };
    Some(str_or_bytes(zc.bytes(msg.src())))
}

pub(crate) fn a_bytes<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    let ptr = presence_scalar(&msg, meta, |p| unsafe { (*(p as *const Zc)).len } != 0)?;
    let zc = unsafe { *(ptr as *const Zc) };
    Some(Value::Bytes(zc.bytes(msg.src())))
}

pub(crate) fn a_message<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    if meta.offset.number != 0 && msg.raw.word(meta.offset.bit) != meta.offset.number {
        return None;
    }
    let ptr = scalar_ptr(&msg, meta)?;
    let child = unsafe { *(ptr as *const *mut u8) };
    NonNull::new(child).map(|raw| {
        Value::Message(Message {
            shared: msg.shared,
            raw: RawMessage(raw),
        })
    })
}

pub(crate) fn a_list<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    let st: RepStorage = msg.raw.load(meta.offset.hot_offset());
    if st.len == 0 {
        return None;
    }
    let len = st.len as usize;
    let repr = if st.is_zc() {
        let offset = st.zc_offset() as usize;
        match meta.kind {
            Kind::Fixed32 | Kind::Sfixed32 | Kind::Float => ListRepr::ZcFixed {
                offset,
                len,
                width: 4,
            },
            Kind::Fixed64 | Kind::Sfixed64 | Kind::Double => ListRepr::ZcFixed {
                offset,
                len,
                width: 8,
            },
            _ => ListRepr::ZcVarint { offset, len },
        }
    } else if meta.kind == Kind::Message {
        if msg.raw.bit(meta.offset.bit) {
            ListRepr::Outlined {
                ptr: st.ptr as *const *mut u8,
                len,
            }
        } else {
            let stride = msg.lib().ty(meta.child).block_size as usize;
            ListRepr::InlineMsgs {
                ptr: st.ptr,
                len,
                stride,
            }
        }
    } else {
        ListRepr::Elems { ptr: st.ptr, len }
    };
    Some(Value::List(ListView {
        shared: msg.shared,
        src: msg.src(),
        kind: meta.kind,
        repr,
    }))
}

pub(crate) fn a_map<'s>(msg: Message<'s>, meta: &'s FieldMeta) -> Option<Value<'s>> {
    let map_ptr: *const RawMap = msg.raw.load(meta.offset.hot_offset());
    if map_ptr.is_null() {
        return None;
    }
    let map = unsafe { &*map_ptr };
    if map.len() == 0 {
        return None;
    }
    Some(Value::Map(MapView {
        shared: msg.shared,
        src: msg.src(),
        map: Some(map),
        key_kind: meta.map_key,
        value_kind: meta.map_value,
    }))
}

/// Group-kind fields: recognized, never populated.
pub(crate) fn a_none<'s>(_msg: Message<'s>, _meta: &'s FieldMeta) -> Option<Value<'s>> {
    None
}
