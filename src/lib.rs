//! rapidpb: a read-only dynamic protobuf message library optimized for
//! decoding throughput.
//!
//! Given a message descriptor known only at runtime, [`compile`] builds a
//! specialized parser and memory layout for it; a [`Shared`] context then
//! parses wire payloads into immutable, reflectively-accessible messages.
//!
//! ```
//! use rapidpb::{compile, CompileOptions, DescriptorPool, FieldDescriptor,
//!               Kind, MessageDescriptor, Shared, Syntax};
//!
//! let mut pool = DescriptorPool::new();
//! pool.add_message(
//!     MessageDescriptor::new("demo.Point", Syntax::Proto3).with_fields(vec![
//!         FieldDescriptor::scalar("x", 1, Kind::Int32),
//!         FieldDescriptor::scalar("y", 2, Kind::Int32),
//!     ]),
//! )
//! .unwrap();
//! let ty = compile(&pool, "demo.Point", &CompileOptions::new()).unwrap();
//!
//! let mut shared = Shared::new();
//! {
//!     let msg = shared.new_message(&ty);
//!     msg.unmarshal(&[0x08, 0x07, 0x10, 0x2A]).unwrap();
//!     let x = ty.descriptor().field_by_name("x").unwrap();
//!     assert_eq!(msg.get(x).unwrap().as_i32(), Some(7));
//! }
//! shared.free();
//! ```

pub mod arena;
mod archetype;
mod base;
mod compile;
mod decoding;
pub mod descriptor;
mod profile;
mod reflection;
mod shared;
mod swiss;
mod tables;
pub mod utils;
mod wire;

pub use compile::{compile, compile_for_bytes, CompileOptions, ExtensionResolver, Placement};
pub use descriptor::{
    Cardinality, DescriptorPool, FieldDescriptor, Kind, MessageDescriptor, OneofDescriptor,
    Syntax,
};
pub use profile::Profile;
pub use reflection::{
    default_value, ListIter, ListView, MapIter, MapKey, MapView, Message, NotInitialized,
    Unsupported, Value,
};
pub use shared::Shared;
pub use tables::{Library, Type};

/// Wire-level failure reasons, stamped with the input offset into
/// [`ParseError`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ErrorCode {
    /// Fewer bytes than expected remain.
    Truncated,
    /// A tag with field number zero.
    FieldNumber,
    /// Varint wider than 10 bytes or a field number above 2^29 - 1.
    Overflow,
    /// Wire type 6 or 7.
    Reserved,
    /// Unmatched group-end marker.
    EndGroup,
    /// Message nesting beyond `max_depth`.
    RecursionDepth,
    /// Invalid UTF-8 in a proto3 string field.
    Utf8,
    /// Top-level input longer than 2^32 - 1 bytes.
    TooBig,
}

impl core::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            ErrorCode::Truncated => "truncated input",
            ErrorCode::FieldNumber => "invalid field number",
            ErrorCode::Overflow => "varint overflow",
            ErrorCode::Reserved => "reserved wire type",
            ErrorCode::EndGroup => "unmatched end-group tag",
            ErrorCode::RecursionDepth => "recursion depth exceeded",
            ErrorCode::Utf8 => "invalid utf-8 in string field",
            ErrorCode::TooBig => "input too large",
        };
        f.write_str(s)
    }
}

/// A wire-format parse failure: what went wrong and where.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct ParseError {
    code: ErrorCode,
    offset: usize,
}

impl ParseError {
    pub(crate) fn new(code: ErrorCode, offset: usize) -> ParseError {
        ParseError { code, offset }
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Byte offset into the input where the failure was detected.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} at offset {}", self.code, self.offset)
    }
}

impl std::error::Error for ParseError {}

/// Type-compilation failures.
#[derive(Clone, PartialEq, Eq, Debug)]
pub enum CompileError {
    /// The named message is not in the pool.
    NotFound(String),
    /// A layout or table exceeded its addressable range.
    TooComplex,
    /// Undecodable or inconsistent descriptor input.
    MalformedDescriptor,
}

impl core::fmt::Display for CompileError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            CompileError::NotFound(name) => write!(f, "message {name:?} not found"),
            CompileError::TooComplex => f.write_str("compiled type graph too large"),
            CompileError::MalformedDescriptor => f.write_str("malformed descriptor"),
        }
    }
}

impl std::error::Error for CompileError {}

/// Options for [`Message::unmarshal_with`]. Each setter toggles one field
/// on the VM's options record.
#[derive(Clone)]
pub struct UnmarshalOptions {
    pub(crate) max_decode_misses: u32,
    pub(crate) max_depth: u32,
    pub(crate) discard_unknown: bool,
    pub(crate) allow_invalid_utf8: bool,
    pub(crate) allow_alias: bool,
    pub(crate) profile: Option<(Profile, f64)>,
}

impl Default for UnmarshalOptions {
    fn default() -> Self {
        UnmarshalOptions {
            max_decode_misses: 4,
            max_depth: 1000,
            discard_unknown: false,
            allow_invalid_utf8: false,
            allow_alias: false,
            profile: None,
        }
    }
}

impl UnmarshalOptions {
    pub fn new() -> UnmarshalOptions {
        UnmarshalOptions::default()
    }

    /// Probes through the field-parser chain before giving up on linear
    /// probing. Default 4.
    pub fn max_decode_misses(mut self, n: u32) -> Self {
        self.max_decode_misses = n;
        self
    }

    /// Message nesting bound. Default 1000.
    pub fn max_depth(mut self, n: u32) -> Self {
        self.max_depth = n;
        self
    }

    /// Skip recording unknown fields.
    pub fn discard_unknown(mut self, discard: bool) -> Self {
        self.discard_unknown = discard;
        self
    }

    /// Skip UTF-8 validation of string fields. Invalid strings then
    /// surface as bytes through reflection.
    pub fn allow_invalid_utf8(mut self, allow: bool) -> Self {
        self.allow_invalid_utf8 = allow;
        self
    }

    /// Alias the input buffer instead of copying it into the arena. The
    /// caller guarantees it stays immutable for the context borrow.
    pub fn allow_alias(mut self, allow: bool) -> Self {
        self.allow_alias = allow;
        self
    }

    /// Record per-field counters into `profile` for a sampled fraction of
    /// parses (`0.0 ..= 1.0`).
    pub fn record_profile(mut self, profile: &Profile, rate: f64) -> Self {
        self.profile = Some((profile.clone(), rate.clamp(0.0, 1.0)));
        self
    }
}
