//! The reusable parse context.
//!
//! A [`Shared`] owns the arena all parse output lives on, the registered
//! source buffers zero-copy ranges point into, the lazily allocated cold
//! blocks, and a keep-alive reference to the compiled [`Library`]. Messages
//! borrow the `Shared` (`Message<'s>`), so `free(&mut self)` statically
//! invalidates every outstanding message and range.
//!
//! Concurrency: distinct `Shared`s parse in parallel; a single `Shared` is
//! driven by one thread at a time. The per-context parse serialization the
//! design calls for is expressed natively: `Shared` is `Send` but not
//! `Sync`.

use core::cell::UnsafeCell;
use core::ptr::NonNull;
use std::sync::Arc;

use crate::arena::Arena;
use crate::base::RawMessage;
use crate::decoding::Frame;
use crate::reflection::Message;
use crate::tables::{Library, Type};
use crate::wire::Zc;

pub(crate) struct ColdBlock {
    /// Cold field storage (`cold_size` zeroed bytes); `None` when the type
    /// has no cold fields and the block only tracks unknown ranges.
    pub data: Option<NonNull<u8>>,
    /// Skipped-field ranges in parse order, adjacent ranges merged.
    pub unknowns: Vec<Zc>,
}

pub(crate) struct SharedCore {
    pub arena: Arena,
    /// Registered source buffers, one per top-level parse.
    pub srcs: Vec<(*const u8, usize)>,
    pub cold: Vec<ColdBlock>,
    pub library: Option<Arc<Library>>,
    /// Pooled VM frame stack, reused across parses.
    pub frames: Vec<Frame>,
}

/// A reusable parse context. A zero-value context is usable; `free` resets
/// it for reuse.
pub struct Shared {
    core: UnsafeCell<SharedCore>,
}

// Safety: the core only holds arena memory and raw views into buffers the
// borrow discipline keeps alive; nothing is thread-affine. Shared is
// deliberately !Sync.
unsafe impl Send for Shared {}

impl Default for Shared {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    pub fn new() -> Shared {
        Shared {
            core: UnsafeCell::new(SharedCore {
                arena: Arena::new(),
                srcs: Vec::new(),
                cold: Vec::new(),
                library: None,
                frames: Vec::new(),
            }),
        }
    }

    /// Allocate a fresh, empty message of the given type on this context.
    ///
    /// Panics if `ty` belongs to a different library than earlier messages
    /// of this context; one `Shared` serves one compiled library at a time.
    pub fn new_message<'s>(&'s self, ty: &Type) -> Message<'s> {
        let core = self.core.get();
        unsafe {
            match &(*core).library {
                Some(lib) => {
                    assert!(
                        Arc::ptr_eq(lib, &ty.lib),
                        "all messages of a Shared must come from one compiled library"
                    );
                }
                None => (*core).library = Some(ty.lib.clone()),
            }
            let block_size = ty.lib.ty(ty.id).block_size;
            let raw = RawMessage::alloc(&mut (*core).arena, block_size, ty.id, -1);
            Message { shared: self, raw }
        }
    }

    /// Drop every message, buffer copy and cold block this context produced.
    /// Idempotent. Taking `&mut self` guarantees no message outlives it.
    pub fn free(&mut self) {
        let core = self.core.get_mut();
        core.srcs.clear();
        core.cold.clear();
        core.library = None;
        core.frames.clear();
        core.arena.reset();
    }

    /// Bytes currently held by the context's arena.
    pub fn bytes_allocated(&self) -> usize {
        unsafe { (*self.core.get()).arena.bytes_allocated() }
    }

    pub(crate) fn core_ptr(&self) -> *mut SharedCore {
        self.core.get()
    }

    pub(crate) fn library(&self) -> Option<&Library> {
        unsafe { (*self.core.get()).library.as_deref() }
    }

    /// The registered source buffer a message's zero-copy ranges refer to.
    pub(crate) fn src(&self, idx: i32) -> &[u8] {
        if idx < 0 {
            return &[];
        }
        unsafe {
            let (ptr, len) = (&(*self.core.get()).srcs)[idx as usize];
            core::slice::from_raw_parts(ptr, len)
        }
    }

    pub(crate) fn cold_data(&self, idx: i32) -> Option<NonNull<u8>> {
        if idx < 0 {
            return None;
        }
        unsafe { (&(*self.core.get()).cold)[idx as usize].data }
    }

    /// Copy out a message's unknown ranges (small; borrowing them would pin
    /// the core internals).
    pub(crate) fn unknown_ranges(&self, idx: i32) -> Vec<Zc> {
        if idx < 0 {
            return Vec::new();
        }
        unsafe { (&(*self.core.get()).cold)[idx as usize].unknowns.clone() }
    }
}
