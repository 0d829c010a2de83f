//! The parser VM.
//!
//! `unmarshal` drives a dispatch loop over the compiled type's
//! [`FieldParser`] records: decode a tag, linear-probe the per-field linked
//! list up to `max_decode_misses` records, fall back to the tag table, and
//! on a hit call the record's parse thunk. Submessages push frames onto a
//! pooled stack (eliding the push when the nested range ends exactly at the
//! current frame's end); unknown fields are skipped by wire type and
//! recorded as merged zero-copy ranges.
//!
//! Every failure routes through one path: the thunk or loop returns an
//! [`ErrorCode`], and the entry point stamps it with `cursor - src`.

use core::ptr::NonNull;

use crate::arena::Arena;
use crate::base::{rep_push, rep_reserve_exact, RawMessage, RepStorage};
use crate::descriptor::Kind;
use crate::profile::Profile;
use crate::shared::{ColdBlock, Shared, SharedCore};
use crate::swiss::{KeyCtx, RawMap};
use crate::tables::{FieldParser, Library, Offset, TypeId, NO_PARSER};
use crate::wire::{self, Zc};
use crate::{ErrorCode, ParseError, UnmarshalOptions};

pub(crate) type ParseFn = fn(&mut Vm<'_>, FieldParser) -> Result<(), ErrorCode>;

/// Saved state for one nesting level.
pub(crate) struct Frame {
    e: usize,
    msg: RawMessage,
    ty: TypeId,
    fp: u32,
    depth: u32,
}

pub(crate) struct Vm<'a> {
    lib: &'a Library,
    core: *mut SharedCore,
    /// The registered source buffer for this parse.
    buf: &'a [u8],
    src_idx: i32,
    /// Read cursor and current frame end, as offsets into `buf`.
    b: usize,
    e: usize,
    msg: RawMessage,
    ty: TypeId,
    /// Field-parser record to probe first for the next tag.
    fp: u32,
    stack: Vec<Frame>,
    depth: u32,
    max_misses: u32,
    max_depth: u32,
    discard_unknown: bool,
    allow_invalid_utf8: bool,
    profile: Option<&'a Profile>,
}

pub(crate) fn unmarshal(
    shared: &Shared,
    msg: RawMessage,
    data: &[u8],
    opts: &UnmarshalOptions,
) -> Result<(), ParseError> {
    if data.len() > u32::MAX as usize {
        return Err(ParseError::new(ErrorCode::TooBig, 0));
    }
    assert!(
        msg.src_idx() < 0,
        "message already unmarshaled; messages are parse-once"
    );
    let lib = shared
        .library()
        .expect("message created without a library");
    let core = shared.core_ptr();

    // Register the source buffer. Without AllowAlias the input is copied
    // into the arena so zero-copy ranges stay valid until free().
    let (src_idx, buf): (i32, &[u8]) = unsafe {
        let core_ref = &mut *core;
        let idx = core_ref.srcs.len() as i32;
        if opts.allow_alias {
            core_ref.srcs.push((data.as_ptr(), data.len()));
            (idx, data)
        } else {
            let copy = core_ref.arena.alloc_bytes(data);
            core_ref.srcs.push((copy.as_ptr() as *const u8, data.len()));
            (idx, core::slice::from_raw_parts(copy.as_ptr(), data.len()))
        }
    };
    msg.set_src_idx(src_idx);

    let profile = match &opts.profile {
        Some((profile, rate)) if profile.sample(*rate) => Some(profile),
        _ => None,
    };

    let stack = unsafe { core::mem::take(&mut (*core).frames) };
    let ty = msg.type_id();
    let mut vm = Vm {
        lib,
        core,
        buf,
        src_idx,
        b: 0,
        e: buf.len(),
        msg,
        ty,
        fp: lib.ty(ty).parser.first(),
        stack,
        depth: 0,
        max_misses: opts.max_decode_misses.max(1),
        max_depth: opts.max_depth,
        discard_unknown: opts.discard_unknown,
        allow_invalid_utf8: opts.allow_invalid_utf8,
        profile,
    };
    if let Some(p) = vm.profile {
        p.record_parse(ty);
    }

    let result = run_loop(&mut vm, 0);
    let offset = vm.b.min(buf.len());
    vm.stack.clear();
    unsafe { (*core).frames = core::mem::take(&mut vm.stack) };
    result.map_err(|code| ParseError::new(code, offset))
}

fn run_loop(vm: &mut Vm<'_>, floor: usize) -> Result<(), ErrorCode> {
    loop {
        while vm.b < vm.e {
            let tag_start = vm.b;
            let tag = wire::read_tag(vm.buf, &mut vm.b, vm.e)?;
            let number = tag >> 3;
            let wire_type = tag & 7;
            if number == 0 {
                vm.b = tag_start;
                return Err(ErrorCode::FieldNumber);
            }
            if wire_type > wire::WT_FIXED32 {
                vm.b = tag_start;
                return Err(ErrorCode::Reserved);
            }

            let lib = vm.lib;
            let parser = &lib.ty(vm.ty).parser;
            let entries = &parser.entries;

            // Linear probe from the record the previous field predicted.
            let tag64 = tag as u64;
            let mut record = NO_PARSER;
            let mut idx = vm.fp;
            let mut misses = 0;
            while idx != NO_PARSER {
                let candidate = &entries[idx as usize];
                if candidate.tag == tag64 {
                    record = idx;
                    break;
                }
                idx = candidate.next_err;
                misses += 1;
                if misses >= vm.max_misses {
                    break;
                }
            }
            if record == NO_PARSER {
                match parser.tags.lookup(tag) {
                    Some(found) => record = found,
                    None => {
                        skip_unknown(vm, tag, tag_start)?;
                        continue;
                    }
                }
            }

            let fp = entries[record as usize];
            vm.fp = fp.next_ok;
            if let Some(p) = vm.profile {
                p.record_field(vm.ty, fp.field);
            }
            (fp.thunk)(vm, fp)?;
        }
        debug_assert!(vm.b == vm.e);
        if vm.stack.len() == floor {
            return Ok(());
        }
        let frame = vm.stack.pop().unwrap();
        vm.e = frame.e;
        vm.msg = frame.msg;
        vm.ty = frame.ty;
        vm.fp = frame.fp;
        vm.depth = frame.depth;
    }
}

// ---------------------------------------------------------------------------
// Unknown fields
// ---------------------------------------------------------------------------

#[inline(never)]
fn skip_unknown(vm: &mut Vm<'_>, tag: u32, tag_start: usize) -> Result<(), ErrorCode> {
    skip_value(vm, tag, vm.e)?;
    if !vm.discard_unknown {
        record_unknown(vm, tag_start, vm.b);
    }
    Ok(())
}

/// Skip one field value of the given tag, bounded by `limit`.
fn skip_value(vm: &mut Vm<'_>, tag: u32, limit: usize) -> Result<(), ErrorCode> {
    match tag & 7 {
        wire::WT_VARINT => {
            wire::read_varint(vm.buf, &mut vm.b, limit)?;
        }
        wire::WT_FIXED64 => {
            if limit - vm.b < 8 {
                return Err(ErrorCode::Truncated);
            }
            vm.b += 8;
        }
        wire::WT_FIXED32 => {
            if limit - vm.b < 4 {
                return Err(ErrorCode::Truncated);
            }
            vm.b += 4;
        }
        wire::WT_LEN => {
            let len = wire::read_size(vm.buf, &mut vm.b, limit)?;
            if len > limit - vm.b {
                return Err(ErrorCode::Truncated);
            }
            vm.b += len;
        }
        wire::WT_START_GROUP => skip_group(vm, tag >> 3, limit)?,
        _ => {
            // An end-group tag with no matching start.
            return Err(ErrorCode::EndGroup);
        }
    }
    Ok(())
}

/// Consume a (possibly nested) group. Groups are recognized but never
/// compiled; their bytes surface as unknown fields.
fn skip_group(vm: &mut Vm<'_>, number: u32, limit: usize) -> Result<(), ErrorCode> {
    let mut open = vec![number];
    while let Some(&top) = open.last() {
        let tag = wire::read_tag(vm.buf, &mut vm.b, limit)?;
        let n = tag >> 3;
        if n == 0 {
            return Err(ErrorCode::FieldNumber);
        }
        match tag & 7 {
            wire::WT_END_GROUP => {
                if n != top {
                    return Err(ErrorCode::EndGroup);
                }
                open.pop();
            }
            wire::WT_START_GROUP => {
                if open.len() as u32 >= vm.max_depth {
                    return Err(ErrorCode::RecursionDepth);
                }
                open.push(n);
            }
            wire::WT_VARINT => {
                wire::read_varint(vm.buf, &mut vm.b, limit)?;
            }
            wire::WT_FIXED64 => {
                if limit - vm.b < 8 {
                    return Err(ErrorCode::Truncated);
                }
                vm.b += 8;
            }
            wire::WT_FIXED32 => {
                if limit - vm.b < 4 {
                    return Err(ErrorCode::Truncated);
                }
                vm.b += 4;
            }
            wire::WT_LEN => {
                let len = wire::read_size(vm.buf, &mut vm.b, limit)?;
                if len > limit - vm.b {
                    return Err(ErrorCode::Truncated);
                }
                vm.b += len;
            }
            _ => return Err(ErrorCode::Reserved),
        }
    }
    Ok(())
}

fn record_unknown(vm: &mut Vm<'_>, start: usize, end: usize) {
    let range = Zc::new(start, end - start);
    let cold_idx = get_or_create_cold(vm, vm.msg);
    unsafe {
        let unknowns = &mut (&mut (*vm.core).cold)[cold_idx].unknowns;
        if let Some(last) = unknowns.last_mut() {
            if last.offset + last.len == range.offset {
                last.len += range.len;
                return;
            }
        }
        unknowns.push(range);
    }
}

fn get_or_create_cold(vm: &mut Vm<'_>, msg: RawMessage) -> usize {
    let idx = msg.cold_idx();
    if idx >= 0 {
        return idx as usize;
    }
    unsafe {
        let core = &mut *vm.core;
        let cold_size = vm.lib.ty(msg.type_id()).cold_size;
        let data = if cold_size > 0 {
            Some(core.arena.alloc_zeroed(cold_size as usize))
        } else {
            None
        };
        core.cold.push(ColdBlock {
            data,
            unknowns: Vec::new(),
        });
        let idx = core.cold.len() - 1;
        msg.set_cold_idx(idx as i32);
        idx
    }
}

// ---------------------------------------------------------------------------
// VM storage helpers
// ---------------------------------------------------------------------------

impl<'a> Vm<'a> {
    #[inline(always)]
    fn arena(&mut self) -> &mut Arena {
        unsafe { &mut (*self.core).arena }
    }

    /// Resolve a field offset to its storage, creating the message's cold
    /// block when a cold field is first written.
    fn field_ptr(&mut self, offset: Offset) -> *mut u8 {
        if offset.data >= 0 {
            self.msg.data_ptr(offset.hot_offset())
        } else {
            let idx = get_or_create_cold(self, self.msg);
            unsafe {
                let data = (&(*self.core).cold)[idx]
                    .data
                    .expect("cold field in a type without a cold region");
                data.as_ptr().add(offset.cold_offset() as usize)
            }
        }
    }

    /// Flag a field as present: set its bit, or store the field number into
    /// the oneof's `which` word.
    #[inline(always)]
    fn mark(&mut self, offset: Offset) {
        if offset.number != 0 {
            self.msg.set_word(offset.bit, offset.number);
        } else {
            self.msg.set_bit(offset.bit);
        }
    }

    #[inline(always)]
    fn store_scalar<T>(&mut self, fp: &FieldParser, value: T) {
        let ptr = self.field_ptr(fp.offset);
        unsafe { (ptr as *mut T).write(value) };
        self.mark(fp.offset);
    }

    #[inline(always)]
    fn read_varint(&mut self) -> Result<u64, ErrorCode> {
        wire::read_varint(self.buf, &mut self.b, self.e)
    }

    /// Read a length prefix and bound it by the current frame.
    #[inline(always)]
    fn read_len(&mut self) -> Result<usize, ErrorCode> {
        let len = wire::read_size(self.buf, &mut self.b, self.e)?;
        if len > self.e - self.b {
            return Err(ErrorCode::Truncated);
        }
        Ok(len)
    }

    /// Enter a nested message range ending at `new_e`. A range that ends
    /// exactly at the current frame's end needs no frame of its own: the
    /// eventual pop lands directly in the outer frame's parent.
    fn enter(&mut self, child: RawMessage, ty: TypeId, new_e: usize) {
        if new_e != self.e {
            self.stack.push(Frame {
                e: self.e,
                msg: self.msg,
                ty: self.ty,
                fp: self.fp,
                depth: self.depth,
            });
        }
        self.depth += 1;
        self.e = new_e;
        self.msg = child;
        self.ty = ty;
        self.fp = self.lib.ty(ty).parser.first();
        if let Some(p) = self.profile {
            p.record_parse(ty);
        }
    }

    fn check_depth(&self) -> Result<(), ErrorCode> {
        if self.depth + 1 > self.max_depth {
            Err(ErrorCode::RecursionDepth)
        } else {
            Ok(())
        }
    }

    fn alloc_message(&mut self, ty: TypeId) -> RawMessage {
        let block_size = self.lib.ty(ty).block_size;
        let src_idx = self.src_idx;
        RawMessage::alloc(self.arena(), block_size, ty, src_idx)
    }
}

// ---------------------------------------------------------------------------
// Scalar thunks
// ---------------------------------------------------------------------------

pub(crate) fn t_varint32(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let v = vm.read_varint()? as u32;
    vm.store_scalar(&fp, v);
    Ok(())
}

pub(crate) fn t_varint64(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let v = vm.read_varint()?;
    vm.store_scalar(&fp, v);
    Ok(())
}

pub(crate) fn t_sint32(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let v = wire::zigzag32(vm.read_varint()? as u32);
    vm.store_scalar(&fp, v);
    Ok(())
}

pub(crate) fn t_sint64(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let v = wire::zigzag64(vm.read_varint()?);
    vm.store_scalar(&fp, v);
    Ok(())
}

pub(crate) fn t_bool(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let v = (vm.read_varint()? != 0) as u8;
    vm.store_scalar(&fp, v);
    Ok(())
}

pub(crate) fn t_fixed32(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let v = wire::read_fixed32(vm.buf, &mut vm.b, vm.e)?;
    vm.store_scalar(&fp, v);
    Ok(())
}

pub(crate) fn t_fixed64(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let v = wire::read_fixed64(vm.buf, &mut vm.b, vm.e)?;
    vm.store_scalar(&fp, v);
    Ok(())
}

/// Aux bit 0: validate UTF-8 (proto3 string). Proto2 strings share this
/// record shape with the bytes thunk below.
pub(crate) fn t_string(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let len = vm.read_len()?;
    let start = vm.b;
    if fp.aux & 1 != 0 && !vm.allow_invalid_utf8 {
        let bytes = &vm.buf[start..start + len];
        if !wire::validate_utf8(bytes) {
            return Err(ErrorCode::Utf8);
        }
    }
    vm.b = start + len;
    vm.store_scalar(&fp, Zc::new(start, len));
    Ok(())
}

pub(crate) fn t_bytes(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let len = vm.read_len()?;
    let start = vm.b;
    vm.b = start + len;
    vm.store_scalar(&fp, Zc::new(start, len));
    Ok(())
}

// ---------------------------------------------------------------------------
// Message thunks
// ---------------------------------------------------------------------------

pub(crate) fn t_message(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let len = vm.read_len()?;
    vm.check_depth()?;

    let slot = vm.field_ptr(fp.offset) as *mut *mut u8;
    if fp.offset.number != 0 {
        // Oneof member: a different active variant leaves stale bits in the
        // shared slot, so drop them before reusing it as a pointer.
        if vm.msg.word(fp.offset.bit) != fp.offset.number {
            unsafe { slot.write(core::ptr::null_mut()) };
        }
        vm.msg.set_word(fp.offset.bit, fp.offset.number);
    }
    let existing = unsafe { *slot };
    let child = if existing.is_null() {
        let child = vm.alloc_message(fp.child);
        unsafe { slot.write(child.0.as_ptr()) };
        child
    } else {
        RawMessage(unsafe { NonNull::new_unchecked(existing) })
    };
    let new_e = vm.b + len;
    vm.enter(child, fp.child, new_e);
    Ok(())
}

pub(crate) fn t_rep_message(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let len = vm.read_len()?;
    vm.check_depth()?;
    let child = rep_message_append(vm, &fp);
    let new_e = vm.b + len;
    vm.enter(child, fp.child, new_e);
    Ok(())
}

/// Append a slot to a repeated-message field. Elements are packed inline
/// (headers at a fixed stride) until the first growth, which spills to a
/// pointer slice and sets the outlined bit in the parent's bitset.
fn rep_message_append(vm: &mut Vm<'_>, fp: &FieldParser) -> RawMessage {
    let stride = vm.lib.ty(fp.child).block_size as usize;
    let slot = vm.field_ptr(fp.offset) as *mut RepStorage;
    let mut st = unsafe { *slot };
    let outlined = vm.msg.bit(fp.offset.bit);

    let child;
    if st.ptr.is_null() {
        child = vm.alloc_message(fp.child);
        st = RepStorage {
            ptr: child.0.as_ptr(),
            len: 1,
            cap: 1,
        };
    } else if !outlined {
        debug_assert!(st.len == st.cap);
        // Spill: existing inline headers stay put (the arena never moves
        // allocations); the pointer slice simply aliases them.
        let new_cap = (st.cap as usize * 2).max(4);
        let slice = vm.arena().alloc_slice::<*mut u8>(new_cap);
        for i in 0..st.len as usize {
            unsafe { slice.add(i).write(st.ptr.add(i * stride)) };
        }
        child = vm.alloc_message(fp.child);
        unsafe { slice.add(st.len as usize).write(child.0.as_ptr()) };
        vm.msg.set_bit(fp.offset.bit);
        st = RepStorage {
            ptr: slice as *mut u8,
            len: st.len + 1,
            cap: new_cap as u32,
        };
    } else {
        if st.len == st.cap {
            let new_cap = (st.cap as usize * 2).max(4);
            let slice = vm.arena().alloc_slice::<*mut u8>(new_cap);
            unsafe {
                core::ptr::copy_nonoverlapping(
                    st.ptr as *const *mut u8,
                    slice,
                    st.len as usize,
                );
            }
            st.ptr = slice as *mut u8;
            st.cap = new_cap as u32;
        }
        child = vm.alloc_message(fp.child);
        unsafe { (st.ptr as *mut *mut u8).add(st.len as usize).write(child.0.as_ptr()) };
        st.len += 1;
    }
    unsafe { slot.write(st) };
    child
}

// ---------------------------------------------------------------------------
// Repeated scalar thunks
// ---------------------------------------------------------------------------

/// Convert an installed zero-copy borrow (one byte per element) back into
/// an arena list so further elements can be appended.
fn materialize_varint_zc<T: Copy>(
    vm: &mut Vm<'_>,
    st: &mut RepStorage,
    decode: impl Fn(u64) -> T,
) {
    let offset = st.zc_offset() as usize;
    let count = st.len as usize;
    let cap = count.max(4);
    let ptr = vm.arena().alloc_slice::<T>(cap);
    for i in 0..count {
        let byte = vm.buf[offset + i];
        unsafe { ptr.add(i).write(decode(byte as u64)) };
    }
    *st = RepStorage {
        ptr: ptr as *mut u8,
        len: count as u32,
        cap: cap as u32,
    };
}

fn rep_varint<T: Copy>(
    vm: &mut Vm<'_>,
    fp: &FieldParser,
    decode: impl Fn(u64) -> T,
) -> Result<(), ErrorCode> {
    let v = vm.read_varint()?;
    let slot = vm.field_ptr(fp.offset) as *mut RepStorage;
    let mut st = unsafe { *slot };
    if st.is_zc() {
        materialize_varint_zc(vm, &mut st, &decode);
    }
    rep_push(&mut st, decode(v), vm.arena());
    unsafe { slot.write(st) };
    Ok(())
}

fn packed_varint<T: Copy>(
    vm: &mut Vm<'_>,
    fp: &FieldParser,
    decode: impl Fn(u64) -> T,
) -> Result<(), ErrorCode> {
    let len = vm.read_len()?;
    let buf = vm.buf;
    let start = vm.b;
    let end = start + len;
    let data = &buf[start..end];
    if len > 0 && data[len - 1] >= 0x80 {
        // last varint runs past the length prefix
        vm.b = end;
        return Err(ErrorCode::Truncated);
    }
    let count = wire::count_varints(data);

    let slot = vm.field_ptr(fp.offset) as *mut RepStorage;
    let mut st = unsafe { *slot };

    if count == len && st.is_unset() {
        // All one-byte varints into an empty slot: borrow the input.
        st = RepStorage {
            ptr: core::ptr::null_mut(),
            len: count as u32,
            cap: start as u32,
        };
        unsafe { slot.write(st) };
        vm.b = end;
        return Ok(());
    }
    if st.is_zc() {
        materialize_varint_zc(vm, &mut st, &decode);
    }
    rep_reserve_exact::<T>(&mut st, count, vm.arena());

    let base = st.ptr as *mut T;
    let mut written = st.len as usize;
    if count == len {
        // all one-byte
        for &byte in data {
            unsafe { base.add(written).write(decode(byte as u64)) };
            written += 1;
        }
        vm.b = end;
    } else {
        let mut pos = start;
        while pos < end {
            let v = wire::read_varint(buf, &mut pos, end)?;
            unsafe { base.add(written).write(decode(v)) };
            written += 1;
        }
        vm.b = end;
    }
    st.len = written as u32;
    unsafe { slot.write(st) };
    Ok(())
}

pub(crate) fn t_rep_varint32(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    rep_varint::<u32>(vm, &fp, |v| v as u32)
}

pub(crate) fn t_rep_varint32_packed(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    packed_varint::<u32>(vm, &fp, |v| v as u32)
}

pub(crate) fn t_rep_varint64(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    rep_varint::<u64>(vm, &fp, |v| v)
}

pub(crate) fn t_rep_varint64_packed(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    packed_varint::<u64>(vm, &fp, |v| v)
}

pub(crate) fn t_rep_sint32(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    rep_varint::<i32>(vm, &fp, |v| wire::zigzag32(v as u32))
}

pub(crate) fn t_rep_sint32_packed(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    packed_varint::<i32>(vm, &fp, |v| wire::zigzag32(v as u32))
}

pub(crate) fn t_rep_sint64(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    rep_varint::<i64>(vm, &fp, wire::zigzag64)
}

pub(crate) fn t_rep_sint64_packed(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    packed_varint::<i64>(vm, &fp, wire::zigzag64)
}

pub(crate) fn t_rep_bool(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    rep_varint::<u8>(vm, &fp, |v| (v != 0) as u8)
}

pub(crate) fn t_rep_bool_packed(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    packed_varint::<u8>(vm, &fp, |v| (v != 0) as u8)
}

trait FixedElem: Copy {
    const WIDTH: usize;
    fn read_at(buf: &[u8], pos: usize) -> Self;
}

impl FixedElem for u32 {
    const WIDTH: usize = 4;
    fn read_at(buf: &[u8], pos: usize) -> u32 {
        u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]])
    }
}

impl FixedElem for u64 {
    const WIDTH: usize = 8;
    fn read_at(buf: &[u8], pos: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&buf[pos..pos + 8]);
        u64::from_le_bytes(raw)
    }
}

fn materialize_fixed_zc<T: FixedElem>(vm: &mut Vm<'_>, st: &mut RepStorage) {
    let offset = st.zc_offset() as usize;
    let count = st.len as usize;
    let cap = count.max(4);
    let ptr = vm.arena().alloc_slice::<T>(cap);
    for i in 0..count {
        unsafe { ptr.add(i).write(T::read_at(vm.buf, offset + i * T::WIDTH)) };
    }
    *st = RepStorage {
        ptr: ptr as *mut u8,
        len: count as u32,
        cap: cap as u32,
    };
}

fn rep_fixed<T: FixedElem>(vm: &mut Vm<'_>, fp: &FieldParser) -> Result<(), ErrorCode> {
    if vm.e - vm.b < T::WIDTH {
        return Err(ErrorCode::Truncated);
    }
    let v = T::read_at(vm.buf, vm.b);
    vm.b += T::WIDTH;
    let slot = vm.field_ptr(fp.offset) as *mut RepStorage;
    let mut st = unsafe { *slot };
    if st.is_zc() {
        materialize_fixed_zc::<T>(vm, &mut st);
    }
    rep_push(&mut st, v, vm.arena());
    unsafe { slot.write(st) };
    Ok(())
}

/// Fixed-width packed fields always try the zero-copy borrow first.
fn packed_fixed<T: FixedElem>(vm: &mut Vm<'_>, fp: &FieldParser) -> Result<(), ErrorCode> {
    let len = vm.read_len()?;
    let start = vm.b;
    let end = start + len;
    if len % T::WIDTH != 0 {
        vm.b = start;
        return Err(ErrorCode::Truncated);
    }
    let count = len / T::WIDTH;

    let slot = vm.field_ptr(fp.offset) as *mut RepStorage;
    let mut st = unsafe { *slot };
    if st.is_unset() {
        st = RepStorage {
            ptr: core::ptr::null_mut(),
            len: count as u32,
            cap: start as u32,
        };
        unsafe { slot.write(st) };
        vm.b = end;
        return Ok(());
    }
    if st.is_zc() {
        materialize_fixed_zc::<T>(vm, &mut st);
    }
    rep_reserve_exact::<T>(&mut st, count, vm.arena());
    let base = st.ptr as *mut T;
    for i in 0..count {
        unsafe {
            base.add(st.len as usize + i)
                .write(T::read_at(vm.buf, start + i * T::WIDTH))
        };
    }
    st.len += count as u32;
    unsafe { slot.write(st) };
    vm.b = end;
    Ok(())
}

pub(crate) fn t_rep_fixed32(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    rep_fixed::<u32>(vm, &fp)
}

pub(crate) fn t_rep_fixed32_packed(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    packed_fixed::<u32>(vm, &fp)
}

pub(crate) fn t_rep_fixed64(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    rep_fixed::<u64>(vm, &fp)
}

pub(crate) fn t_rep_fixed64_packed(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    packed_fixed::<u64>(vm, &fp)
}

pub(crate) fn t_rep_string(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let len = vm.read_len()?;
    let start = vm.b;
    if fp.aux & 1 != 0 && !vm.allow_invalid_utf8 {
        let bytes = &vm.buf[start..start + len];
        if !wire::validate_utf8(bytes) {
            return Err(ErrorCode::Utf8);
        }
    }
    vm.b = start + len;
    let slot = vm.field_ptr(fp.offset) as *mut RepStorage;
    let mut st = unsafe { *slot };
    rep_push(&mut st, Zc::new(start, len), vm.arena());
    unsafe { slot.write(st) };
    Ok(())
}

pub(crate) fn t_rep_bytes(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let len = vm.read_len()?;
    let start = vm.b;
    vm.b = start + len;
    let slot = vm.field_ptr(fp.offset) as *mut RepStorage;
    let mut st = unsafe { *slot };
    rep_push(&mut st, Zc::new(start, len), vm.arena());
    unsafe { slot.write(st) };
    Ok(())
}

// ---------------------------------------------------------------------------
// Map thunk
// ---------------------------------------------------------------------------

pub(crate) mod map_aux {
    use crate::descriptor::Kind;

    pub(crate) const PROTO3: u32 = 1 << 16;

    pub(crate) fn pack(key: Kind, value: Kind, proto3: bool) -> u32 {
        key.code() as u32 | (value.code() as u32) << 8 | if proto3 { PROTO3 } else { 0 }
    }

    pub(crate) fn unpack(aux: u32) -> (Kind, Kind, bool) {
        (
            Kind::from_code(aux as u8),
            Kind::from_code((aux >> 8) as u8),
            aux & PROTO3 != 0,
        )
    }
}

/// Parse one map entry and insert it. The canonical `key=1, value=2` order
/// hits the tag equality fast path; anything else falls through to the
/// generic skipper.
pub(crate) fn t_map(vm: &mut Vm<'_>, fp: FieldParser) -> Result<(), ErrorCode> {
    let len = vm.read_len()?;
    let end = vm.b + len;
    let (key_kind, val_kind, proto3) = map_aux::unpack(fp.aux);
    let key_tag = 1 << 3 | key_kind.wire_type();
    let val_tag = 2 << 3 | val_kind.wire_type();

    let mut key: u64 = 0;
    let mut val: u64 = 0;
    let mut val_seen = false;
    while vm.b < end {
        let tag = wire::read_tag(vm.buf, &mut vm.b, end)?;
        if tag == key_tag {
            key = read_map_word(vm, key_kind, end, fp, proto3)?;
        } else if tag == val_tag {
            val = read_map_word(vm, val_kind, end, fp, proto3)?;
            val_seen = true;
        } else {
            if tag >> 3 == 0 {
                return Err(ErrorCode::FieldNumber);
            }
            skip_value(vm, tag, end)?;
        }
    }
    if !val_seen && val_kind == Kind::Message {
        // Entry without a value still maps to an (empty) message.
        val = vm.alloc_message(fp.child).0.as_ptr() as u64;
    }

    let slot = vm.field_ptr(fp.offset) as *mut *mut RawMap;
    let mut map = unsafe { *slot };
    if map.is_null() {
        map = RawMap::new_in(vm.arena()).as_ptr();
        unsafe { slot.write(map) };
    }
    let ctx = KeyCtx {
        str_keys: key_kind == Kind::String,
        src: vm.buf,
    };
    unsafe {
        let arena = &mut (*vm.core).arena;
        (*map).insert(key, val, &ctx, arena);
    }
    vm.b = end;
    Ok(())
}

/// Decode one map key/value into its normalized u64 word.
fn read_map_word(
    vm: &mut Vm<'_>,
    kind: Kind,
    limit: usize,
    fp: FieldParser,
    proto3: bool,
) -> Result<u64, ErrorCode> {
    Ok(match kind {
        Kind::Int32 | Kind::Enum => {
            let v = wire::read_varint(vm.buf, &mut vm.b, limit)?;
            v as i32 as i64 as u64
        }
        Kind::Int64 | Kind::Uint64 => wire::read_varint(vm.buf, &mut vm.b, limit)?,
        Kind::Uint32 => wire::read_varint(vm.buf, &mut vm.b, limit)? as u32 as u64,
        Kind::Sint32 => {
            let v = wire::read_varint(vm.buf, &mut vm.b, limit)?;
            wire::zigzag32(v as u32) as i64 as u64
        }
        Kind::Sint64 => {
            let v = wire::read_varint(vm.buf, &mut vm.b, limit)?;
            wire::zigzag64(v) as u64
        }
        Kind::Bool => (wire::read_varint(vm.buf, &mut vm.b, limit)? != 0) as u64,
        Kind::Fixed32 | Kind::Float => wire::read_fixed32(vm.buf, &mut vm.b, limit)? as u64,
        Kind::Sfixed32 => wire::read_fixed32(vm.buf, &mut vm.b, limit)? as i32 as i64 as u64,
        Kind::Fixed64 | Kind::Sfixed64 | Kind::Double => {
            wire::read_fixed64(vm.buf, &mut vm.b, limit)?
        }
        Kind::String | Kind::Bytes => {
            let len = wire::read_size(vm.buf, &mut vm.b, limit)?;
            if len > limit - vm.b {
                return Err(ErrorCode::Truncated);
            }
            let start = vm.b;
            if kind == Kind::String && proto3 && !vm.allow_invalid_utf8 {
                let bytes = &vm.buf[start..start + len];
                if !wire::validate_utf8(bytes) {
                    return Err(ErrorCode::Utf8);
                }
            }
            vm.b = start + len;
            Zc::new(start, len).pack()
        }
        Kind::Message => {
            let len = wire::read_size(vm.buf, &mut vm.b, limit)?;
            if len > limit - vm.b {
                return Err(ErrorCode::Truncated);
            }
            vm.check_depth()?;
            let child = vm.alloc_message(fp.child);
            let end = vm.b + len;
            parse_child_scoped(vm, fp.child, child, end)?;
            child.0.as_ptr() as u64
        }
        Kind::Group => return Err(ErrorCode::Reserved),
    })
}

/// Run the dispatch loop over a nested range with its own save/restore,
/// used where a value must be complete before continuing (map values).
fn parse_child_scoped(
    vm: &mut Vm<'_>,
    ty: TypeId,
    child: RawMessage,
    end: usize,
) -> Result<(), ErrorCode> {
    let saved = (vm.e, vm.msg, vm.ty, vm.fp, vm.depth);
    vm.e = end;
    vm.msg = child;
    vm.ty = ty;
    vm.fp = vm.lib.ty(ty).parser.first();
    vm.depth += 1;
    if let Some(p) = vm.profile {
        p.record_parse(ty);
    }
    let floor = vm.stack.len();
    let result = run_loop(vm, floor);
    (vm.e, vm.msg, vm.ty, vm.fp, vm.depth) = saved;
    result
}
