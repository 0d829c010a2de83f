//! Group-probed open-addressed tables.
//!
//! [`RawMap`] backs map fields: an arena-allocated table of `(u64, u64)`
//! slots with one 7-bit control byte per slot, probed a group (8 control
//! bytes) at a time through word-wide bit tricks. Integer and bool keys are
//! widened into the key word; string keys are packed zero-copy ranges whose
//! bytes are reached through the registered source buffer.
//!
//! [`IndexTable`] reuses the same probing for the compiler's tag→parser and
//! number→field lookups, degrading to a dense array when the key space is
//! small.

use core::hash::BuildHasher;
use core::ptr::NonNull;

use ahash::RandomState;

use crate::arena::Arena;

const GROUP: usize = 8;
const EMPTY: u8 = 0x80;
const REPL: u64 = 0x0101_0101_0101_0101;
const HIGH: u64 = 0x8080_8080_8080_8080;

fn hasher() -> RandomState {
    // Fixed seeds: tables must hash identically across parses of one Shared.
    RandomState::with_seeds(
        0x243F_6A88_85A3_08D3,
        0x1319_8A2E_0370_7344,
        0xA409_3822_299F_31D0,
        0x082E_FA98_EC4E_6C89,
    )
}

#[inline(always)]
fn h2(hash: u64) -> u8 {
    (hash & 0x7F) as u8
}

/// Bitmask of bytes in `group` equal to `byte`, reported in the bytes' high
/// bits. May contain false positives next to a real match; callers compare
/// keys before trusting a hit.
#[inline(always)]
fn match_byte(group: u64, byte: u8) -> u64 {
    let cmp = group ^ (REPL * byte as u64);
    cmp.wrapping_sub(REPL) & !cmp & HIGH
}

#[inline(always)]
fn match_empty(group: u64) -> u64 {
    group & HIGH
}

/// How map keys are hashed and compared.
#[derive(Copy, Clone)]
pub(crate) struct KeyCtx<'a> {
    pub str_keys: bool,
    pub src: &'a [u8],
}

/// A lookup key: integers (and bools) widened to u64, strings as bytes.
pub(crate) enum KeyProbe<'b> {
    Int(u64),
    Bytes(&'b [u8]),
}

impl<'a> KeyCtx<'a> {
    fn probe_of(&self, stored: u64) -> KeyProbe<'a> {
        if self.str_keys {
            KeyProbe::Bytes(crate::wire::Zc::unpack(stored).bytes(self.src))
        } else {
            KeyProbe::Int(stored)
        }
    }

    fn hash(&self, probe: &KeyProbe<'_>) -> u64 {
        match probe {
            KeyProbe::Int(v) => hasher().hash_one(v),
            KeyProbe::Bytes(b) => hasher().hash_one(b),
        }
    }

    fn eq(&self, stored: u64, probe: &KeyProbe<'_>) -> bool {
        match probe {
            KeyProbe::Int(v) => stored == *v,
            KeyProbe::Bytes(b) => crate::wire::Zc::unpack(stored).bytes(self.src) == *b,
        }
    }
}

#[repr(C)]
#[derive(Copy, Clone)]
pub(crate) struct Slot {
    pub key: u64,
    pub val: u64,
}

/// An arena-allocated swiss table. Grows by reallocating on the arena and
/// re-inserting; the abandoned generation is reclaimed at `Shared::free`.
#[repr(C)]
pub(crate) struct RawMap {
    ctrl: *mut u8,
    slots: *mut Slot,
    cap: usize, // power of two, multiple of GROUP; 0 = unallocated
    len: usize,
    growth_left: usize,
}

impl RawMap {
    pub(crate) fn new_in(arena: &mut Arena) -> NonNull<RawMap> {
        let map = arena.alloc::<RawMap>();
        unsafe {
            map.write(RawMap {
                ctrl: core::ptr::null_mut(),
                slots: core::ptr::null_mut(),
                cap: 0,
                len: 0,
                growth_left: 0,
            });
            NonNull::new_unchecked(map)
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    fn group(&self, g: usize) -> u64 {
        unsafe { core::ptr::read_unaligned(self.ctrl.add(g * GROUP) as *const u64) }
    }

    fn find(&self, probe: &KeyProbe<'_>, ctx: &KeyCtx<'_>) -> Option<usize> {
        if self.cap == 0 {
            return None;
        }
        let hash = ctx.hash(probe);
        let tag = h2(hash);
        let groups = self.cap / GROUP;
        let mut g = (hash as usize >> 7) & (groups - 1);
        let mut step = 0;
        loop {
            let group = self.group(g);
            let mut m = match_byte(group, tag);
            while m != 0 {
                let idx = g * GROUP + (m.trailing_zeros() as usize) / 8;
                let slot = unsafe { *self.slots.add(idx) };
                if ctx.eq(slot.key, probe) {
                    return Some(idx);
                }
                m &= m - 1;
            }
            if match_empty(group) != 0 {
                return None;
            }
            step += 1;
            if step >= groups {
                return None;
            }
            g = (g + step) & (groups - 1);
        }
    }

    fn find_insert_slot(&self, hash: u64) -> usize {
        let groups = self.cap / GROUP;
        let mut g = (hash as usize >> 7) & (groups - 1);
        let mut step = 0;
        loop {
            let group = self.group(g);
            let m = match_empty(group);
            if m != 0 {
                return g * GROUP + (m.trailing_zeros() as usize) / 8;
            }
            step += 1;
            debug_assert!(step < groups, "probed a full table");
            g = (g + step) & (groups - 1);
        }
    }

    pub(crate) fn get(&self, probe: &KeyProbe<'_>, ctx: &KeyCtx<'_>) -> Option<u64> {
        self.find(probe, ctx)
            .map(|idx| unsafe { (*self.slots.add(idx)).val })
    }

    /// Insert or overwrite ("last one wins", matching singular fields).
    pub(crate) fn insert(&mut self, key: u64, val: u64, ctx: &KeyCtx<'_>, arena: &mut Arena) {
        let probe = ctx.probe_of(key);
        if let Some(idx) = self.find(&probe, ctx) {
            unsafe { (*self.slots.add(idx)).val = val };
            return;
        }
        if self.growth_left == 0 {
            self.grow(ctx, arena);
        }
        let hash = ctx.hash(&probe);
        let idx = self.find_insert_slot(hash);
        unsafe {
            *self.ctrl.add(idx) = h2(hash);
            self.slots.add(idx).write(Slot { key, val });
        }
        self.len += 1;
        self.growth_left -= 1;
    }

    #[inline(never)]
    fn grow(&mut self, ctx: &KeyCtx<'_>, arena: &mut Arena) {
        let new_cap = (self.cap * 2).max(GROUP);
        let new_ctrl = arena.alloc_slice::<u8>(new_cap);
        let new_slots = arena.alloc_slice::<Slot>(new_cap);
        unsafe { core::ptr::write_bytes(new_ctrl, EMPTY, new_cap) };

        let old = RawMap {
            ctrl: self.ctrl,
            slots: self.slots,
            cap: self.cap,
            len: self.len,
            growth_left: 0,
        };
        self.ctrl = new_ctrl;
        self.slots = new_slots;
        self.cap = new_cap;
        self.growth_left = new_cap / 8 * 7 - self.len;

        for slot in old.iter() {
            let hash = ctx.hash(&ctx.probe_of(slot.key));
            let idx = self.find_insert_slot(hash);
            unsafe {
                *self.ctrl.add(idx) = h2(hash);
                self.slots.add(idx).write(slot);
            }
        }
    }

    pub(crate) fn iter(&self) -> RawMapIter<'_> {
        RawMapIter { map: self, idx: 0 }
    }
}

pub(crate) struct RawMapIter<'a> {
    map: &'a RawMap,
    idx: usize,
}

impl Iterator for RawMapIter<'_> {
    type Item = Slot;

    fn next(&mut self) -> Option<Slot> {
        while self.idx < self.map.cap {
            let i = self.idx;
            self.idx += 1;
            let ctrl = unsafe { *self.map.ctrl.add(i) };
            if ctrl < EMPTY {
                return Some(unsafe { *self.map.slots.add(i) });
            }
        }
        None
    }
}

/// Compile-time lookup table from a u32 key to a u32 payload. Small dense
/// key spaces get a direct-indexed array; sparse or large ones share the
/// swiss probing scheme above.
pub(crate) enum IndexTable {
    Dense(Box<[u32]>),
    Hash {
        ctrl: Box<[u8]>,
        slots: Box<[(u32, u32)]>,
        cap: usize,
    },
}

pub(crate) const NO_INDEX: u32 = u32::MAX;

impl IndexTable {
    pub(crate) fn build(pairs: &[(u32, u32)]) -> IndexTable {
        let max = pairs.iter().map(|p| p.0).max().unwrap_or(0) as usize;
        if max <= pairs.len() * 8 + 64 {
            let mut slots = vec![NO_INDEX; max + 1].into_boxed_slice();
            for &(k, v) in pairs {
                slots[k as usize] = v;
            }
            return IndexTable::Dense(slots);
        }

        let cap = (pairs.len() * 2).next_power_of_two().max(GROUP);
        let mut ctrl = vec![EMPTY; cap].into_boxed_slice();
        let mut slots = vec![(0u32, 0u32); cap].into_boxed_slice();
        for &(k, v) in pairs {
            let hash = hasher().hash_one(k);
            let groups = cap / GROUP;
            let mut g = (hash as usize >> 7) & (groups - 1);
            let mut step = 0;
            let idx = loop {
                let group =
                    unsafe { core::ptr::read_unaligned(ctrl.as_ptr().add(g * GROUP) as *const u64) };
                let m = match_empty(group);
                if m != 0 {
                    break g * GROUP + (m.trailing_zeros() as usize) / 8;
                }
                step += 1;
                assert!(step < groups, "index table over-full");
                g = (g + step) & (groups - 1);
            };
            ctrl[idx] = h2(hash);
            slots[idx] = (k, v);
        }
        IndexTable::Hash { ctrl, slots, cap }
    }

    #[inline(always)]
    pub(crate) fn lookup(&self, key: u32) -> Option<u32> {
        match self {
            IndexTable::Dense(slots) => match slots.get(key as usize) {
                Some(&v) if v != NO_INDEX => Some(v),
                _ => None,
            },
            IndexTable::Hash { ctrl, slots, cap } => {
                let hash = hasher().hash_one(key);
                let tag = h2(hash);
                let groups = cap / GROUP;
                let mut g = (hash as usize >> 7) & (groups - 1);
                let mut step = 0;
                loop {
                    let group = unsafe {
                        core::ptr::read_unaligned(ctrl.as_ptr().add(g * GROUP) as *const u64)
                    };
                    let mut m = match_byte(group, tag);
                    while m != 0 {
                        let idx = g * GROUP + (m.trailing_zeros() as usize) / 8;
                        let (k, v) = slots[idx];
                        if k == key {
                            return Some(v);
                        }
                        m &= m - 1;
                    }
                    if match_empty(group) != 0 {
                        return None;
                    }
                    step += 1;
                    if step >= groups {
                        return None;
                    }
                    g = (g + step) & (groups - 1);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_map_basics() {
        let mut arena = Arena::new();
        let ctx = KeyCtx {
            str_keys: false,
            src: &[],
        };
        let mut map = RawMap::new_in(&mut arena);
        let map = unsafe { map.as_mut() };

        for i in 0..100u64 {
            map.insert(i, i * 2, &ctx, &mut arena);
        }
        assert_eq!(map.len(), 100);
        for i in 0..100u64 {
            assert_eq!(map.get(&KeyProbe::Int(i), &ctx), Some(i * 2));
        }
        assert_eq!(map.get(&KeyProbe::Int(100), &ctx), None);

        // last one wins
        map.insert(7, 999, &ctx, &mut arena);
        assert_eq!(map.len(), 100);
        assert_eq!(map.get(&KeyProbe::Int(7), &ctx), Some(999));
    }

    #[test]
    fn test_str_map_projection() {
        let src = b"alphabetagamma";
        let mut arena = Arena::new();
        let ctx = KeyCtx {
            str_keys: true,
            src,
        };
        let mut map = RawMap::new_in(&mut arena);
        let map = unsafe { map.as_mut() };

        let alpha = crate::wire::Zc::new(0, 5);
        let beta = crate::wire::Zc::new(5, 4);
        map.insert(alpha.pack(), 1, &ctx, &mut arena);
        map.insert(beta.pack(), 2, &ctx, &mut arena);

        assert_eq!(map.get(&KeyProbe::Bytes(b"alpha"), &ctx), Some(1));
        assert_eq!(map.get(&KeyProbe::Bytes(b"beta"), &ctx), Some(2));
        assert_eq!(map.get(&KeyProbe::Bytes(b"gamma"), &ctx), None);
    }

    #[test]
    fn test_iter_yields_all() {
        let mut arena = Arena::new();
        let ctx = KeyCtx {
            str_keys: false,
            src: &[],
        };
        let mut map = RawMap::new_in(&mut arena);
        let map = unsafe { map.as_mut() };
        for i in 0..20u64 {
            map.insert(i, i + 100, &ctx, &mut arena);
        }
        let mut seen: Vec<u64> = map.iter().map(|s| s.key).collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..20u64).collect::<Vec<_>>());
    }

    #[test]
    fn test_index_table_dense_and_hash() {
        let dense_pairs: Vec<(u32, u32)> = (1..50).map(|i| (i, i + 1000)).collect();
        let t = IndexTable::build(&dense_pairs);
        assert!(matches!(t, IndexTable::Dense(_)));
        for &(k, v) in &dense_pairs {
            assert_eq!(t.lookup(k), Some(v));
        }
        assert_eq!(t.lookup(0), None);
        assert_eq!(t.lookup(999), None);

        let sparse_pairs: Vec<(u32, u32)> = (0..32).map(|i| (i * 100_000 + 3, i)).collect();
        let t = IndexTable::build(&sparse_pairs);
        assert!(matches!(t, IndexTable::Hash { .. }));
        for &(k, v) in &sparse_pairs {
            assert_eq!(t.lookup(k), Some(v));
        }
        assert_eq!(t.lookup(5), None);
    }
}
