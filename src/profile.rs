//! Parse profiles for profile-guided recompilation.
//!
//! A [`Profile`] carries one atomic counter per (type, field) plus a parse
//! counter per type. Install it on [`UnmarshalOptions`](crate::UnmarshalOptions)
//! with a sampling rate; `Type::recompile` then derives cold hints for
//! fields that were rarely populated in the sampled parses.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::tables::{Library, TypeId};

/// Fields set in fewer than 1 in 16 observed parses of their message are
/// hinted cold.
const COLD_DENOMINATOR: u64 = 16;
/// Minimum sampled parses before a field may be called cold.
const MIN_OBSERVATIONS: u64 = 16;

pub(crate) struct TypeCounters {
    pub parses: AtomicU64,
    pub fields: Box<[AtomicU64]>,
}

pub(crate) struct ProfileData {
    pub types: Box<[TypeCounters]>,
    rng: AtomicU64,
}

/// Per-field parse counters for one compiled library. Clonable handle;
/// clones share the counters.
#[derive(Clone)]
pub struct Profile {
    pub(crate) data: Arc<ProfileData>,
}

impl Profile {
    pub(crate) fn for_library(lib: &Library) -> Profile {
        let types = lib
            .types
            .iter()
            .map(|ty| TypeCounters {
                parses: AtomicU64::new(0),
                fields: (0..ty.fields.len()).map(|_| AtomicU64::new(0)).collect(),
            })
            .collect();
        Profile {
            data: Arc::new(ProfileData {
                types,
                rng: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
            }),
        }
    }

    /// One xorshift64 step deciding whether this parse is recorded.
    pub(crate) fn sample(&self, rate: f64) -> bool {
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        let drawn = self
            .data
            .rng
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |mut x| {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                Some(x)
            })
            .unwrap_or(0);
        (drawn >> 11) as f64 / (1u64 << 53) as f64 <= rate
    }

    #[inline(always)]
    pub(crate) fn record_parse(&self, ty: TypeId) {
        self.data.types[ty as usize]
            .parses
            .fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_field(&self, ty: TypeId, field: u32) {
        self.data.types[ty as usize].fields[field as usize].fetch_add(1, Ordering::Relaxed);
    }

    /// Cold hint: the field was populated in under 1/16 of sampled parses.
    pub(crate) fn is_cold(&self, ty: TypeId, field: u32) -> bool {
        let Some(counters) = self.data.types.get(ty as usize) else {
            return false;
        };
        let parses = counters.parses.load(Ordering::Relaxed);
        if parses < MIN_OBSERVATIONS {
            return false;
        }
        let sets = counters.fields[field as usize].load(Ordering::Relaxed);
        sets * COLD_DENOMINATOR < parses
    }

    /// Sampled parse count for the library's root-reachable type graph.
    pub fn observed_parses(&self) -> u64 {
        self.data
            .types
            .iter()
            .map(|t| t.parses.load(Ordering::Relaxed))
            .sum()
    }
}

impl core::fmt::Debug for Profile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Profile")
            .field("types", &self.data.types.len())
            .field("observed_parses", &self.observed_parses())
            .finish()
    }
}
