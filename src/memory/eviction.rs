//! Eviction ordering for resident objects
//!
//! Candidates are ordered most-evictable first. Locked candidates always
//! sort after unlocked ones; among unlocked candidates the active
//! [`EvictionPolicy`] decides:
//!
//! - `SizeAware`: the tightest sufficient fit (smallest `size - needed` that
//!   is non-negative) comes first; if nothing is large enough, the candidate
//!   with the smallest deficit comes first.
//! - `Recency`: least recently used first.
//!
//! Ordering works on [`EvictionCandidate`] snapshots rather than on live
//! objects, so the comparison stays a total order even while the compute
//! layer keeps touching and pinning objects.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::resident::ResidentId;

/// Strategy used to pick eviction victims
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Evict the object whose footprint best fits the request
    #[default]
    SizeAware,
    /// Evict the least recently used object
    Recency,
}

impl EvictionPolicy {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "size_aware" | "size-aware" | "min_evict" | "min-evict" => {
                Some(EvictionPolicy::SizeAware)
            }
            "recency" | "lru" => Some(EvictionPolicy::Recency),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EvictionPolicy::SizeAware => "size_aware",
            EvictionPolicy::Recency => "recency",
        }
    }

    /// Compare two candidates; `Ordering::Less` means `a` is evicted before `b`
    pub fn compare(&self, a: &EvictionCandidate, b: &EvictionCandidate, needed: usize) -> Ordering {
        match (a.locked, b.locked) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            (false, false) => match self {
                EvictionPolicy::SizeAware => fit_key(a.size, needed).cmp(&fit_key(b.size, needed)),
                EvictionPolicy::Recency => a.last_access.cmp(&b.last_access),
            },
        }
    }

    /// Sort candidates most-evictable first
    pub fn order(&self, candidates: &mut [EvictionCandidate], needed: usize) {
        candidates.sort_by(|a, b| self.compare(a, b, needed).then(a.id.cmp(&b.id)));
    }
}

/// (0, surplus) for objects that cover the request, (1, deficit) otherwise
fn fit_key(size: usize, needed: usize) -> (u8, usize) {
    if size >= needed {
        (0, size - needed)
    } else {
        (1, needed - size)
    }
}

/// Point-in-time view of a resident object used for ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub id: ResidentId,
    pub locked: bool,
    pub size: usize,
    pub last_access: u64,
}
