//! Warm-pool size reconciliation
//!
//! Pure arithmetic over pool bounds; the update cascade turns the delta into
//! fan-out work. Claimed instances are never part of a delta: only the
//! unclaimed warm pool grows or shrinks.

use serde::{Deserialize, Serialize};

/// Reconciliation outcome: how many pooled instances to create or destroy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolDelta {
    pub create: u32,
    pub delete: u32,
}

/// Desired number of unclaimed instances for the given bounds.
///
/// `max == 0` means the pool is unbounded and only `min` applies; otherwise
/// the claimed instances count against the total capacity.
pub fn desired_size(min: u32, max: u32, claimed: u32) -> u32 {
    if max == 0 {
        min
    } else {
        min.min(max.saturating_sub(claimed))
    }
}

/// Delta between the desired pool sizes before and after a bounds change.
pub fn delta(old_min: u32, new_min: u32, old_max: u32, new_max: u32, claimed: u32) -> PoolDelta {
    let old = desired_size(old_min, old_max, claimed);
    let new = desired_size(new_min, new_max, claimed);
    PoolDelta {
        create: new.saturating_sub(old),
        delete: old.saturating_sub(new),
    }
}
