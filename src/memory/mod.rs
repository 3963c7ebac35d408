// SPDX-License-Identifier: MIT
//! Persistent tiered memory: episodic, semantic, and procedural.

pub mod crypto;
pub mod retention;
pub mod store;
pub mod types;
pub mod vector;

pub use store::MemoryStore;
pub use types::{Memory, MemoryKind, MemoryQuery, MemoryScope, MemoryStats};

use chrono::{DateTime, Utc};

/// Half-life of an untouched memory's strength.
const STRENGTH_HALF_LIFE_HOURS: f64 = 168.0;

/// Fraction of the remaining headroom recovered on each read.
const ACCESS_BOOST: f64 = 0.1;

/// Strength after a read: exponential decay over the idle gap, then a boost
/// toward 1.0 for the access itself. Clamped to [0, 1].
pub fn recompute_strength(
    previous: f64,
    last_accessed_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    let idle_hours = (now - last_accessed_at).num_seconds().max(0) as f64 / 3600.0;
    let decayed = previous * (-(std::f64::consts::LN_2) * idle_hours / STRENGTH_HALF_LIFE_HOURS).exp();
    let boosted = decayed + ACCESS_BOOST * (1.0 - decayed);
    boosted.clamp(0.0, 1.0)
}
