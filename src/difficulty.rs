//! Bitcoin-style difficulty retargeting
//!
//! The adjuster collects block arrival timestamps into a window of
//! `adjustment_period` blocks. When the window fills, the target is scaled by
//! the ratio of observed to expected time, clamped to `[1/4, 4]`.
//!
//! The ratio is applied in fixed point: `trunc(ratio * 10_000)` multiplies
//! the 256-bit target, then the product is floor-divided by `10_000`. Peers
//! running other implementations retarget identically only if this
//! truncation is reproduced exactly, so do not round here.

use crate::types::Target;
use num_bigint::BigUint;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Fixed-point scale applied to the adjustment ratio
pub const RATIO_SCALE: u64 = 10_000;

/// Smallest allowed per-period adjustment ratio
pub const MIN_RATIO: f64 = 0.25;

/// Largest allowed per-period adjustment ratio
pub const MAX_RATIO: f64 = 4.0;

/// Default number of blocks between retargets
pub const DEFAULT_ADJUSTMENT_PERIOD: usize = 144;

/// Default target spacing between blocks (10 minutes)
pub const DEFAULT_TARGET_BLOCK_TIME_MS: u64 = 600_000;

/// Adjuster shared between the mining loop, gossip handling and the API
pub type SharedDifficulty = Arc<RwLock<DifficultyAdjuster>>;

/// Tunable parameters for the adjuster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DifficultyParams {
    pub adjustment_period: usize,
    pub target_block_time_ms: u64,
    /// Hardest allowed target
    pub min_target: Target,
    /// Easiest allowed target
    pub max_target: Target,
    pub initial_target: Target,
}

impl Default for DifficultyParams {
    fn default() -> Self {
        Self {
            adjustment_period: DEFAULT_ADJUSTMENT_PERIOD,
            target_block_time_ms: DEFAULT_TARGET_BLOCK_TIME_MS,
            min_target: Target::from_difficulty(32),
            max_target: Target::from_difficulty(1),
            initial_target: Target::from_difficulty(4),
        }
    }
}

/// Observability snapshot of the adjuster
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DifficultyStats {
    pub target: String,
    pub difficulty: u32,
    pub total_blocks: u64,
    pub window_blocks: usize,
    pub blocks_until_adjustment: usize,
    pub adjustment_period: usize,
    pub target_block_time_ms: u64,
    pub adjustments: u64,
    pub last_ratio: Option<f64>,
}

/// Persisted adjuster state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DifficultySnapshot {
    pub target: Target,
    pub total_blocks: u64,
    pub recent_timestamps: Vec<u64>,
}

/// Outcome of a single retarget
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adjustment {
    /// Ratio after clamping to `[MIN_RATIO, MAX_RATIO]`
    pub ratio: f64,
    /// `trunc(ratio * RATIO_SCALE)`
    pub scaled_ratio: u64,
    pub old_target: Target,
    pub new_target: Target,
}

/// Clamp an observed/expected time ratio to the allowed band
///
/// NaN and non-positive ratios clamp to [`MIN_RATIO`].
pub fn clamp_ratio(ratio: f64) -> f64 {
    if ratio.is_nan() {
        return MIN_RATIO;
    }
    ratio.clamp(MIN_RATIO, MAX_RATIO)
}

/// Scale `target` by `scaled_ratio / RATIO_SCALE`, then clamp
pub fn scale_target(target: &Target, scaled_ratio: u64, min: &Target, max: &Target) -> Target {
    let product = target.to_biguint() * BigUint::from(scaled_ratio);
    let scaled = Target::from_biguint(&(product / BigUint::from(RATIO_SCALE)));
    scaled.clamp(*min, *max)
}

/// Bitcoin-style difficulty state machine
#[derive(Debug, Clone)]
pub struct DifficultyAdjuster {
    params: DifficultyParams,
    target: Target,
    block_timestamps: Vec<u64>,
    total_blocks: u64,
    adjustments: u64,
    last_ratio: Option<f64>,
}

impl DifficultyAdjuster {
    /// Create an adjuster starting at the initial target
    pub fn new(params: DifficultyParams) -> Self {
        let target = params
            .initial_target
            .clamp(params.min_target, params.max_target);
        Self {
            block_timestamps: Vec::with_capacity(params.adjustment_period),
            params,
            target,
            total_blocks: 0,
            adjustments: 0,
            last_ratio: None,
        }
    }

    /// Wrap in the shared read-mostly lock
    pub fn shared(self) -> SharedDifficulty {
        Arc::new(RwLock::new(self))
    }

    /// Current target
    pub fn target(&self) -> Target {
        self.target
    }

    /// 64 lowercase hex chars
    pub fn target_hex(&self) -> String {
        self.target.to_hex()
    }

    /// Leading hex zeros in the target
    pub fn difficulty(&self) -> u32 {
        self.target.difficulty()
    }

    /// True iff `hash_hex`, read as a big-endian integer, is <= the target
    pub fn check_hash(&self, hash_hex: &str) -> bool {
        self.target.is_met_by_hex(hash_hex)
    }

    /// Total accepted blocks observed
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Parameters in use
    pub fn params(&self) -> &DifficultyParams {
        &self.params
    }

    /// Record an accepted block, retargeting when the window fills
    pub fn record_block(&mut self, timestamp_ms: u64) -> Option<Adjustment> {
        self.block_timestamps.push(timestamp_ms);
        self.total_blocks += 1;

        if self.block_timestamps.len() >= self.params.adjustment_period {
            self.adjust()
        } else {
            None
        }
    }

    /// Retarget over the current window and clear it
    ///
    /// Fewer than two timestamps clears the window without retargeting.
    pub fn adjust(&mut self) -> Option<Adjustment> {
        let window = std::mem::take(&mut self.block_timestamps);
        if window.len() < 2 {
            debug!("Skipping retarget with {} timestamps in window", window.len());
            return None;
        }

        let first = window[0] as i128;
        let last = window[window.len() - 1] as i128;
        let actual_ms = (last - first) as f64;
        let expected_ms = ((window.len() - 1) as u64)
            .saturating_mul(self.params.target_block_time_ms) as f64;

        let ratio = clamp_ratio(actual_ms / expected_ms);
        let scaled_ratio = (ratio * RATIO_SCALE as f64).trunc() as u64;

        let old_target = self.target;
        let new_target = scale_target(
            &old_target,
            scaled_ratio,
            &self.params.min_target,
            &self.params.max_target,
        );

        self.target = new_target;
        self.adjustments += 1;
        self.last_ratio = Some(ratio);

        info!(
            ratio = ratio,
            old_difficulty = old_target.difficulty(),
            new_difficulty = new_target.difficulty(),
            "Difficulty retargeted to {}",
            new_target
        );

        Some(Adjustment {
            ratio,
            scaled_ratio,
            old_target,
            new_target,
        })
    }

    /// Resume after restart
    ///
    /// Only the newest `adjustment_period` timestamps are kept; the target is
    /// clamped into the allowed band.
    pub fn restore_state(&mut self, target: Target, total_blocks: u64, recent_timestamps: &[u64]) {
        let keep = recent_timestamps.len().min(self.params.adjustment_period);
        self.target = target.clamp(self.params.min_target, self.params.max_target);
        self.total_blocks = total_blocks;
        self.block_timestamps = recent_timestamps[recent_timestamps.len() - keep..].to_vec();

        info!(
            total_blocks = total_blocks,
            window_blocks = keep,
            "Restored difficulty state at target {}",
            self.target
        );
    }

    /// Restore from a persisted snapshot
    pub fn restore_snapshot(&mut self, snapshot: &DifficultySnapshot) {
        self.restore_state(
            snapshot.target,
            snapshot.total_blocks,
            &snapshot.recent_timestamps,
        );
    }

    /// Capture state for persistence
    pub fn snapshot(&self) -> DifficultySnapshot {
        DifficultySnapshot {
            target: self.target,
            total_blocks: self.total_blocks,
            recent_timestamps: self.block_timestamps.clone(),
        }
    }

    /// Observability snapshot
    pub fn stats(&self) -> DifficultyStats {
        DifficultyStats {
            target: self.target_hex(),
            difficulty: self.difficulty(),
            total_blocks: self.total_blocks,
            window_blocks: self.block_timestamps.len(),
            blocks_until_adjustment: self
                .params
                .adjustment_period
                .saturating_sub(self.block_timestamps.len()),
            adjustment_period: self.params.adjustment_period,
            target_block_time_ms: self.params.target_block_time_ms,
            adjustments: self.adjustments,
            last_ratio: self.last_ratio,
        }
    }
}

impl Default for DifficultyAdjuster {
    fn default() -> Self {
        Self::new(DifficultyParams::default())
    }
}
