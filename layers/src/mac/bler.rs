//! BLER-driven Link Adaptation
//!
//! Tracks a filtered block error rate per direction and steps the MCS up or
//! down against configured thresholds.

use common::utils::time::frame_diff;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Minimum number of frames between two MCS updates
pub const BLER_UPDATE_FRAMES: u16 = 10;
/// Weight of the previous BLER estimate in the exponential filter
pub const BLER_FILTER: f32 = 0.9;

/// Link-adaptation thresholds of one direction
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlerOptions {
    /// Step MCS down above this BLER
    pub upper: f64,
    /// Step MCS up below this BLER
    pub lower: f64,
    /// MCS cap
    pub max_mcs: u8,
    /// Number of HARQ rounds before a transport block is dropped
    pub harq_round_max: u8,
}

impl Default for BlerOptions {
    fn default() -> Self {
        Self {
            upper: 0.15,
            lower: 0.05,
            max_mcs: 28,
            harq_round_max: 4,
        }
    }
}

/// Rolling BLER state of one direction
#[derive(Debug, Clone, Default)]
pub struct BlerStats {
    initialised: bool,
    last_frame: u16,
    bler: f32,
    mcs: u8,
    /// Round histogram at the last update
    rounds: [u64; 8],
}

impl BlerStats {
    /// Create a fresh tracker; it initialises itself on first use
    pub fn new() -> Self {
        Self::default()
    }

    /// Current filtered BLER
    pub fn bler(&self) -> f32 {
        self.bler
    }

    /// MCS chosen at the last update
    pub fn mcs(&self) -> u8 {
        self.mcs
    }

    /// Forget all history
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// MCS to use for a new transmission at `frame`.
    ///
    /// `rounds` is the cumulative per-round transmission histogram of the
    /// direction and `max_mcs` the cap from CSI (or the table limit).
    pub fn update_mcs(&mut self, options: &BlerOptions, rounds: &[u64; 8], max_mcs: u8, frame: u16) -> u8 {
        let max_mcs = max_mcs.min(options.max_mcs);

        if !self.initialised {
            self.initialised = true;
            self.last_frame = frame;
            self.mcs = max_mcs;
            self.bler = ((options.lower + options.upper) / 2.0) as f32;
            self.rounds = *rounds;
        }

        let old_mcs = self.mcs.min(max_mcs);
        if frame_diff(frame, self.last_frame) < BLER_UPDATE_FRAMES {
            return old_mcs;
        }

        let num_sched = rounds[0].saturating_sub(self.rounds[0]);
        let num_retx = rounds[1].saturating_sub(self.rounds[1]);
        let window_bler = if num_sched > 0 {
            num_retx as f32 / num_sched as f32
        } else {
            self.bler
        };
        self.bler = BLER_FILTER * self.bler + (1.0 - BLER_FILTER) * window_bler;

        let mut new_mcs = old_mcs;
        if (self.bler as f64) < options.lower && old_mcs < max_mcs && num_sched > 3 {
            new_mcs += 1;
        } else if ((self.bler as f64) > options.upper && old_mcs > 6) || (num_sched <= 3 && old_mcs > 9) {
            new_mcs -= 1;
        }

        if new_mcs != old_mcs {
            debug!(
                "BLER {:.3} over {} transmissions ({} retx): MCS {} -> {}",
                self.bler, num_sched, num_retx, old_mcs, new_mcs
            );
        }

        self.last_frame = frame;
        self.mcs = new_mcs;
        self.rounds = *rounds;
        new_mcs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_use_starts_at_cap() {
        let mut stats = BlerStats::new();
        let options = BlerOptions { max_mcs: 20, ..Default::default() };
        assert_eq!(stats.update_mcs(&options, &[0; 8], 28, 0), 20);
        assert!((stats.bler() - 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_no_update_within_window() {
        let mut stats = BlerStats::new();
        let options = BlerOptions::default();
        stats.update_mcs(&options, &[0; 8], 28, 100);
        let rounds = [100, 90, 80, 0, 0, 0, 0, 0];
        assert_eq!(stats.update_mcs(&options, &rounds, 28, 105), 28);
    }

    #[test]
    fn test_high_bler_steps_down() {
        let mut stats = BlerStats::new();
        let options = BlerOptions::default();
        stats.update_mcs(&options, &[0; 8], 28, 0);
        // Every transmission needs a retransmission: BLER climbs fast
        let mut rounds = [0u64; 8];
        let mut mcs = 28;
        for step in 1..=5u16 {
            rounds[0] += 50;
            rounds[1] += 50;
            mcs = stats.update_mcs(&options, &rounds, 28, step * 10);
        }
        assert!(mcs < 28);
    }

    #[test]
    fn test_low_bler_steps_up_to_cap() {
        let mut stats = BlerStats::new();
        let options = BlerOptions::default();
        // CSI restricts MCS to 10 first
        stats.update_mcs(&options, &[0; 8], 10, 0);
        let mut rounds = [0u64; 8];
        let mut mcs = 0;
        for step in 1..=60u16 {
            rounds[0] += 100;
            mcs = stats.update_mcs(&options, &rounds, 12, step * 10);
        }
        assert_eq!(mcs, 12);
    }

    #[test]
    fn test_update_window_wraps_over_sfn() {
        let mut stats = BlerStats::new();
        let options = BlerOptions::default();
        stats.update_mcs(&options, &[0; 8], 28, 1020);
        // 1020 -> 4 is 8 frames: still inside the window
        let rounds = [1000, 1000, 0, 0, 0, 0, 0, 0];
        assert_eq!(stats.update_mcs(&options, &rounds, 28, 4), 28);
        // 1020 -> 6 is 10 frames: update happens and BLER rises
        stats.update_mcs(&options, &rounds, 28, 6);
        assert!(stats.bler() > 0.1);
    }
}
