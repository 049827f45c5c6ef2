//! Common Utilities
//! 
//! Provides utility functions used across the GNodeB implementation

use tracing::trace;

/// Calculate resource blocks from bandwidth and subcarrier spacing
pub fn calculate_nrb(bandwidth_hz: u32, scs_khz: u16) -> u16 {
    // Each RB has 12 subcarriers
    const SUBCARRIERS_PER_RB: u32 = 12;
    
    let scs_hz = scs_khz as u32 * 1000;
    let total_subcarriers = bandwidth_hz / scs_hz;
    let nrb = total_subcarriers / SUBCARRIERS_PER_RB;
    
    trace!("Calculated {} RBs for {}Hz bandwidth with {}kHz SCS", 
           nrb, bandwidth_hz, scs_khz);
    
    nrb as u16
}

/// Time utilities for slot/frame calculations
pub mod time {
    use crate::types::SubcarrierSpacing;

    /// Number of system frames before the SFN wraps
    pub const SFN_PERIOD: u16 = 1024;

    /// Slot duration in microseconds for different SCS
    pub fn slot_duration_us(scs: SubcarrierSpacing) -> u32 {
        match scs {
            SubcarrierSpacing::Scs15 => 1000,    // 1 ms
            SubcarrierSpacing::Scs30 => 500,     // 0.5 ms
            SubcarrierSpacing::Scs60 => 250,     // 0.25 ms
            SubcarrierSpacing::Scs120 => 125,    // 0.125 ms
            SubcarrierSpacing::Scs240 => 62,     // 0.0625 ms (approximated)
        }
    }

    /// Frames elapsed from `earlier` to `later`, wrapping over the SFN period
    pub fn frame_diff(later: u16, earlier: u16) -> u16 {
        (later + SFN_PERIOD - earlier % SFN_PERIOD) % SFN_PERIOD
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SubcarrierSpacing;
    
    #[test]
    fn test_calculate_nrb() {
        // 20 MHz bandwidth with 30 kHz SCS
        assert_eq!(calculate_nrb(20_000_000, 30), 55);
        
        // 100 MHz bandwidth with 30 kHz SCS
        assert_eq!(calculate_nrb(100_000_000, 30), 277);
    }
    
    #[test]
    fn test_slot_duration() {
        assert_eq!(time::slot_duration_us(SubcarrierSpacing::Scs15), 1000);
        assert_eq!(time::slot_duration_us(SubcarrierSpacing::Scs30), 500);
        assert_eq!(time::slot_duration_us(SubcarrierSpacing::Scs120), 125);
    }

    #[test]
    fn test_frame_diff_wraps() {
        assert_eq!(time::frame_diff(5, 3), 2);
        assert_eq!(time::frame_diff(2, 1020), 6);
        assert_eq!(time::frame_diff(7, 7), 0);
    }
}
