//! Common Types for 5G GNodeB
//! 
//! Defines fundamental types used throughout the protocol stack

use serde::{Deserialize, Serialize};
use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::FromPrimitive;
use thiserror::Error;

use crate::utils::time::SFN_PERIOD;

/// Errors raised while building common types from raw values
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Invalid subcarrier spacing: {0} kHz")]
    InvalidScs(u32),

    #[error("Invalid bandwidth: {0} MHz")]
    InvalidBandwidth(u32),
}

/// Radio Network Temporary Identifier (RNTI)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rnti(pub u16);

impl Rnti {
    /// Lowest C-RNTI value
    pub const MIN_C_RNTI: u16 = 0x0001;
    /// Highest C-RNTI value (38.321 Table 7.1-1)
    pub const MAX_C_RNTI: u16 = 0xFFEF;

    /// Create a new RNTI
    pub fn new(value: u16) -> Self {
        Self(value)
    }
    
    /// Get the RNTI value
    pub fn value(&self) -> u16 {
        self.0
    }

    /// Whether the value lies in the C-RNTI / TC-RNTI range
    pub fn is_c_rnti(&self) -> bool {
        (Self::MIN_C_RNTI..=Self::MAX_C_RNTI).contains(&self.0)
    }
}

impl std::fmt::Display for Rnti {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04x}", self.0)
    }
}

/// Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellId(pub u16);

/// Physical Cell Identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pci(pub u16);

impl Pci {
    /// Maximum valid PCI value (0-1007)
    pub const MAX: u16 = 1007;
    
    /// Create a new PCI with validation
    pub fn new(value: u16) -> Option<Self> {
        if value <= Self::MAX {
            Some(Self(value))
        } else {
            None
        }
    }
}

/// Subcarrier spacing values in kHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum SubcarrierSpacing {
    /// 15 kHz
    Scs15 = 15,
    /// 30 kHz
    Scs30 = 30,
    /// 60 kHz
    Scs60 = 60,
    /// 120 kHz
    Scs120 = 120,
    /// 240 kHz
    Scs240 = 240,
}

impl SubcarrierSpacing {
    /// Parse from a value in kHz
    pub fn from_khz(khz: u32) -> Result<Self, TypeError> {
        Self::from_u32(khz).ok_or(TypeError::InvalidScs(khz))
    }

    /// Numerology index (mu)
    pub fn numerology(&self) -> u8 {
        match self {
            Self::Scs15 => 0,
            Self::Scs30 => 1,
            Self::Scs60 => 2,
            Self::Scs120 => 3,
            Self::Scs240 => 4,
        }
    }

    /// Number of slots in a 1 ms subframe
    pub fn slots_per_subframe(&self) -> u16 {
        1 << self.numerology()
    }

    /// Number of slots in a 10 ms frame
    pub fn slots_per_frame(&self) -> u16 {
        10 * self.slots_per_subframe()
    }

    /// HARQ round-trip budget in slots: 8 subframes worth of slots
    pub fn harq_rtt_slots(&self) -> u16 {
        8 * self.slots_per_subframe()
    }
}

/// Bandwidth values in MHz
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bandwidth {
    /// 5 MHz
    Bw5,
    /// 10 MHz
    Bw10,
    /// 15 MHz
    Bw15,
    /// 20 MHz
    Bw20,
    /// 25 MHz
    Bw25,
    /// 30 MHz
    Bw30,
    /// 40 MHz
    Bw40,
    /// 50 MHz
    Bw50,
    /// 60 MHz
    Bw60,
    /// 80 MHz
    Bw80,
    /// 100 MHz
    Bw100,
}

impl Bandwidth {
    /// Parse from a value in MHz
    pub fn from_mhz(mhz: u32) -> Result<Self, TypeError> {
        let bw = match mhz {
            5 => Bandwidth::Bw5,
            10 => Bandwidth::Bw10,
            15 => Bandwidth::Bw15,
            20 => Bandwidth::Bw20,
            25 => Bandwidth::Bw25,
            30 => Bandwidth::Bw30,
            40 => Bandwidth::Bw40,
            50 => Bandwidth::Bw50,
            60 => Bandwidth::Bw60,
            80 => Bandwidth::Bw80,
            100 => Bandwidth::Bw100,
            _ => return Err(TypeError::InvalidBandwidth(mhz)),
        };
        Ok(bw)
    }

    /// Get bandwidth in Hz
    pub fn as_hz(&self) -> u32 {
        match self {
            Bandwidth::Bw5 => 5_000_000,
            Bandwidth::Bw10 => 10_000_000,
            Bandwidth::Bw15 => 15_000_000,
            Bandwidth::Bw20 => 20_000_000,
            Bandwidth::Bw25 => 25_000_000,
            Bandwidth::Bw30 => 30_000_000,
            Bandwidth::Bw40 => 40_000_000,
            Bandwidth::Bw50 => 50_000_000,
            Bandwidth::Bw60 => 60_000_000,
            Bandwidth::Bw80 => 80_000_000,
            Bandwidth::Bw100 => 100_000_000,
        }
    }
}

/// Link direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// gNB to UE
    Downlink,
    /// UE to gNB
    Uplink,
}

/// Modulation schemes used by PDSCH/PUSCH
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Serialize, Deserialize)]
pub enum ModulationScheme {
    Qpsk = 2,
    Qam16 = 4,
    Qam64 = 6,
    Qam256 = 8,
}

impl ModulationScheme {
    /// Modulation order Qm
    pub fn bits_per_symbol(&self) -> u8 {
        *self as u8
    }

    /// Build from a modulation order
    pub fn from_order(qm: u8) -> Option<Self> {
        Self::from_u8(qm)
    }
}

/// Frame/slot position within the SFN cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct SlotTime {
    /// System frame number (0-1023)
    pub frame: u16,
    /// Slot within the frame
    pub slot: u16,
}

impl SlotTime {
    /// Create a new slot position
    pub const fn new(frame: u16, slot: u16) -> Self {
        Self { frame, slot }
    }

    /// Absolute slot index within the SFN cycle
    pub fn abs_slot(&self, slots_per_frame: u16) -> u32 {
        self.frame as u32 * slots_per_frame as u32 + self.slot as u32
    }

    /// Rebuild a slot position from an absolute slot index (wrapped to the SFN cycle)
    pub fn from_abs_slot(abs_slot: u32, slots_per_frame: u16) -> Self {
        let period = SFN_PERIOD as u32 * slots_per_frame as u32;
        let abs_slot = abs_slot % period;
        Self {
            frame: (abs_slot / slots_per_frame as u32) as u16,
            slot: (abs_slot % slots_per_frame as u32) as u16,
        }
    }

    /// Position `n` slots later, wrapping over the SFN cycle
    pub fn add_slots(&self, n: u32, slots_per_frame: u16) -> Self {
        Self::from_abs_slot(self.abs_slot(slots_per_frame) + n, slots_per_frame)
    }

    /// Number of slots from `self` forward to `later`, modulo the SFN cycle
    pub fn slots_until(&self, later: SlotTime, slots_per_frame: u16) -> u32 {
        let period = SFN_PERIOD as u32 * slots_per_frame as u32;
        let from = self.abs_slot(slots_per_frame);
        let to = later.abs_slot(slots_per_frame);
        (to + period - from) % period
    }

    /// Whether `self` is at or after `deadline`.
    ///
    /// Positions are compared on the wrapping SFN cycle: a deadline counts as
    /// reached when it lies no more than half a cycle behind `self`.
    pub fn has_reached(&self, deadline: SlotTime, slots_per_frame: u16) -> bool {
        let period = SFN_PERIOD as u32 * slots_per_frame as u32;
        deadline.slots_until(*self, slots_per_frame) < period / 2
    }
}

impl std::fmt::Display for SlotTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.frame, self.slot)
    }
}
