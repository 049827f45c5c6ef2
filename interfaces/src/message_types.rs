//! Message Types for PHY-MAC Communication
//! 
//! Defines the slot and uplink indications delivered by the PHY interface module
//! (and the decode layer sitting on top of it) to the MAC scheduler.

use common::types::{Rnti, SlotTime};
use serde::{Deserialize, Serialize};

use crate::InterfaceError;

/// Per-slot indication that drives the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotIndication {
    /// System frame number
    pub frame: u16,
    /// Slot within the frame
    pub slot: u16,
}

impl SlotIndication {
    /// Slot position carried by this indication
    pub fn time(&self) -> SlotTime {
        SlotTime::new(self.frame, self.slot)
    }
}

/// One detected PRACH preamble
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreambleInfo {
    /// Preamble index (0-63)
    pub preamble_index: u8,
    /// Estimated timing advance (TA command units)
    pub timing_advance: u16,
    /// Received preamble power in dB x10
    pub preamble_power: i32,
}

/// PRACH detection result for one RACH occasion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RachIndication {
    /// Slot the PRACH occasion was received in
    pub time: SlotTime,
    /// First symbol of the PRACH occasion (s_id)
    pub symbol_index: u8,
    /// Slot index of the occasion within the frame (t_id)
    pub slot_index: u8,
    /// Frequency-domain occasion index (f_id)
    pub freq_index: u8,
    /// SSB / beam the occasion is associated with
    pub beam_index: u8,
    /// Whether the preambles belong to a 2-step RA (MsgA) occasion
    pub msg_a: bool,
    /// Detected preambles
    pub preambles: Vec<PreambleInfo>,
}

/// HARQ-ACK value decoded from UCI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HarqAck {
    Ack,
    Nack,
    /// No PUCCH energy detected
    Dtx,
}

/// DL HARQ feedback carried on PUCCH/PUSCH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarqFeedbackIndication {
    /// UE the feedback belongs to
    pub rnti: Rnti,
    /// DL HARQ process id
    pub harq_pid: u8,
    /// Decoded acknowledgement
    pub value: HarqAck,
    /// PUCCH SNR in dB x10, when measured
    pub pucch_snr_x10: Option<i16>,
}

/// PUSCH decoding result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrcIndication {
    /// UE (or TC-RNTI during random access)
    pub rnti: Rnti,
    /// UL HARQ process id
    pub harq_pid: u8,
    /// CRC passed
    pub crc_ok: bool,
    /// No PUSCH energy detected
    pub dtx: bool,
    /// PUSCH SNR in dB x10
    pub snr_x10: i16,
    /// Received signal strength (PHY units)
    pub rssi: u16,
    /// Timing advance estimate (TA command units, 31 means no change)
    pub timing_advance: Option<u16>,
}

/// Content decoded from Msg3 / MsgA PUSCH
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg3Content {
    /// CCCH SDU carrying the UE contention resolution identity
    ContentionResolutionId([u8; 6]),
    /// C-RNTI MAC CE of an already connected UE
    CRnti(Rnti),
}

/// Successfully decoded Msg3 (or MsgA PUSCH)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Msg3Indication {
    /// TC-RNTI the transmission was granted to
    pub rnti: Rnti,
    /// Decoded content relevant for contention resolution
    pub content: Msg3Content,
}

/// Channel state information report
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CsiReport {
    /// CSI-RS resource indicator
    pub cri: u8,
    /// Rank indicator
    pub ri: u8,
    /// PMI wideband part
    pub pmi_x1: u8,
    /// PMI subband part
    pub pmi_x2: u8,
    /// Wideband CQI of the first transport block
    pub wb_cqi: u8,
    /// CQI table in use (0: table 1, 1: table 2)
    pub cqi_table: u8,
    /// Strongest reported SSB RSRP in dBm
    pub ssb_rsrp_dbm: Option<i16>,
}

/// CSI report for one UE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsiIndication {
    pub rnti: Rnti,
    pub report: CsiReport,
}

/// Scheduling request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrIndication {
    pub rnti: Rnti,
    /// Positive SR detected
    pub sr: bool,
}

/// Buffer status report (UL) decoded from a MAC CE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BsrIndication {
    pub rnti: Rnti,
    /// Bytes pending at the UE
    pub buffer_bytes: u32,
}

/// Power headroom report decoded from a MAC CE
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhrIndication {
    pub rnti: Rnti,
    /// Power headroom in dB
    pub ph_db: i8,
    /// Nominal maximum UE transmit power in dBm
    pub pcmax_dbm: i8,
}

/// Downlink buffer status reported by the upper layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlBufferIndication {
    pub rnti: Rnti,
    /// Bytes waiting for transmission
    pub pending_bytes: u32,
}

/// SRS-based UL channel feedback
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SrsIndication {
    pub rnti: Rnti,
    /// UL rank indicator
    pub ul_ri: u8,
    /// Transmitted precoding matrix indicator
    pub tpmi: u8,
}

/// Every asynchronous event the scheduler consumes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UplinkIndication {
    Rach(RachIndication),
    HarqFeedback(HarqFeedbackIndication),
    Crc(CrcIndication),
    Msg3(Msg3Indication),
    MsgAPusch(Msg3Indication),
    Csi(CsiIndication),
    Sr(SrIndication),
    Bsr(BsrIndication),
    Phr(PhrIndication),
    DlBuffer(DlBufferIndication),
    Srs(SrsIndication),
}

impl UplinkIndication {
    /// RNTI the indication is keyed by, if any
    pub fn rnti(&self) -> Option<Rnti> {
        match self {
            Self::Rach(_) => None,
            Self::HarqFeedback(ind) => Some(ind.rnti),
            Self::Crc(ind) => Some(ind.rnti),
            Self::Msg3(ind) | Self::MsgAPusch(ind) => Some(ind.rnti),
            Self::Csi(ind) => Some(ind.rnti),
            Self::Sr(ind) => Some(ind.rnti),
            Self::Bsr(ind) => Some(ind.rnti),
            Self::Phr(ind) => Some(ind.rnti),
            Self::DlBuffer(ind) => Some(ind.rnti),
            Self::Srs(ind) => Some(ind.rnti),
        }
    }

    /// Decode an indication from its JSON form
    pub fn from_json(data: &str) -> Result<Self, InterfaceError> {
        Ok(serde_json::from_str(data)?)
    }

    /// Encode the indication as JSON
    pub fn to_json(&self) -> Result<String, InterfaceError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    
    #[test]
    fn test_indication_serialization() {
        let ind = UplinkIndication::Rach(RachIndication {
            time: SlotTime::new(12, 9),
            symbol_index: 0,
            slot_index: 9,
            freq_index: 0,
            beam_index: 0,
            msg_a: false,
            preambles: vec![PreambleInfo { preamble_index: 17, timing_advance: 3, preamble_power: -100 }],
        });
        
        let serialized = ind.to_json().unwrap();
        let deserialized = UplinkIndication::from_json(&serialized).unwrap();
        
        assert_eq!(ind, deserialized);
        assert_eq!(deserialized.rnti(), None);
    }

    #[test]
    fn test_indication_rnti() {
        let ind = UplinkIndication::Msg3(Msg3Indication {
            rnti: Rnti(0x4601),
            content: Msg3Content::ContentionResolutionId([1, 2, 3, 4, 5, 6]),
        });
        assert_eq!(ind.rnti(), Some(Rnti(0x4601)));
    }

    #[test]
    fn test_malformed_indication_is_rejected() {
        assert!(UplinkIndication::from_json("{\"Bogus\":1}").is_err());
    }
}
