//! Northbound Telemetry and Control Messages
//! 
//! Plain counters sampled by the external controller agent, and the simple
//! scheduling-policy updates it may push back.

use common::types::{Direction, Rnti, SlotTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::InterfaceError;

/// Per-direction MAC counters of one UE
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionCounters {
    /// Transmissions per HARQ round
    pub rounds: [u64; 8],
    /// Transport blocks lost after the last round
    pub errors: u64,
    /// Transport blocks dropped on the first NACK with HARQ disabled
    pub harq_disabled_drops: u64,
    /// Bytes delivered
    pub total_bytes: u64,
    /// PRBs granted for new transmissions
    pub total_rbs: u64,
    /// PRBs granted for retransmissions
    pub total_rbs_retx: u64,
    /// Filtered block error rate
    pub bler: f32,
    /// MCS chosen by link adaptation
    pub mcs: u8,
}

/// Counters of one connected UE
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UeTelemetry {
    pub rnti: Rnti,
    pub uid: u16,
    pub dl: DirectionCounters,
    pub ul: DirectionCounters,
    /// PUSCH DTX occurrences
    pub ulsch_dtx: u32,
    /// PUCCH format 0 DTX occurrences
    pub pucch0_dtx: u32,
    /// Last PUSCH SNR in dB x10
    pub pusch_snr_x10: i16,
    /// Average reported SSB RSRP in dBm
    pub avg_rsrp_dbm: Option<i32>,
    /// Radio link failure detected
    pub link_failure: bool,
}

/// Cell-wide counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CellTelemetry {
    /// Slot the snapshot was taken in
    pub time: SlotTime,
    pub active_ues: u16,
    /// PRBs offered to the scheduler
    pub total_prb_aggregate: u64,
    /// PRBs granted
    pub used_prb_aggregate: u64,
    pub ra_attempts: u64,
    pub ra_successes: u64,
    pub ra_failures: u64,
    pub harq_pool_exhausted: u64,
    pub ra_pool_exhausted: u64,
    pub registry_full: u64,
    pub resource_conflicts: u64,
}

impl CellTelemetry {
    /// Fraction of offered PRBs that were granted
    pub fn prb_utilization(&self) -> f64 {
        if self.total_prb_aggregate == 0 {
            0.0
        } else {
            self.used_prb_aggregate as f64 / self.total_prb_aggregate as f64
        }
    }
}

/// Complete telemetry sample
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub cell: CellTelemetry,
    pub ues: Vec<UeTelemetry>,
}

impl TelemetrySnapshot {
    /// Encode the snapshot as JSON
    pub fn to_json(&self) -> Result<String, InterfaceError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Scheduling-policy update requested by the controller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlAction {
    /// Never allocate these UL PRBs
    SetUlPrbBlacklist { prbs: Vec<u16> },
    /// Make every UL PRB usable again
    ClearUlPrbBlacklist,
    /// Replace the link-adaptation thresholds of one direction
    SetBlerOptions {
        direction: Direction,
        upper: f64,
        lower: f64,
        max_mcs: u8,
    },
}

impl ControlAction {
    /// Decode an action from its JSON form
    pub fn from_json(data: &str) -> Result<Self, InterfaceError> {
        let action: ControlAction = serde_json::from_str(data)?;
        debug!("Decoded control action: {:?}", action);
        action.validate()?;
        Ok(action)
    }

    /// Reject actions whose parameters cannot be applied
    pub fn validate(&self) -> Result<(), InterfaceError> {
        match self {
            Self::SetBlerOptions { upper, lower, .. } if !(0.0..=1.0).contains(lower) || upper < lower || *upper > 1.0 => {
                Err(InterfaceError::InvalidConfig(format!(
                    "BLER thresholds out of order: lower={} upper={}", lower, upper
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prb_utilization() {
        let cell = CellTelemetry {
            total_prb_aggregate: 200,
            used_prb_aggregate: 50,
            ..Default::default()
        };
        assert!((cell.prb_utilization() - 0.25).abs() < f64::EPSILON);
        assert_eq!(CellTelemetry::default().prb_utilization(), 0.0);
    }

    #[test]
    fn test_control_action_decoding() {
        let action = ControlAction::from_json(r#"{"SetUlPrbBlacklist":{"prbs":[0,1,2]}}"#).unwrap();
        assert_eq!(action, ControlAction::SetUlPrbBlacklist { prbs: vec![0, 1, 2] });
        assert_eq!(ControlAction::from_json(r#""ClearUlPrbBlacklist""#).unwrap(), ControlAction::ClearUlPrbBlacklist);
    }

    #[test]
    fn test_invalid_bler_thresholds_rejected() {
        let json = r#"{"SetBlerOptions":{"direction":"Downlink","upper":0.05,"lower":0.2,"max_mcs":28}}"#;
        assert!(matches!(ControlAction::from_json(json), Err(InterfaceError::InvalidConfig(_))));
    }

    #[test]
    fn test_snapshot_serialization() {
        let snapshot = TelemetrySnapshot {
            cell: CellTelemetry { active_ues: 1, ..Default::default() },
            ues: vec![],
        };
        let json = snapshot.to_json().unwrap();
        let decoded: TelemetrySnapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, snapshot);
    }
}
