//! MAC Configuration
//!
//! Cell-wide scheduler parameters. Every field has a default so partial
//! configuration files deserialize cleanly.

use common::types::{Bandwidth, CellId, SubcarrierSpacing};
use common::utils::calculate_nrb;
use serde::{Deserialize, Serialize};

use super::beam::MAX_PRBS;
use super::bler::BlerOptions;
use super::harq::{DisabledHarqAccounting, MAX_HARQ_PROCESSES};
use super::ra::PRACH_UL_CARRIERS;
use super::MacError;

/// MAC layer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MacConfig {
    /// Cell ID
    pub cell_id: CellId,
    /// Subcarrier spacing
    pub scs: SubcarrierSpacing,
    /// Channel bandwidth
    pub bandwidth: Bandwidth,
    /// PRBs of the active BWP, derived from the bandwidth when absent
    pub num_prbs: Option<u16>,
    /// Maximum number of UEs
    pub max_ues: usize,
    pub harq: HarqConfig,
    pub dl_bler: BlerOptions,
    pub ul_bler: BlerOptions,
    pub ra: RaConfig,
    pub beam: BeamConfig,
    pub power: PowerControlConfig,
    /// Smallest UL grant handed out without a buffer report
    pub min_grant_prb: u16,
    pub min_grant_mcs: u8,
    pub max_dl_ues_per_slot: usize,
    pub max_ul_ues_per_slot: usize,
    /// Frames without an UL grant after which one is forced
    pub ulsch_max_frame_inactivity: u16,
    /// SRS periodicity in slots (0 disables SRS)
    pub srs_period_slots: u16,
    /// Periodic CSI reporting in slots (0 disables CSI)
    pub csi_period_slots: u16,
    pub pdsch_symbols: u8,
    pub pusch_symbols: u8,
    pub dmrs_re_per_prb: u16,
    pub dl_256qam: bool,
    pub ul_256qam: bool,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            cell_id: CellId(1),
            scs: SubcarrierSpacing::Scs30,
            bandwidth: Bandwidth::Bw20,
            num_prbs: None,
            max_ues: 32,
            harq: HarqConfig::default(),
            dl_bler: BlerOptions::default(),
            ul_bler: BlerOptions { max_mcs: 9, ..BlerOptions::default() },
            ra: RaConfig::default(),
            beam: BeamConfig::default(),
            power: PowerControlConfig::default(),
            min_grant_prb: 5,
            min_grant_mcs: 9,
            max_dl_ues_per_slot: 4,
            max_ul_ues_per_slot: 4,
            ulsch_max_frame_inactivity: 10,
            srs_period_slots: 80,
            csi_period_slots: 40,
            pdsch_symbols: 12,
            pusch_symbols: 13,
            dmrs_re_per_prb: 12,
            dl_256qam: false,
            ul_256qam: false,
        }
    }
}

impl MacConfig {
    /// PRBs available for scheduling
    pub fn prbs(&self) -> u16 {
        self.num_prbs.unwrap_or_else(|| {
            let scs_khz = self.scs as u16;
            calculate_nrb(self.bandwidth.as_hz(), scs_khz)
        })
    }

    pub fn slots_per_frame(&self) -> u16 {
        self.scs.slots_per_frame()
    }

    /// Slots between a grant and its HARQ feedback deadline
    pub fn harq_rtt_slots(&self) -> u16 {
        self.harq.rtt_slots.unwrap_or_else(|| self.scs.harq_rtt_slots())
    }

    /// Reject configurations the scheduler cannot size its pools for
    pub fn validate(&self) -> Result<(), MacError> {
        let invalid = |msg: String| Err(MacError::InvalidConfiguration(msg));

        let prbs = self.prbs();
        if prbs == 0 || prbs as usize > MAX_PRBS {
            return invalid(format!("{} PRBs outside 1..={}", prbs, MAX_PRBS));
        }
        if self.max_ues == 0 {
            return invalid("max_ues must be at least 1".into());
        }
        for (name, n) in [("DL", self.harq.num_dl_harq), ("UL", self.harq.num_ul_harq)] {
            if n == 0 || n > MAX_HARQ_PROCESSES {
                return invalid(format!("{} HARQ processes {} outside 1..={}", name, n, MAX_HARQ_PROCESSES));
            }
        }
        for (name, bler) in [("DL", &self.dl_bler), ("UL", &self.ul_bler)] {
            if bler.lower >= bler.upper {
                return invalid(format!("{} BLER lower {} not below upper {}", name, bler.lower, bler.upper));
            }
            if bler.harq_round_max == 0 || bler.harq_round_max > 8 {
                return invalid(format!("{} harq_round_max {} outside 1..=8", name, bler.harq_round_max));
            }
        }
        if self.ra.pool_size == 0 {
            return invalid("RA pool must hold at least one procedure".into());
        }
        if self.ra.ul_carrier_id >= PRACH_UL_CARRIERS {
            return invalid(format!("ul_carrier_id {} outside 0..{}", self.ra.ul_carrier_id, PRACH_UL_CARRIERS));
        }
        if self.ra.msg3_max_rounds == 0 {
            return invalid("msg3_max_rounds must be at least 1".into());
        }
        if self.beam.beam_duration_slots == 0 || self.beam.beams_per_period == 0 {
            return invalid("beam duration and beams per period must be non-zero".into());
        }
        if self.slots_per_frame() % self.beam.beam_duration_slots != 0 {
            return invalid(format!(
                "beam duration {} does not divide {} slots per frame",
                self.beam.beam_duration_slots,
                self.slots_per_frame()
            ));
        }
        let lookahead = self.harq.k1.max(self.harq.k2).max(self.ra.msg3_delay_slots);
        if lookahead as u16 >= self.slots_per_frame() {
            return invalid(format!("k1/k2/Msg3 delay {} must stay within one frame", lookahead));
        }
        if self.pdsch_symbols == 0 || self.pdsch_symbols > 14 || self.pusch_symbols == 0 || self.pusch_symbols > 14 {
            return invalid("PDSCH/PUSCH symbols outside 1..=14".into());
        }
        if self.min_grant_prb > prbs {
            return invalid(format!("min_grant_prb {} exceeds {} PRBs", self.min_grant_prb, prbs));
        }
        Ok(())
    }
}

/// HARQ pool sizes and timing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarqConfig {
    pub num_dl_harq: usize,
    pub num_ul_harq: usize,
    /// Drop transport blocks on the first NACK
    pub disable_harq: bool,
    pub disabled_accounting: DisabledHarqAccounting,
    /// PDSCH to HARQ-ACK delay in slots
    pub k1: u8,
    /// PDCCH to PUSCH delay in slots
    pub k2: u8,
    /// Feedback deadline offset, the numerology default when absent
    pub rtt_slots: Option<u16>,
}

impl Default for HarqConfig {
    fn default() -> Self {
        Self {
            num_dl_harq: 16,
            num_ul_harq: 16,
            disable_harq: false,
            disabled_accounting: DisabledHarqAccounting::BlockError,
            k1: 4,
            k2: 4,
            rtt_slots: None,
        }
    }
}

/// Random access parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RaConfig {
    /// Concurrent RA procedures
    pub pool_size: usize,
    /// RAR window after the preamble
    pub response_window_slots: u16,
    /// Slots from RAR to Msg3
    pub msg3_delay_slots: u8,
    /// Slots after the Msg3 occasion before it counts as missed
    pub msg3_timeout_slots: u16,
    /// Msg3 transmissions before the procedure is abandoned
    pub msg3_max_rounds: u8,
    /// Msg4 transmissions before the procedure is abandoned
    pub msg4_max_rounds: u8,
    /// ra-ContentionResolutionTimer
    pub contention_resolution_timer_slots: u16,
    pub rar_nb_rb: u16,
    pub msg3_nb_rb: u16,
    pub msg4_nb_rb: u16,
    pub msg3_start_symbol: u8,
    pub msg3_nb_symbols: u8,
    /// 0 for the normal UL carrier, 1 for SUL
    pub ul_carrier_id: u8,
}

impl Default for RaConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            response_window_slots: 20,
            msg3_delay_slots: 6,
            msg3_timeout_slots: 8,
            msg3_max_rounds: 4,
            msg4_max_rounds: 4,
            contention_resolution_timer_slots: 128,
            rar_nb_rb: 8,
            msg3_nb_rb: 8,
            msg4_nb_rb: 8,
            msg3_start_symbol: 0,
            msg3_nb_symbols: 14,
            ul_carrier_id: 0,
        }
    }
}

/// Analog beam sweep
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BeamConfig {
    /// Slots one beam set stays active
    pub beam_duration_slots: u16,
    /// Beams that can be served simultaneously
    pub beams_per_period: usize,
}

impl Default for BeamConfig {
    fn default() -> Self {
        Self { beam_duration_slots: 1, beams_per_period: 1 }
    }
}

/// Closed-loop power control and radio link failure detection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PowerControlConfig {
    /// Target PUSCH SNR in 0.1 dB
    pub pusch_target_snr_x10: i16,
    /// Target PUCCH SNR in 0.1 dB
    pub pucch_target_snr_x10: i16,
    /// No power increase above this RSSI (0.1 dBm)
    pub pusch_rssi_threshold_x10: i16,
    pub pucch_rssi_threshold_x10: i16,
    /// Consecutive PUSCH DTX before link failure
    pub pusch_failure_thres: u32,
    /// Consecutive PUCCH DTX before link failure
    pub pucch_failure_thres: u32,
}

impl Default for PowerControlConfig {
    fn default() -> Self {
        Self {
            pusch_target_snr_x10: 200,
            pucch_target_snr_x10: 200,
            pusch_rssi_threshold_x10: -300,
            pucch_rssi_threshold_x10: -300,
            pusch_failure_thres: 10,
            pucch_failure_thres: 10,
        }
    }
}
