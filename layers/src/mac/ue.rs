//! Per-UE Scheduling Control
//!
//! Everything the scheduler knows about one connected UE: HARQ entities,
//! link adaptation, CSI/SR/BSR/PHR, power control, failure detection and
//! the scheduling decisions of the current slot.

use bytes::Bytes;
use common::types::{Direction, Rnti, SlotTime};
use interfaces::message_types::CsiReport;
use interfaces::northbound::{DirectionCounters, UeTelemetry};
use tracing::{debug, trace, warn};

use super::bler::{BlerOptions, BlerStats};
use super::config::{MacConfig, PowerControlConfig};
use super::harq::{ExpiryReport, HarqEntity, HarqOutcome, HarqPolicy, HarqState, ResourceAllocation};
use super::mcs::McsTable;
use super::MacError;

/// Timing advance command meaning "no change"
pub const TA_NO_CHANGE: u16 = 31;
/// TPC command meaning "no change" (0 dB)
pub const TPC_NO_CHANGE: u8 = 1;
/// Reported RSSI is dBm x10 offset by +128 dB
const RSSI_OFFSET_X10: i32 = 1280;

/// PDSCH scheduled for the current slot
#[derive(Debug, Clone, PartialEq)]
pub struct PdschDecision {
    pub harq_pid: u8,
    pub alloc: ResourceAllocation,
    pub rv: u8,
    pub ndi: bool,
    pub retransmission: bool,
    /// Slot carrying the HARQ-ACK
    pub pucch_time: SlotTime,
}

/// PUSCH granted in the current slot
#[derive(Debug, Clone, PartialEq)]
pub struct PuschDecision {
    pub harq_pid: u8,
    pub alloc: ResourceAllocation,
    pub rv: u8,
    pub ndi: bool,
    pub retransmission: bool,
    /// Slot the PUSCH occupies
    pub pusch_time: SlotTime,
    pub tpc: u8,
}

/// UCI expected on one PUCCH occasion
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PucchOccasion {
    pub time: Option<SlotTime>,
    /// HARQ-ACK bits multiplexed (DAI count)
    pub harq_ack_bits: u8,
    pub sr: bool,
    pub csi_bits: u8,
}

impl PucchOccasion {
    pub fn is_empty(&self) -> bool {
        self.time.is_none()
    }
}

/// Byte and PRB counters of one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectionStats {
    pub total_bytes: u64,
    pub total_rbs: u64,
    pub total_rbs_retx: u64,
    /// Bytes acknowledged or decoded
    pub delivered_bytes: u64,
}

/// Scheduling state of one UE
#[derive(Debug, Clone)]
pub struct UeSchedCtrl {
    pub(crate) dl_harq: HarqEntity,
    pub(crate) ul_harq: HarqEntity,
    dl_bler: BlerStats,
    ul_bler: BlerStats,
    dl_table: McsTable,
    ul_table: McsTable,

    /// Decisions of the current slot, cleared by [`UeSchedCtrl::begin_slot`]
    sched_pdsch: Option<PdschDecision>,
    sched_pusch: Option<PuschDecision>,
    sched_srs: bool,
    pucch: Vec<PucchOccasion>,
    slots_per_frame: u16,

    csi: Option<CsiReport>,
    /// MCS cap derived from the last CQI
    dl_max_mcs: u8,
    sr: bool,
    /// Bytes reported by BSR minus bytes granted since
    estimated_ul_buffer: u32,
    dl_pending_bytes: u32,
    ph_db: Option<i8>,
    pcmax_dbm: Option<i8>,
    ul_ri: u8,
    tpmi: u8,

    ta_update: u16,
    ta_apply: bool,
    tpc_pusch: u8,
    tpc_pucch: u8,
    pusch_snr_x10: i16,
    pucch_snr_x10: i16,
    rssi_x10: i16,
    avg_rsrp_dbm: Option<i32>,

    ulsch_dtx: u32,
    pucch_dtx: u32,
    link_failure: bool,
    power: PowerControlConfig,

    last_ul_frame: u16,
    beam_index: u8,
    dl_stats: DirectionStats,
    ul_stats: DirectionStats,
}

impl UeSchedCtrl {
    /// Build the state of a freshly attached UE.
    ///
    /// The PUCCH lookahead is sized here, never in the slot path.
    pub fn new(config: &MacConfig, beam_index: u8) -> Self {
        let spf = config.slots_per_frame();
        let policy = |bler: &BlerOptions| HarqPolicy {
            max_rounds: bler.harq_round_max,
            disabled: config.harq.disable_harq,
            disabled_accounting: config.harq.disabled_accounting,
            rtt_slots: config.harq_rtt_slots(),
            slots_per_frame: spf,
        };
        let dl_table = if config.dl_256qam { McsTable::Qam256 } else { McsTable::Qam64 };
        let ul_table = if config.ul_256qam { McsTable::Qam256 } else { McsTable::Qam64 };

        Self {
            dl_harq: HarqEntity::new(Direction::Downlink, config.harq.num_dl_harq, policy(&config.dl_bler)),
            ul_harq: HarqEntity::new(Direction::Uplink, config.harq.num_ul_harq, policy(&config.ul_bler)),
            dl_bler: BlerStats::new(),
            ul_bler: BlerStats::new(),
            dl_table,
            ul_table,
            sched_pdsch: None,
            sched_pusch: None,
            sched_srs: false,
            pucch: vec![PucchOccasion::default(); pucch_ring_len(config.harq.k1)],
            slots_per_frame: spf,
            csi: None,
            dl_max_mcs: dl_table.max_mcs(),
            sr: false,
            estimated_ul_buffer: 0,
            dl_pending_bytes: 0,
            ph_db: None,
            pcmax_dbm: None,
            ul_ri: 0,
            tpmi: 0,
            ta_update: TA_NO_CHANGE,
            ta_apply: false,
            tpc_pusch: TPC_NO_CHANGE,
            tpc_pucch: TPC_NO_CHANGE,
            pusch_snr_x10: 0,
            pucch_snr_x10: 0,
            rssi_x10: 0,
            avg_rsrp_dbm: None,
            ulsch_dtx: 0,
            pucch_dtx: 0,
            link_failure: false,
            power: config.power.clone(),
            last_ul_frame: 0,
            beam_index,
            dl_stats: DirectionStats::default(),
            ul_stats: DirectionStats::default(),
        }
    }

    /// Apply a reconfiguration: HARQ pools are flushed and resized
    pub fn reconfigure(&mut self, config: &MacConfig) {
        let beam_index = self.beam_index;
        let (dl_stats, ul_stats) = (self.dl_stats, self.ul_stats);
        *self = Self::new(config, beam_index);
        self.dl_stats = dl_stats;
        self.ul_stats = ul_stats;
    }

    fn harq(&self, direction: Direction) -> &HarqEntity {
        match direction {
            Direction::Downlink => &self.dl_harq,
            Direction::Uplink => &self.ul_harq,
        }
    }

    fn harq_mut(&mut self, direction: Direction) -> &mut HarqEntity {
        match direction {
            Direction::Downlink => &mut self.dl_harq,
            Direction::Uplink => &mut self.ul_harq,
        }
    }

    pub fn dl_harq(&self) -> &HarqEntity {
        &self.dl_harq
    }

    pub fn ul_harq(&self) -> &HarqEntity {
        &self.ul_harq
    }

    pub fn sched_pdsch(&self) -> Option<&PdschDecision> {
        self.sched_pdsch.as_ref()
    }

    pub fn sched_pusch(&self) -> Option<&PuschDecision> {
        self.sched_pusch.as_ref()
    }

    pub fn sched_srs(&self) -> bool {
        self.sched_srs
    }

    pub fn beam_index(&self) -> u8 {
        self.beam_index
    }

    pub fn link_failure(&self) -> bool {
        self.link_failure
    }

    pub fn sr(&self) -> bool {
        self.sr
    }

    pub fn estimated_ul_buffer(&self) -> u32 {
        self.estimated_ul_buffer
    }

    pub fn dl_pending_bytes(&self) -> u32 {
        self.dl_pending_bytes
    }

    pub fn csi(&self) -> Option<&CsiReport> {
        self.csi.as_ref()
    }

    pub fn dl_max_mcs(&self) -> u8 {
        self.dl_max_mcs
    }

    pub fn tpc_pusch(&self) -> u8 {
        self.tpc_pusch
    }

    pub fn tpc_pucch(&self) -> u8 {
        self.tpc_pucch
    }

    pub fn power_headroom(&self) -> Option<(i8, i8)> {
        self.ph_db.zip(self.pcmax_dbm)
    }

    pub fn dl_table(&self) -> McsTable {
        self.dl_table
    }

    pub fn ul_table(&self) -> McsTable {
        self.ul_table
    }

    pub fn dl_stats(&self) -> &DirectionStats {
        &self.dl_stats
    }

    pub fn ul_stats(&self) -> &DirectionStats {
        &self.ul_stats
    }

    /// Pending timing advance command, taken once
    pub fn take_ta_command(&mut self) -> Option<u16> {
        if !self.ta_apply {
            return None;
        }
        self.ta_apply = false;
        Some(std::mem::replace(&mut self.ta_update, TA_NO_CHANGE))
    }

    /// Forget the decisions of the previous slot
    pub fn begin_slot(&mut self) {
        self.sched_pdsch = None;
        self.sched_pusch = None;
        self.sched_srs = false;
    }

    fn pucch_index(&self, time: SlotTime) -> usize {
        time.abs_slot(self.slots_per_frame) as usize % self.pucch.len()
    }

    fn pucch_entry(&mut self, time: SlotTime) -> &mut PucchOccasion {
        let idx = self.pucch_index(time);
        let entry = &mut self.pucch[idx];
        if entry.time != Some(time) {
            if entry.time.is_some() {
                warn!("PUCCH occasion {:?} overwritten by {}", entry.time, time);
            }
            *entry = PucchOccasion { time: Some(time), ..PucchOccasion::default() };
        }
        entry
    }

    /// Take the PUCCH occasion falling in `time`, if any
    pub fn take_pucch(&mut self, time: SlotTime) -> Option<PucchOccasion> {
        let idx = self.pucch_index(time);
        if self.pucch[idx].time == Some(time) {
            Some(std::mem::take(&mut self.pucch[idx]))
        } else {
            None
        }
    }

    /// Expect periodic CSI on the PUCCH occasion at `time`
    pub fn schedule_csi(&mut self, time: SlotTime, bits: u8) {
        self.pucch_entry(time).csi_bits += bits;
    }

    pub fn schedule_srs(&mut self) {
        self.sched_srs = true;
    }

    /// Stage a DL grant on `harq_pid` at `now`.
    ///
    /// A free process starts a new transport block, a process awaiting
    /// retransmission resends its stored one.
    pub fn stage_downlink_grant(
        &mut self,
        harq_pid: u8,
        alloc: ResourceAllocation,
        now: SlotTime,
        k1: u8,
        payload: Option<Bytes>,
    ) -> Result<&PdschDecision, MacError> {
        let retransmission = match self.dl_harq.state(harq_pid) {
            Some(HarqState::AwaitingRetransmission) => {
                self.dl_harq.start_retransmission(harq_pid, Some(alloc), now)?;
                true
            }
            _ => {
                self.dl_harq.start_new_transmission(harq_pid, alloc, now, payload)?;
                false
            }
        };
        let pucch_time = now.add_slots(k1 as u32, self.slots_per_frame);
        self.pucch_entry(pucch_time).harq_ack_bits += 1;

        let process = self.dl_harq.process(harq_pid).ok_or(MacError::InvalidHarqPid {
            pid: harq_pid,
            num: self.dl_harq.num_processes(),
        })?;
        let alloc = *process.allocation();
        self.dl_stats.total_rbs += alloc.rb_size as u64;
        if retransmission {
            self.dl_stats.total_rbs_retx += alloc.rb_size as u64;
        } else {
            self.dl_stats.total_bytes += alloc.tb_size as u64;
            self.dl_pending_bytes = self.dl_pending_bytes.saturating_sub(alloc.tb_size);
        }
        trace!("{}: PDSCH pid {} rbs {}+{} mcs {} round {}", now, harq_pid, alloc.rb_start, alloc.rb_size, alloc.mcs, process.round());

        Ok(self.sched_pdsch.insert(PdschDecision {
            harq_pid,
            alloc,
            rv: process.rv(),
            ndi: process.ndi(),
            retransmission,
            pucch_time,
        }))
    }

    /// Stage an UL grant on `harq_pid` for the PUSCH at `pusch_time`
    pub fn stage_uplink_grant(
        &mut self,
        harq_pid: u8,
        alloc: ResourceAllocation,
        pusch_time: SlotTime,
    ) -> Result<&PuschDecision, MacError> {
        let retransmission = match self.ul_harq.state(harq_pid) {
            Some(HarqState::AwaitingRetransmission) => {
                self.ul_harq.start_retransmission(harq_pid, Some(alloc), pusch_time)?;
                true
            }
            _ => {
                self.ul_harq.start_new_transmission(harq_pid, alloc, pusch_time, None)?;
                false
            }
        };
        let process = self.ul_harq.process(harq_pid).ok_or(MacError::InvalidHarqPid {
            pid: harq_pid,
            num: self.ul_harq.num_processes(),
        })?;
        let alloc = *process.allocation();
        self.ul_stats.total_rbs += alloc.rb_size as u64;
        if retransmission {
            self.ul_stats.total_rbs_retx += alloc.rb_size as u64;
        } else {
            self.ul_stats.total_bytes += alloc.tb_size as u64;
            self.estimated_ul_buffer = self.estimated_ul_buffer.saturating_sub(alloc.tb_size);
            self.sr = false;
        }
        self.last_ul_frame = pusch_time.frame;
        let tpc = std::mem::replace(&mut self.tpc_pusch, TPC_NO_CHANGE);

        Ok(self.sched_pusch.insert(PuschDecision {
            harq_pid,
            alloc,
            rv: process.rv(),
            ndi: process.ndi(),
            retransmission,
            pusch_time,
            tpc,
        }))
    }

    /// Apply HARQ feedback received at `at`
    pub fn record_feedback(
        &mut self,
        direction: Direction,
        harq_pid: u8,
        ack: bool,
        at: SlotTime,
    ) -> Result<HarqOutcome, MacError> {
        let outcome = self.resolve_feedback(direction, harq_pid, ack, at)?;
        match direction {
            Direction::Downlink => self.pucch_dtx = 0,
            Direction::Uplink => self.ulsch_dtx = 0,
        }
        Ok(outcome)
    }

    /// Resolve a process whose feedback was DTX. Counts as a NACK without
    /// touching the DTX counters.
    pub fn resolve_dtx(&mut self, direction: Direction, harq_pid: u8, at: SlotTime) -> Result<HarqOutcome, MacError> {
        self.resolve_feedback(direction, harq_pid, false, at)
    }

    fn resolve_feedback(
        &mut self,
        direction: Direction,
        harq_pid: u8,
        ack: bool,
        at: SlotTime,
    ) -> Result<HarqOutcome, MacError> {
        let tb_size = self.harq(direction).process(harq_pid).map(|p| p.allocation().tb_size);
        let outcome = self.harq_mut(direction).handle_feedback(harq_pid, ack)?;
        trace!("{}: {:?} HARQ pid {} {} -> {:?}", at, direction, harq_pid, if ack { "ACK" } else { "NACK" }, outcome);
        if outcome == HarqOutcome::Acknowledged {
            let stats = match direction {
                Direction::Downlink => &mut self.dl_stats,
                Direction::Uplink => &mut self.ul_stats,
            };
            stats.delivered_bytes += tb_size.unwrap_or(0) as u64;
        }
        Ok(outcome)
    }

    /// Store the payload of a DL transport block awaiting feedback
    pub fn store_transport_block(&mut self, harq_pid: u8, payload: Bytes) -> Result<(), MacError> {
        self.dl_harq.store_transport_block(harq_pid, payload)
    }

    /// Count a missing uplink transmission.
    ///
    /// Returns true when this DTX crosses the failure threshold and raises
    /// the link-failure flag.
    pub fn record_dtx(&mut self, direction: Direction) -> bool {
        let (counter, threshold) = match direction {
            Direction::Uplink => (&mut self.ulsch_dtx, self.power.pusch_failure_thres),
            Direction::Downlink => (&mut self.pucch_dtx, self.power.pucch_failure_thres),
        };
        *counter += 1;
        if *counter >= threshold && !self.link_failure {
            self.link_failure = true;
            debug!("{:?} DTX count {} reached threshold {}", direction, *counter, threshold);
            return true;
        }
        false
    }

    /// Clear the link-failure condition once higher layers recovered the UE
    pub fn clear_link_failure(&mut self) {
        self.link_failure = false;
        self.ulsch_dtx = 0;
        self.pucch_dtx = 0;
    }

    pub fn record_csi_report(&mut self, report: CsiReport) {
        let table = if report.cqi_table == 1 { McsTable::Qam256 } else { McsTable::Qam64 };
        self.dl_max_mcs = table.mcs_from_cqi(report.wb_cqi).min(self.dl_table.max_mcs());
        if let Some(rsrp) = report.ssb_rsrp_dbm {
            let rsrp = rsrp as i32;
            self.avg_rsrp_dbm = Some(self.avg_rsrp_dbm.map_or(rsrp, |avg| (avg * 3 + rsrp) / 4));
        }
        self.csi = Some(report);
    }

    /// PUSCH SNR/RSSI and timing advance from a CRC indication
    pub fn record_pusch_measurements(&mut self, snr_x10: i16, rssi: u16, timing_advance: Option<u16>) {
        self.pusch_snr_x10 = snr_x10;
        self.rssi_x10 = (i32::from(rssi) - RSSI_OFFSET_X10).clamp(i16::MIN as i32, i16::MAX as i32) as i16;
        self.tpc_pusch = compute_tpc(
            self.power.pusch_target_snr_x10,
            snr_x10,
            self.rssi_x10,
            self.power.pusch_rssi_threshold_x10,
        );
        if let Some(ta) = timing_advance.filter(|&ta| ta != TA_NO_CHANGE) {
            self.ta_update = ta;
            self.ta_apply = true;
        }
    }

    pub fn record_pucch_snr(&mut self, snr_x10: i16) {
        self.pucch_snr_x10 = snr_x10;
        self.tpc_pucch = compute_tpc(self.power.pucch_target_snr_x10, snr_x10, self.rssi_x10, self.power.pucch_rssi_threshold_x10);
    }

    pub fn record_sr(&mut self, sr: bool) {
        self.sr = sr;
    }

    pub fn record_bsr(&mut self, buffer_bytes: u32) {
        self.estimated_ul_buffer = buffer_bytes;
    }

    pub fn record_phr(&mut self, ph_db: i8, pcmax_dbm: i8) {
        self.ph_db = Some(ph_db);
        self.pcmax_dbm = Some(pcmax_dbm);
    }

    pub fn record_srs(&mut self, ul_ri: u8, tpmi: u8) {
        self.ul_ri = ul_ri;
        self.tpmi = tpmi;
    }

    pub fn set_dl_buffer(&mut self, pending_bytes: u32) {
        self.dl_pending_bytes = pending_bytes;
    }

    /// Whether an UL grant is due because the UE asked or went quiet
    pub fn wants_ul_grant(&self, frame: u16, max_inactivity: u16) -> bool {
        self.sr
            || self.estimated_ul_buffer > 0
            || common::utils::time::frame_diff(frame, self.last_ul_frame) >= max_inactivity
    }

    /// Expire HARQ feedback timers in both directions
    pub fn expire_harq(&mut self, now: SlotTime) -> (ExpiryReport, ExpiryReport) {
        (self.dl_harq.expire(now), self.ul_harq.expire(now))
    }

    /// MCS for a new transmission, from BLER history and the CSI cap
    pub fn next_mcs(&mut self, direction: Direction, options: &BlerOptions, frame: u16) -> u8 {
        match direction {
            Direction::Downlink => {
                let rounds = self.dl_harq.stats().rounds;
                self.dl_bler.update_mcs(options, &rounds, self.dl_max_mcs, frame)
            }
            Direction::Uplink => {
                let rounds = self.ul_harq.stats().rounds;
                self.ul_bler.update_mcs(options, &rounds, self.ul_table.max_mcs(), frame)
            }
        }
    }

    /// Replace BLER options; the HARQ round limit applies to new transport blocks
    pub fn set_bler_options(&mut self, direction: Direction, options: &BlerOptions) {
        let harq = self.harq_mut(direction);
        let policy = HarqPolicy { max_rounds: options.harq_round_max, ..*harq.policy() };
        harq.set_policy(policy);
    }

    /// Release every HARQ process and pending decision
    pub fn flush(&mut self) {
        self.dl_harq.flush();
        self.ul_harq.flush();
        self.begin_slot();
        self.pucch.fill(PucchOccasion::default());
    }

    fn counters(&self, direction: Direction) -> DirectionCounters {
        let (harq, bler, stats) = match direction {
            Direction::Downlink => (&self.dl_harq, &self.dl_bler, &self.dl_stats),
            Direction::Uplink => (&self.ul_harq, &self.ul_bler, &self.ul_stats),
        };
        DirectionCounters {
            rounds: harq.stats().rounds,
            errors: harq.stats().errors,
            harq_disabled_drops: harq.stats().harq_disabled_drops,
            total_bytes: stats.total_bytes,
            total_rbs: stats.total_rbs,
            total_rbs_retx: stats.total_rbs_retx,
            bler: bler.bler(),
            mcs: bler.mcs(),
        }
    }

    /// Northbound view of this UE
    pub fn telemetry(&self, rnti: Rnti, uid: u16) -> UeTelemetry {
        UeTelemetry {
            rnti,
            uid,
            dl: self.counters(Direction::Downlink),
            ul: self.counters(Direction::Uplink),
            ulsch_dtx: self.ulsch_dtx,
            pucch0_dtx: self.pucch_dtx,
            pusch_snr_x10: self.pusch_snr_x10,
            avg_rsrp_dbm: self.avg_rsrp_dbm,
            link_failure: self.link_failure,
        }
    }
}

/// PUCCH lookahead ring length covering `k1` slots ahead.
///
/// A power of two up to 2048 divides every SFN hyperframe (1024 frames of
/// 10 * 2^mu slots), so ring positions stay continuous across the wrap.
fn pucch_ring_len(k1: u8) -> usize {
    (k1 as usize + 1).next_power_of_two()
}

/// Closed-loop TPC command (38.213 Table 7.1.1-1) steering SNR to `target`.
///
/// No power increase is requested while RSSI is above `rssi_threshold`.
pub fn compute_tpc(target_x10: i16, snr_x10: i16, rssi_x10: i16, rssi_threshold_x10: i16) -> u8 {
    let diff = target_x10 as i32 - snr_x10 as i32;
    let tpc = if diff > 30 {
        3
    } else if diff > 10 {
        2
    } else if diff < -10 {
        0
    } else {
        TPC_NO_CHANGE
    };
    if tpc > TPC_NO_CHANGE && rssi_x10 > rssi_threshold_x10 {
        TPC_NO_CHANGE
    } else {
        tpc
    }
}

/// A registered UE
#[derive(Debug, Clone)]
pub struct UeInfo {
    pub rnti: Rnti,
    pub uid: u16,
    pub sched_ctrl: UeSchedCtrl,
    /// Contention resolution id from the RA procedure that created the UE
    pub cont_res_id: Option<[u8; 6]>,
}

impl UeInfo {
    pub fn new(rnti: Rnti, sched_ctrl: UeSchedCtrl) -> Self {
        Self { rnti, uid: 0, sched_ctrl, cont_res_id: None }
    }

    pub fn telemetry(&self) -> UeTelemetry {
        self.sched_ctrl.telemetry(self.rnti, self.uid)
    }
}
