//! MAC Scheduler
//!
//! Per-slot scheduling loop of one cell. Each slot the scheduler applies the
//! uplink events queued since the previous slot, expires HARQ and RA timers,
//! then hands out resources in priority order: random access, DL data (HARQ
//! retransmissions first), UL data, then the periodic PUCCH/SRS occasions.

use std::collections::VecDeque;

use bytes::Bytes;
use common::types::{Direction, Rnti, SlotTime};
use common::utils::time::SFN_PERIOD;
use interfaces::message_types::{CrcIndication, HarqAck, HarqFeedbackIndication, RachIndication, UplinkIndication};
use interfaces::northbound::{CellTelemetry, ControlAction, TelemetrySnapshot};
use tracing::{debug, error, info, trace, warn};

use super::beam::{BeamAllocator, RbRange, ResourceMap};
use super::bler::BlerOptions;
use super::config::MacConfig;
use super::harq::ResourceAllocation;
use super::mcs::{compute_tbs_bytes, rv_for_round, McsTable, TbsParams};
use super::ra::{Msg3Alloc, PrachOccasion, RaCompletion, RaPool, RaProgress, RaState};
use super::registry::UeRegistry;
use super::ue::{PucchOccasion, UeInfo, UeSchedCtrl};
use super::{MacError, Pool};

/// First C-RNTI handed out
const FIRST_C_RNTI: u16 = 0x4601;
/// HARQ process carrying Msg4 and MsgB
const MSG4_HARQ_PID: u8 = 0;
/// RAR TPC command for 0 dB (38.213 Table 8.2-2)
const MSG3_TPC_0DB: u8 = 3;
/// Wideband CQI plus RI on a periodic CSI report
const CSI_REPORT_BITS: u8 = 6;
/// RAR, Msg4 and MsgB are sent with MCS 0
const MSG_MCS: u8 = 0;

/// UE lifecycle events for the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MacNotification {
    UeAttached { rnti: Rnti, uid: u16 },
    RandomAccessFailed { rnti: Rnti },
    LinkFailure { rnti: Rnti },
}

/// What a DL grant carries
#[derive(Debug, Clone, PartialEq)]
pub enum DlGrantKind {
    Data,
    /// Contention resolution, echoing the Msg3 identity
    Msg4 { cont_res_id: Option<[u8; 6]> },
    MsgB { cont_res_id: Option<[u8; 6]> },
}

/// PDSCH allocation for one slot
#[derive(Debug, Clone, PartialEq)]
pub struct DlGrant {
    pub rnti: Rnti,
    pub kind: DlGrantKind,
    pub harq_pid: u8,
    pub alloc: ResourceAllocation,
    pub rv: u8,
    pub ndi: bool,
    pub retransmission: bool,
    /// Beam slot within the beam period
    pub beam_idx: usize,
    /// Slot carrying the HARQ-ACK
    pub pucch_time: SlotTime,
    /// Timing advance command to piggyback
    pub ta_command: Option<u16>,
    pub payload: Option<Bytes>,
}

/// PUSCH allocation granted in this slot
#[derive(Debug, Clone, PartialEq)]
pub struct UlGrant {
    pub rnti: Rnti,
    /// None for Msg3 retransmissions
    pub harq_pid: Option<u8>,
    pub alloc: ResourceAllocation,
    pub rv: u8,
    pub ndi: bool,
    pub retransmission: bool,
    pub beam_idx: usize,
    pub pusch_time: SlotTime,
    pub tpc: u8,
}

/// Random access response
#[derive(Debug, Clone, PartialEq)]
pub struct RarGrant {
    pub ra_rnti: u16,
    /// Temporary C-RNTI assigned to the UE
    pub rnti: Rnti,
    pub preamble_index: u8,
    pub timing_advance: u16,
    /// PDSCH carrying the RAR
    pub rar_rbs: RbRange,
    pub msg3: Msg3Alloc,
    pub msg3_time: SlotTime,
    pub beam_idx: usize,
}

/// UCI expected on the PUCCH of this slot
#[derive(Debug, Clone, PartialEq)]
pub struct PucchGrant {
    pub rnti: Rnti,
    pub occasion: PucchOccasion,
}

/// Everything decided for one slot
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotSchedule {
    pub time: SlotTime,
    pub dl_grants: Vec<DlGrant>,
    pub ul_grants: Vec<UlGrant>,
    pub rars: Vec<RarGrant>,
    pub pucch: Vec<PucchGrant>,
    /// UEs sounding in this slot
    pub srs: Vec<Rnti>,
}

impl SlotSchedule {
    pub fn new(time: SlotTime) -> Self {
        Self { time, ..Self::default() }
    }

    /// Reset for reuse, keeping the allocations
    pub fn clear(&mut self, time: SlotTime) {
        self.time = time;
        self.dl_grants.clear();
        self.ul_grants.clear();
        self.rars.clear();
        self.pucch.clear();
        self.srs.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.dl_grants.is_empty()
            && self.ul_grants.is_empty()
            && self.rars.is_empty()
            && self.pucch.is_empty()
            && self.srs.is_empty()
    }
}

/// Cell-wide counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CellStats {
    pub total_prb_aggregate: u64,
    pub used_prb_aggregate: u64,
    /// UEs deferred because every HARQ process was busy
    pub harq_pool_exhausted: u64,
    pub rnti_exhausted: u64,
    pub registry_full: u64,
    pub resource_conflicts: u64,
    /// Indications for RNTIs nobody owns
    pub unknown_rnti: u64,
    /// Feedback that matched no process awaiting it
    pub stale_feedback: u64,
}

/// Scheduler state of one cell
#[derive(Debug)]
pub struct MacScheduler {
    config: MacConfig,
    num_prbs: u16,
    slots_per_frame: u16,
    registry: UeRegistry,
    ra: RaPool,
    beams: BeamAllocator,
    /// PRB maps indexed by slot within the frame
    dl_map: ResourceMap,
    ul_map: ResourceMap,
    pending: VecDeque<UplinkIndication>,
    stats: CellStats,
    next_rnti: u16,
    dl_rr: usize,
    ul_rr: usize,
    last_slot: Option<SlotTime>,
    notifications: Vec<MacNotification>,
    failed_ra: Vec<Option<Rnti>>,
}

/// Commit `wanted` PRBs (at least `min`) on the beam serving `beam_id` at `time`
#[allow(clippy::too_many_arguments)]
fn claim_prbs(
    beams: &mut BeamAllocator,
    map: &mut ResourceMap,
    stats: &mut CellStats,
    time: SlotTime,
    slot_idx: usize,
    beam_id: u16,
    wanted: u16,
    min: u16,
    honour_blocked: bool,
) -> Option<(RbRange, usize)> {
    let beam = beams.allocate(time, beam_id)?;
    let limit = RbRange::new(0, map.num_prbs());
    let Some(range) = map.find_free(slot_idx, beam.idx, limit, wanted, min, honour_blocked) else {
        beams.release(time, beam_id, beam);
        return None;
    };
    if let Err(e) = map.reserve(slot_idx, &[beam.idx], range) {
        error!("{}: {}", time, e);
        debug_assert!(false, "free range rejected: {}", e);
        stats.resource_conflicts += 1;
        beams.release(time, beam_id, beam);
        return None;
    }
    Some((range, beam.idx))
}

/// Smallest PRB count whose TBS covers `bytes`, capped at `max_rb`
fn rbs_for_bytes(params: TbsParams, bytes: u32, max_rb: u16) -> u16 {
    let (mut lo, mut hi) = (1u16, max_rb.max(1));
    while lo < hi {
        let mid = lo + (hi - lo) / 2;
        if compute_tbs_bytes(&TbsParams { nb_rb: mid, ..params }) >= bytes {
            hi = mid;
        } else {
            lo = mid + 1;
        }
    }
    lo
}

impl MacScheduler {
    pub fn new(config: MacConfig) -> Result<Self, MacError> {
        config.validate()?;
        let num_prbs = config.prbs();
        let slots_per_frame = config.slots_per_frame();
        let beams_per_period = config.beam.beams_per_period;
        info!(
            "MAC scheduler: {} PRBs, {} slots/frame, {} UEs, {} RA procedures",
            num_prbs, slots_per_frame, config.max_ues, config.ra.pool_size
        );

        Ok(Self {
            num_prbs,
            slots_per_frame,
            registry: UeRegistry::new(config.max_ues),
            ra: RaPool::new(&config.ra, slots_per_frame),
            beams: BeamAllocator::new(config.beam.beam_duration_slots, beams_per_period, slots_per_frame),
            dl_map: ResourceMap::new(slots_per_frame as usize, beams_per_period, num_prbs),
            ul_map: ResourceMap::new(slots_per_frame as usize, beams_per_period, num_prbs),
            pending: VecDeque::new(),
            stats: CellStats::default(),
            next_rnti: FIRST_C_RNTI,
            dl_rr: 0,
            ul_rr: 0,
            last_slot: None,
            notifications: Vec::new(),
            failed_ra: Vec::with_capacity(config.ra.pool_size),
            config,
        })
    }

    pub fn config(&self) -> &MacConfig {
        &self.config
    }

    pub fn registry(&self) -> &UeRegistry {
        &self.registry
    }

    pub fn ra_pool(&self) -> &RaPool {
        &self.ra
    }

    pub fn stats(&self) -> &CellStats {
        &self.stats
    }

    /// Indications waiting for the next slot
    pub fn pending_indications(&self) -> usize {
        self.pending.len()
    }

    /// Drain the notifications raised since the last call
    pub fn take_notifications(&mut self) -> Vec<MacNotification> {
        std::mem::take(&mut self.notifications)
    }

    fn slot_index(&self, time: SlotTime) -> usize {
        time.abs_slot(self.slots_per_frame) as usize % self.slots_per_frame as usize
    }

    fn after(&self, time: SlotTime, slots: u8) -> SlotTime {
        time.add_slots(slots as u32, self.slots_per_frame)
    }

    /// Queue an uplink event. It is applied at the start of the next slot.
    pub fn deliver(&mut self, indication: UplinkIndication) {
        self.pending.push_back(indication);
    }

    /// Next C-RNTI not held by a UE or an RA procedure
    fn allocate_rnti(&mut self) -> Result<Rnti, MacError> {
        let span = (Rnti::MAX_C_RNTI - Rnti::MIN_C_RNTI) as u32 + 1;
        for _ in 0..span {
            let candidate = Rnti(self.next_rnti);
            self.next_rnti = if self.next_rnti >= Rnti::MAX_C_RNTI { Rnti::MIN_C_RNTI } else { self.next_rnti + 1 };
            if !self.registry.contains(candidate) && !self.ra.rnti_in_use(candidate) {
                return Ok(candidate);
            }
        }
        Err(MacError::PoolExhausted(Pool::Rnti))
    }

    /// Register a UE whose context the control plane already holds
    pub fn add_ue(&mut self, rnti: Rnti, beam_index: u8) -> Result<u16, MacError> {
        // a prepared contention-free access may already hold the RNTI
        let contended = self.ra.find_by_rnti(rnti).and_then(|idx| self.ra.get(idx)).is_some_and(|p| !p.is_cfra());
        if contended {
            return Err(MacError::DuplicateRnti(rnti));
        }
        let ue = UeInfo::new(rnti, UeSchedCtrl::new(&self.config, beam_index));
        let uid = match self.registry.attach(ue) {
            Ok(uid) => uid,
            Err(e) => {
                if matches!(e, MacError::RegistryFull(_)) {
                    self.stats.registry_full += 1;
                }
                return Err(e);
            }
        };
        info!("UE {} added with uid {}", rnti, uid);
        self.notifications.push(MacNotification::UeAttached { rnti, uid });
        Ok(uid)
    }

    /// Remove a UE with its HARQ state, RA procedure and queued indications
    pub fn remove_ue(&mut self, rnti: Rnti) -> Result<(), MacError> {
        let released_ra = self.ra.release_rnti(rnti);
        let Some(uid) = self.registry.uid_of(rnti) else {
            if released_ra {
                info!("RA procedure of {} released", rnti);
                return Ok(());
            }
            return Err(MacError::UnknownUe(rnti));
        };
        if let Some(mut ue) = self.registry.detach(uid) {
            ue.sched_ctrl.flush();
        }
        self.pending.retain(|ind| ind.rnti() != Some(rnti));
        info!("UE {} removed from uid {}", rnti, uid);
        Ok(())
    }

    /// Reserve dedicated preambles for a contention-free access
    pub fn prepare_cfra(&mut self, rnti: Rnti, preambles: &[u8], beam_index: u8) -> Result<(), MacError> {
        if self.ra.rnti_in_use(rnti) {
            return Err(MacError::DuplicateRnti(rnti));
        }
        let idx = self.ra.prepare_cfra(rnti, preambles, beam_index)?;
        debug!("CFRA for {} prepared in RA slot {} with preambles {:?}", rnti, idx, preambles);
        Ok(())
    }

    /// Store the payload of a DL transport block for retransmission
    pub fn attach_transport_block(&mut self, rnti: Rnti, harq_pid: u8, payload: Bytes) -> Result<(), MacError> {
        let ue = self.registry.get_mut(rnti).ok_or(MacError::UnknownUe(rnti))?;
        ue.sched_ctrl.store_transport_block(harq_pid, payload)
    }

    /// Swap in a new configuration. Resource maps are rebuilt, HARQ state is flushed.
    pub fn reconfigure(&mut self, config: MacConfig) -> Result<(), MacError> {
        config.validate()?;
        self.registry.resize(config.max_ues)?;
        self.num_prbs = config.prbs();
        self.slots_per_frame = config.slots_per_frame();
        let periods = self.slots_per_frame as usize;
        let beams = config.beam.beams_per_period;
        self.beams = BeamAllocator::new(config.beam.beam_duration_slots, beams, self.slots_per_frame);
        self.dl_map.rebuild(periods, beams, self.num_prbs);
        self.ul_map.rebuild(periods, beams, self.num_prbs);
        self.ra.reconfigure(&config.ra, self.slots_per_frame);
        self.registry.for_each(|ue| ue.sched_ctrl.reconfigure(&config));
        self.last_slot = None;
        self.config = config;
        info!("MAC reconfigured: {} PRBs, {} UEs max", self.num_prbs, self.config.max_ues);
        Ok(())
    }

    /// Apply a northbound control action
    pub fn apply_action(&mut self, action: ControlAction) -> Result<(), MacError> {
        match action {
            ControlAction::SetUlPrbBlacklist { prbs } => {
                if let Some(prb) = prbs.iter().find(|&&prb| prb >= self.num_prbs) {
                    return Err(MacError::OutOfBandwidth { rb_end: prb + 1, num_prbs: self.num_prbs });
                }
                self.ul_map.set_blocked(&prbs);
                info!("UL PRB blacklist set: {} PRBs", self.ul_map.blocked_count());
            }
            ControlAction::ClearUlPrbBlacklist => {
                self.ul_map.set_blocked(&[]);
                info!("UL PRB blacklist cleared");
            }
            ControlAction::SetBlerOptions { direction, upper, lower, max_mcs } => {
                if lower >= upper {
                    return Err(MacError::InvalidConfiguration(format!(
                        "BLER lower {} not below upper {}",
                        lower, upper
                    )));
                }
                let current = match direction {
                    Direction::Downlink => &mut self.config.dl_bler,
                    Direction::Uplink => &mut self.config.ul_bler,
                };
                *current = BlerOptions { upper, lower, max_mcs, ..*current };
                let options = *current;
                self.registry.for_each(|ue| ue.sched_ctrl.set_bler_options(direction, &options));
                info!("{:?} BLER options: upper={} lower={} max_mcs={}", direction, upper, lower, max_mcs);
            }
        }
        Ok(())
    }

    /// Northbound view of the cell and its UEs
    pub fn snapshot(&self) -> TelemetrySnapshot {
        let ra = self.ra.stats();
        TelemetrySnapshot {
            cell: CellTelemetry {
                time: self.last_slot.unwrap_or_default(),
                active_ues: self.registry.len() as u16,
                total_prb_aggregate: self.stats.total_prb_aggregate,
                used_prb_aggregate: self.stats.used_prb_aggregate,
                ra_attempts: ra.attempts,
                ra_successes: ra.successes,
                ra_failures: ra.failures,
                harq_pool_exhausted: self.stats.harq_pool_exhausted,
                ra_pool_exhausted: ra.pool_exhausted,
                registry_full: self.stats.registry_full,
                resource_conflicts: self.stats.resource_conflicts,
            },
            ues: self.registry.iter().map(UeInfo::telemetry).collect(),
        }
    }

    /// Schedule slot `now` into `out`
    pub fn run_slot(&mut self, now: SlotTime, out: &mut SlotSchedule) {
        out.clear(now);
        self.release_past_slots(now);
        self.registry.for_each(|ue| ue.sched_ctrl.begin_slot());

        while let Some(indication) = self.pending.pop_front() {
            self.handle_indication(now, indication);
        }
        self.expire(now);

        self.schedule_ra(now, out);
        self.schedule_dl(now, out);
        self.schedule_ul(now, out);
        self.schedule_uci(now, out);

        let slot_idx = self.slot_index(now);
        self.stats.total_prb_aggregate += self.num_prbs as u64;
        self.stats.used_prb_aggregate += self.dl_map.used_prbs(slot_idx) as u64;
        self.last_slot = Some(now);
        trace!(
            "{}: {} DL, {} UL, {} RAR, {} PUCCH",
            now,
            out.dl_grants.len(),
            out.ul_grants.len(),
            out.rars.len(),
            out.pucch.len()
        );
    }

    /// Clear PRB maps of slots already transmitted, and beams of finished periods
    fn release_past_slots(&mut self, now: SlotTime) {
        let spf = self.slots_per_frame;
        let gap = match self.last_slot {
            Some(last) => last.slots_until(now, spf),
            None => spf as u32,
        };
        if gap >= spf as u32 {
            for slot_idx in 0..spf as usize {
                self.dl_map.clear_period(slot_idx);
                self.ul_map.clear_period(slot_idx);
            }
            for period in 0..self.beams.periods() {
                if period != self.beams.period_of(now) {
                    self.beams.clear_period(period);
                }
            }
            return;
        }
        let current_period = self.beams.period_of(now);
        let sfn_slots = SFN_PERIOD as u32 * spf as u32;
        for back in 1..=gap {
            let past = now.add_slots(sfn_slots - back, spf);
            let slot_idx = self.slot_index(past);
            self.dl_map.clear_period(slot_idx);
            self.ul_map.clear_period(slot_idx);
            let period = self.beams.period_of(past);
            if period != current_period {
                self.beams.clear_period(period);
            }
        }
    }

    fn notify_link_failure(&mut self, rnti: Rnti, direction: Direction) {
        warn!("UE {} {:?} link failure", rnti, direction);
        self.notifications.push(MacNotification::LinkFailure { rnti });
    }

    fn handle_indication(&mut self, now: SlotTime, indication: UplinkIndication) {
        match indication {
            UplinkIndication::Rach(rach) => self.handle_rach(now, &rach),
            UplinkIndication::HarqFeedback(feedback) => self.handle_harq_feedback(now, &feedback),
            UplinkIndication::Crc(crc) => self.handle_crc(now, &crc),
            UplinkIndication::Msg3(msg3) => {
                let Some(idx) = self.ra.find_by_rnti(msg3.rnti) else {
                    debug!("{}: Msg3 from unknown TC-RNTI {}", now, msg3.rnti);
                    self.stats.unknown_rnti += 1;
                    return;
                };
                let progress = self.ra.msg3_received(idx, &msg3.content, now);
                self.handle_ra_progress(now, progress);
            }
            UplinkIndication::MsgAPusch(msga) => {
                let Some(idx) = self.ra.find_by_rnti(msga.rnti) else {
                    debug!("{}: MsgA PUSCH from unknown RNTI {}", now, msga.rnti);
                    self.stats.unknown_rnti += 1;
                    return;
                };
                let progress = self.ra.msga_pusch_received(idx, &msga.content, now);
                self.handle_ra_progress(now, progress);
            }
            other => {
                let Some(rnti) = other.rnti() else { return };
                let Some(ue) = self.registry.get_mut(rnti) else {
                    debug!("{}: indication for unknown UE {}", now, rnti);
                    self.stats.unknown_rnti += 1;
                    return;
                };
                let ctrl = &mut ue.sched_ctrl;
                match other {
                    UplinkIndication::Csi(csi) => ctrl.record_csi_report(csi.report),
                    UplinkIndication::Sr(sr) => ctrl.record_sr(sr.sr),
                    UplinkIndication::Bsr(bsr) => ctrl.record_bsr(bsr.buffer_bytes),
                    UplinkIndication::Phr(phr) => ctrl.record_phr(phr.ph_db, phr.pcmax_dbm),
                    UplinkIndication::DlBuffer(buf) => ctrl.set_dl_buffer(buf.pending_bytes),
                    UplinkIndication::Srs(srs) => ctrl.record_srs(srs.ul_ri, srs.tpmi),
                    _ => {}
                }
            }
        }
    }

    fn handle_rach(&mut self, now: SlotTime, rach: &RachIndication) {
        let occasion = PrachOccasion {
            symbol_index: rach.symbol_index,
            slot_index: rach.slot_index,
            freq_index: rach.freq_index,
        };
        for preamble in &rach.preambles {
            let tc_rnti = match self.allocate_rnti() {
                Ok(rnti) => rnti,
                Err(e) => {
                    warn!("{}: preamble {} dropped: {}", now, preamble.preamble_index, e);
                    self.stats.rnti_exhausted += 1;
                    continue;
                }
            };
            match self.ra.on_preamble(now, occasion, preamble, rach.beam_index, rach.msg_a, tc_rnti) {
                Ok(idx) => debug!(
                    "{}: preamble {} (TA {}) detected at {}, RA slot {}",
                    now, preamble.preamble_index, preamble.timing_advance, rach.time, idx
                ),
                Err(e) => debug!("{}: preamble {} not served: {}", now, preamble.preamble_index, e),
            }
        }
    }

    fn handle_harq_feedback(&mut self, now: SlotTime, feedback: &HarqFeedbackIndication) {
        let ack = feedback.value == HarqAck::Ack;
        if let Some(idx) = self.ra.find_by_rnti(feedback.rnti) {
            if self.ra.get(idx).map(|p| p.state()) == Some(RaState::WaitMsg4MsgBAck) {
                let progress = self.ra.msg4_feedback(idx, ack, now);
                self.handle_ra_progress(now, progress);
                return;
            }
        }
        let Some(ue) = self.registry.get_mut(feedback.rnti) else {
            debug!("{}: HARQ feedback for unknown UE {}", now, feedback.rnti);
            self.stats.unknown_rnti += 1;
            return;
        };
        let ctrl = &mut ue.sched_ctrl;
        if let Some(snr) = feedback.pucch_snr_x10 {
            ctrl.record_pucch_snr(snr);
        }
        let (failed, resolved) = if feedback.value == HarqAck::Dtx {
            let failed = ctrl.record_dtx(Direction::Downlink);
            (failed, ctrl.resolve_dtx(Direction::Downlink, feedback.harq_pid, now))
        } else {
            (false, ctrl.record_feedback(Direction::Downlink, feedback.harq_pid, ack, now))
        };
        if let Err(e) = resolved {
            debug!("{}: DL feedback for {} ignored: {}", now, feedback.rnti, e);
            self.stats.stale_feedback += 1;
        }
        if failed {
            self.notify_link_failure(feedback.rnti, Direction::Downlink);
        }
    }

    fn handle_crc(&mut self, now: SlotTime, crc: &CrcIndication) {
        if let Some(idx) = self.ra.find_by_rnti(crc.rnti) {
            let state = self.ra.get(idx).map(|p| p.state());
            if !crc.crc_ok && matches!(state, Some(RaState::WaitMsg3 | RaState::WaitMsgAPusch)) {
                let progress = if state == Some(RaState::WaitMsg3) {
                    self.ra.msg3_failed(idx, now)
                } else {
                    self.ra.msga_pusch_failed(idx, now)
                };
                self.handle_ra_progress(now, progress);
                return;
            }
            if matches!(state, Some(RaState::WaitMsg3 | RaState::WaitMsgAPusch)) {
                // decoded Msg3 arrives as its own indication
                return;
            }
        }
        let Some(ue) = self.registry.get_mut(crc.rnti) else {
            debug!("{}: CRC for unknown UE {}", now, crc.rnti);
            self.stats.unknown_rnti += 1;
            return;
        };
        let ctrl = &mut ue.sched_ctrl;
        let (failed, resolved) = if crc.dtx {
            let failed = ctrl.record_dtx(Direction::Uplink);
            (failed, ctrl.resolve_dtx(Direction::Uplink, crc.harq_pid, now))
        } else {
            ctrl.record_pusch_measurements(crc.snr_x10, crc.rssi, crc.timing_advance);
            (false, ctrl.record_feedback(Direction::Uplink, crc.harq_pid, crc.crc_ok, now))
        };
        if let Err(e) = resolved {
            debug!("{}: CRC for {} ignored: {}", now, crc.rnti, e);
            self.stats.stale_feedback += 1;
        }
        if failed {
            self.notify_link_failure(crc.rnti, Direction::Uplink);
        }
    }

    fn handle_ra_progress(&mut self, now: SlotTime, progress: Result<RaProgress, MacError>) {
        match progress {
            Ok(RaProgress::Pending) => {}
            Ok(RaProgress::Completed(done)) => self.complete_random_access(now, done),
            Ok(RaProgress::Failed { rnti }) => {
                if let Some(rnti) = rnti {
                    self.notifications.push(MacNotification::RandomAccessFailed { rnti });
                }
            }
            Err(e) => debug!("{}: RA event ignored: {}", now, e),
        }
    }

    fn complete_random_access(&mut self, now: SlotTime, done: RaCompletion) {
        if let Some(crnti) = done.msg3_crnti.filter(|&crnti| self.registry.contains(crnti)) {
            if let Some(ue) = self.registry.get_mut(crnti) {
                ue.sched_ctrl.clear_link_failure();
            }
            info!("{}: UE {} re-accessed, TC-RNTI {} released", now, crnti, done.rnti);
            return;
        }
        if let Some(ue) = self.registry.get_mut(done.rnti) {
            ue.sched_ctrl.clear_link_failure();
            info!("{}: UE {} completed {}RA", now, done.rnti, if done.cfra { "CF" } else { "CB" });
            return;
        }

        let mut ue = UeInfo::new(done.rnti, UeSchedCtrl::new(&self.config, done.beam_index));
        ue.cont_res_id = done.cont_res_id;
        match self.registry.attach(ue) {
            Ok(uid) => {
                info!("{}: UE {} attached with uid {} (TA {})", now, done.rnti, uid, done.timing_advance);
                self.notifications.push(MacNotification::UeAttached { rnti: done.rnti, uid });
            }
            Err(e) => {
                warn!("{}: UE {} could not attach: {}", now, done.rnti, e);
                self.stats.registry_full += 1;
                self.notifications.push(MacNotification::RandomAccessFailed { rnti: done.rnti });
            }
        }
    }

    fn expire(&mut self, now: SlotTime) {
        self.registry.for_each(|ue| {
            let (dl, ul) = ue.sched_ctrl.expire_harq(now);
            if dl.expired + ul.expired > 0 {
                debug!("{}: UE {} HARQ timeouts DL {} UL {}", now, ue.rnti, dl.expired, ul.expired);
            }
        });

        self.failed_ra.clear();
        self.ra.expire(now, &mut self.failed_ra);
        for rnti in self.failed_ra.drain(..).flatten() {
            self.notifications.push(MacNotification::RandomAccessFailed { rnti });
        }
    }

    fn schedule_ra(&mut self, now: SlotTime, out: &mut SlotSchedule) {
        for idx in 0..self.ra.capacity() {
            match self.ra.get(idx).map(|p| p.state()) {
                Some(RaState::Msg2) => self.schedule_rar(idx, now, out),
                Some(RaState::Msg3Retransmission) => self.schedule_msg3_retx(idx, now, out),
                Some(RaState::Msg4 | RaState::MsgB) => self.schedule_msg4(idx, now, out),
                _ => {}
            }
        }
    }

    fn schedule_rar(&mut self, idx: usize, now: SlotTime, out: &mut SlotSchedule) {
        let Some(procedure) = self.ra.get(idx) else { return };
        let Some(rnti) = procedure.rnti() else { return };
        let (beam_id, ra_rnti) = (procedure.beam_index() as u16, procedure.ra_rnti());
        let (preamble_index, timing_advance) = (procedure.preamble_index(), procedure.timing_advance());
        let msg3_time = self.ra.msg3_time_for(now);
        let (dl_slot, ul_slot) = (self.slot_index(now), self.slot_index(msg3_time));
        let ra_cfg = &self.config.ra;
        let (rar_nb_rb, msg3_nb_rb) = (ra_cfg.rar_nb_rb, ra_cfg.msg3_nb_rb);

        let Some((rar_rbs, beam_idx)) = claim_prbs(
            &mut self.beams, &mut self.dl_map, &mut self.stats, now, dl_slot, beam_id, rar_nb_rb, rar_nb_rb, false,
        ) else {
            trace!("{}: no DL room for RAR of RA {}", now, idx);
            return;
        };
        let Some((msg3_rbs, ul_beam)) = claim_prbs(
            &mut self.beams, &mut self.ul_map, &mut self.stats, msg3_time, ul_slot, beam_id, msg3_nb_rb, msg3_nb_rb, true,
        ) else {
            trace!("{}: no UL room at {} for Msg3 of RA {}", now, msg3_time, idx);
            self.dl_map.release(dl_slot, &[beam_idx], rar_rbs);
            return;
        };

        let msg3 = Msg3Alloc {
            rb_start: msg3_rbs.start,
            rb_size: msg3_rbs.len,
            tpc: MSG3_TPC_0DB,
            round: 0,
            start_symbol: self.config.ra.msg3_start_symbol,
            nb_symbols: self.config.ra.msg3_nb_symbols,
        };
        match self.ra.rar_sent(idx, now, msg3) {
            Ok(msg3_time) => out.rars.push(RarGrant {
                ra_rnti,
                rnti,
                preamble_index,
                timing_advance,
                rar_rbs,
                msg3,
                msg3_time,
                beam_idx,
            }),
            Err(e) => {
                warn!("{}: RAR for RA {} dropped: {}", now, idx, e);
                self.dl_map.release(dl_slot, &[beam_idx], rar_rbs);
                self.ul_map.release(ul_slot, &[ul_beam], msg3_rbs);
            }
        }
    }

    fn schedule_msg3_retx(&mut self, idx: usize, now: SlotTime, out: &mut SlotSchedule) {
        let Some(procedure) = self.ra.get(idx) else { return };
        let Some(rnti) = procedure.rnti() else { return };
        let beam_id = procedure.beam_index() as u16;
        let previous = *procedure.msg3();
        let pusch_time = self.after(now, self.config.harq.k2);
        let ul_slot = self.slot_index(pusch_time);

        let Some((rbs, beam_idx)) = claim_prbs(
            &mut self.beams, &mut self.ul_map, &mut self.stats, pusch_time, ul_slot, beam_id, previous.rb_size, previous.rb_size, true,
        ) else {
            trace!("{}: no UL room for Msg3 retransmission of RA {}", now, idx);
            return;
        };
        let msg3 = Msg3Alloc { rb_start: rbs.start, ..previous };
        if let Err(e) = self.ra.msg3_retx_scheduled(idx, pusch_time, msg3) {
            warn!("{}: Msg3 retransmission for RA {} dropped: {}", now, idx, e);
            self.ul_map.release(ul_slot, &[beam_idx], rbs);
            return;
        }
        out.ul_grants.push(UlGrant {
            rnti,
            harq_pid: None,
            alloc: ResourceAllocation {
                rb_start: rbs.start,
                rb_size: rbs.len,
                mcs: MSG_MCS,
                tb_size: 0,
                nr_of_layers: 1,
                start_symbol: msg3.start_symbol,
                nb_symbols: msg3.nb_symbols,
            },
            rv: rv_for_round(msg3.round),
            ndi: false,
            retransmission: true,
            beam_idx,
            pusch_time,
            tpc: msg3.tpc,
        });
    }

    fn schedule_msg4(&mut self, idx: usize, now: SlotTime, out: &mut SlotSchedule) {
        let Some(procedure) = self.ra.get(idx) else { return };
        let Some(rnti) = procedure.rnti() else { return };
        let (beam_id, two_step, round) = (procedure.beam_index() as u16, procedure.is_two_step(), procedure.msg4_round());
        let cont_res_id = procedure.contention_resolution_id();
        let timing_advance = procedure.timing_advance();
        let dl_slot = self.slot_index(now);
        let nb_rb = self.config.ra.msg4_nb_rb;

        let Some((rbs, beam_idx)) = claim_prbs(
            &mut self.beams, &mut self.dl_map, &mut self.stats, now, dl_slot, beam_id, nb_rb, nb_rb, false,
        ) else {
            trace!("{}: no DL room for Msg4 of RA {}", now, idx);
            return;
        };
        let sent = if two_step { self.ra.msgb_sent(idx, now) } else { self.ra.msg4_sent(idx, now) };
        if let Err(e) = sent {
            warn!("{}: Msg4 for RA {} dropped: {}", now, idx, e);
            self.dl_map.release(dl_slot, &[beam_idx], rbs);
            return;
        }

        let nb_symbols = self.config.pdsch_symbols;
        let tb_size = compute_tbs_bytes(&TbsParams {
            table: McsTable::Qam64,
            mcs: MSG_MCS,
            nb_rb: rbs.len,
            nb_symb: nb_symbols,
            dmrs_re_per_prb: self.config.dmrs_re_per_prb,
            nr_of_layers: 1,
        });
        out.dl_grants.push(DlGrant {
            rnti,
            kind: if two_step { DlGrantKind::MsgB { cont_res_id } } else { DlGrantKind::Msg4 { cont_res_id } },
            harq_pid: MSG4_HARQ_PID,
            alloc: ResourceAllocation {
                rb_start: rbs.start,
                rb_size: rbs.len,
                mcs: MSG_MCS,
                tb_size,
                nr_of_layers: 1,
                start_symbol: 14 - nb_symbols,
                nb_symbols,
            },
            rv: rv_for_round(round),
            ndi: false,
            retransmission: round > 0,
            beam_idx,
            pucch_time: self.after(now, self.config.harq.k1),
            ta_command: Some(timing_advance),
            payload: None,
        });
    }

    fn schedule_dl(&mut self, now: SlotTime, out: &mut SlotSchedule) {
        let capacity = self.registry.capacity();
        if capacity == 0 {
            return;
        }
        let slot_idx = self.slot_index(now);
        let (k1, nb_symbols) = (self.config.harq.k1, self.config.pdsch_symbols);
        let start = self.dl_rr % capacity;
        self.dl_rr = self.dl_rr.wrapping_add(1);
        let mut scheduled = 0;

        for offset in 0..capacity {
            if scheduled >= self.config.max_dl_ues_per_slot {
                break;
            }
            let uid = ((start + offset) % capacity) as u16;
            let Some(ue) = self.registry.by_uid_mut(uid) else { continue };
            let rnti = ue.rnti;
            let ctrl = &mut ue.sched_ctrl;
            let beam_id = ctrl.beam_index() as u16;

            let (harq_pid, template, wanted, min) = if let Some(pid) = ctrl.dl_harq().next_retransmission() {
                let Some(process) = ctrl.dl_harq().process(pid) else { continue };
                let alloc = *process.allocation();
                (pid, alloc, alloc.rb_size, alloc.rb_size)
            } else {
                if ctrl.link_failure() || ctrl.dl_pending_bytes() == 0 {
                    continue;
                }
                let pid = match ctrl.dl_harq().free_process() {
                    Ok(pid) => pid,
                    Err(e) => {
                        trace!("{}: UE {} deferred: {}", now, rnti, e);
                        self.stats.harq_pool_exhausted += 1;
                        continue;
                    }
                };
                let mcs = ctrl.next_mcs(Direction::Downlink, &self.config.dl_bler, now.frame);
                let params = TbsParams {
                    table: ctrl.dl_table(),
                    mcs,
                    nb_rb: 0,
                    nb_symb: nb_symbols,
                    dmrs_re_per_prb: self.config.dmrs_re_per_prb,
                    nr_of_layers: 1,
                };
                let wanted = rbs_for_bytes(params, ctrl.dl_pending_bytes(), self.num_prbs);
                let template = ResourceAllocation {
                    mcs,
                    nr_of_layers: 1,
                    start_symbol: 14 - nb_symbols,
                    nb_symbols,
                    ..ResourceAllocation::default()
                };
                (pid, template, wanted, 1)
            };

            let Some((range, beam_idx)) = claim_prbs(
                &mut self.beams, &mut self.dl_map, &mut self.stats, now, slot_idx, beam_id, wanted, min, false,
            ) else {
                trace!("{}: no DL room for UE {}", now, rnti);
                continue;
            };
            let retransmission = template.rb_size > 0;
            let tb_size = if retransmission {
                template.tb_size
            } else {
                compute_tbs_bytes(&TbsParams {
                    table: ctrl.dl_table(),
                    mcs: template.mcs,
                    nb_rb: range.len,
                    nb_symb: template.nb_symbols,
                    dmrs_re_per_prb: self.config.dmrs_re_per_prb,
                    nr_of_layers: template.nr_of_layers,
                })
            };
            let alloc = ResourceAllocation { rb_start: range.start, rb_size: range.len, tb_size, ..template };

            let decision = match ctrl.stage_downlink_grant(harq_pid, alloc, now, k1, None) {
                Ok(decision) => decision.clone(),
                Err(e) => {
                    warn!("{}: DL grant for UE {} dropped: {}", now, rnti, e);
                    self.dl_map.release(slot_idx, &[beam_idx], range);
                    continue;
                }
            };
            let payload = ctrl.dl_harq().process(harq_pid).and_then(|p| p.transport_block().cloned());
            out.dl_grants.push(DlGrant {
                rnti,
                kind: DlGrantKind::Data,
                harq_pid,
                alloc: decision.alloc,
                rv: decision.rv,
                ndi: decision.ndi,
                retransmission: decision.retransmission,
                beam_idx,
                pucch_time: decision.pucch_time,
                ta_command: ctrl.take_ta_command(),
                payload,
            });
            scheduled += 1;
        }
    }

    fn schedule_ul(&mut self, now: SlotTime, out: &mut SlotSchedule) {
        let capacity = self.registry.capacity();
        if capacity == 0 {
            return;
        }
        let pusch_time = self.after(now, self.config.harq.k2);
        let slot_idx = self.slot_index(pusch_time);
        let nb_symbols = self.config.pusch_symbols;
        let start = self.ul_rr % capacity;
        self.ul_rr = self.ul_rr.wrapping_add(1);
        let mut scheduled = 0;

        for offset in 0..capacity {
            if scheduled >= self.config.max_ul_ues_per_slot {
                break;
            }
            let uid = ((start + offset) % capacity) as u16;
            let Some(ue) = self.registry.by_uid_mut(uid) else { continue };
            let rnti = ue.rnti;
            let ctrl = &mut ue.sched_ctrl;
            let beam_id = ctrl.beam_index() as u16;

            let (harq_pid, template, wanted, min) = if let Some(pid) = ctrl.ul_harq().next_retransmission() {
                let Some(process) = ctrl.ul_harq().process(pid) else { continue };
                let alloc = *process.allocation();
                (pid, alloc, alloc.rb_size, alloc.rb_size)
            } else {
                if ctrl.link_failure() || !ctrl.wants_ul_grant(now.frame, self.config.ulsch_max_frame_inactivity) {
                    continue;
                }
                let pid = match ctrl.ul_harq().free_process() {
                    Ok(pid) => pid,
                    Err(e) => {
                        trace!("{}: UE {} deferred: {}", now, rnti, e);
                        self.stats.harq_pool_exhausted += 1;
                        continue;
                    }
                };
                let buffer = ctrl.estimated_ul_buffer();
                let bler_mcs = ctrl.next_mcs(Direction::Uplink, &self.config.ul_bler, now.frame);
                let mcs = if buffer > 0 { bler_mcs } else { bler_mcs.min(self.config.min_grant_mcs) };
                let params = TbsParams {
                    table: ctrl.ul_table(),
                    mcs,
                    nb_rb: 0,
                    nb_symb: nb_symbols,
                    dmrs_re_per_prb: self.config.dmrs_re_per_prb,
                    nr_of_layers: 1,
                };
                let min_grant = self.config.min_grant_prb.max(1);
                let wanted = if buffer > 0 {
                    rbs_for_bytes(params, buffer, self.num_prbs).max(min_grant)
                } else {
                    min_grant
                };
                let template = ResourceAllocation {
                    mcs,
                    nr_of_layers: 1,
                    start_symbol: 14 - nb_symbols,
                    nb_symbols,
                    ..ResourceAllocation::default()
                };
                (pid, template, wanted, 1)
            };

            let Some((range, beam_idx)) = claim_prbs(
                &mut self.beams, &mut self.ul_map, &mut self.stats, pusch_time, slot_idx, beam_id, wanted, min, true,
            ) else {
                trace!("{}: no UL room at {} for UE {}", now, pusch_time, rnti);
                continue;
            };
            let retransmission = template.rb_size > 0;
            let tb_size = if retransmission {
                template.tb_size
            } else {
                compute_tbs_bytes(&TbsParams {
                    table: ctrl.ul_table(),
                    mcs: template.mcs,
                    nb_rb: range.len,
                    nb_symb: template.nb_symbols,
                    dmrs_re_per_prb: self.config.dmrs_re_per_prb,
                    nr_of_layers: template.nr_of_layers,
                })
            };
            let alloc = ResourceAllocation { rb_start: range.start, rb_size: range.len, tb_size, ..template };

            let decision = match ctrl.stage_uplink_grant(harq_pid, alloc, pusch_time) {
                Ok(decision) => decision.clone(),
                Err(e) => {
                    warn!("{}: UL grant for UE {} dropped: {}", now, rnti, e);
                    self.ul_map.release(slot_idx, &[beam_idx], range);
                    continue;
                }
            };
            out.ul_grants.push(UlGrant {
                rnti,
                harq_pid: Some(harq_pid),
                alloc: decision.alloc,
                rv: decision.rv,
                ndi: decision.ndi,
                retransmission: decision.retransmission,
                beam_idx,
                pusch_time: decision.pusch_time,
                tpc: decision.tpc,
            });
            scheduled += 1;
        }
    }

    /// Periodic SRS and CSI, then collect the UCI due in this slot
    fn schedule_uci(&mut self, now: SlotTime, out: &mut SlotSchedule) {
        let abs_slot = now.abs_slot(self.slots_per_frame);
        let (srs_period, csi_period) = (self.config.srs_period_slots as u32, self.config.csi_period_slots as u32);
        for ue in self.registry.iter_mut() {
            let offset = ue.uid as u32;
            if srs_period > 0 && (abs_slot + offset) % srs_period == 0 {
                ue.sched_ctrl.schedule_srs();
                out.srs.push(ue.rnti);
            }
            if csi_period > 0 && (abs_slot + offset) % csi_period == 0 {
                ue.sched_ctrl.schedule_csi(now, CSI_REPORT_BITS);
            }
            if let Some(occasion) = ue.sched_ctrl.take_pucch(now) {
                out.pucch.push(PucchGrant { rnti: ue.rnti, occasion });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use interfaces::message_types::{
        BsrIndication, DlBufferIndication, Msg3Content, Msg3Indication, PreambleInfo,
    };

    fn scheduler() -> MacScheduler {
        MacScheduler::new(MacConfig { srs_period_slots: 0, csi_period_slots: 0, ..MacConfig::default() }).unwrap()
    }

    fn rach(preambles: &[u8]) -> UplinkIndication {
        UplinkIndication::Rach(RachIndication {
            time: SlotTime::new(0, 0),
            symbol_index: 0,
            slot_index: 0,
            freq_index: 0,
            beam_index: 0,
            msg_a: false,
            preambles: preambles
                .iter()
                .map(|&preamble_index| PreambleInfo { preamble_index, timing_advance: 20, preamble_power: -90 })
                .collect(),
        })
    }

    fn feedback(rnti: Rnti, harq_pid: u8, value: HarqAck) -> UplinkIndication {
        UplinkIndication::HarqFeedback(HarqFeedbackIndication { rnti, harq_pid, value, pucch_snr_x10: None })
    }

    fn run(sched: &mut MacScheduler, frame: u16, slot: u16) -> SlotSchedule {
        let mut out = SlotSchedule::default();
        sched.run_slot(SlotTime::new(frame, slot), &mut out);
        out
    }

    fn overlaps(a: &ResourceAllocation, b: &ResourceAllocation) -> bool {
        a.rb_start < b.rb_start + b.rb_size && b.rb_start < a.rb_start + a.rb_size
    }

    #[test]
    fn test_contention_based_access_attaches_ue() {
        let mut sched = scheduler();
        sched.deliver(rach(&[12]));
        let out = run(&mut sched, 0, 0);
        assert_eq!(out.rars.len(), 1);
        let rar = &out.rars[0];
        assert_eq!(rar.rnti, Rnti(FIRST_C_RNTI));
        assert_eq!(rar.preamble_index, 12);
        assert_eq!(rar.msg3.rb_size, sched.config().ra.msg3_nb_rb);
        let tc_rnti = rar.rnti;

        sched.deliver(UplinkIndication::Msg3(Msg3Indication {
            rnti: tc_rnti,
            content: Msg3Content::ContentionResolutionId([9; 6]),
        }));
        let out = run(&mut sched, 0, 7);
        assert_eq!(out.dl_grants.len(), 1);
        assert_eq!(out.dl_grants[0].kind, DlGrantKind::Msg4 { cont_res_id: Some([9; 6]) });

        sched.deliver(feedback(tc_rnti, MSG4_HARQ_PID, HarqAck::Ack));
        run(&mut sched, 0, 11);
        assert_eq!(sched.registry().uid_of(tc_rnti), Some(0));
        assert_eq!(sched.registry().get(tc_rnti).and_then(|ue| ue.cont_res_id), Some([9; 6]));
        assert_eq!(sched.take_notifications(), vec![MacNotification::UeAttached { rnti: tc_rnti, uid: 0 }]);
        assert_eq!(sched.ra_pool().active_count(), 0);
        assert_eq!(sched.snapshot().cell.ra_successes, 1);
    }

    #[test]
    fn test_preamble_on_invalid_occasion_gets_no_rar() {
        let mut sched = scheduler();
        let UplinkIndication::Rach(mut bad) = rach(&[12]) else { unreachable!() };
        bad.freq_index = 255;
        sched.deliver(UplinkIndication::Rach(bad));
        let out = run(&mut sched, 0, 0);
        assert!(out.rars.is_empty());
        assert_eq!(sched.ra_pool().active_count(), 0);
        assert_eq!(sched.ra_pool().stats().invalid_occasions, 1);
        assert_eq!(sched.ra_pool().stats().attempts, 0);

        // the cell keeps serving valid preambles
        sched.deliver(rach(&[12]));
        assert_eq!(run(&mut sched, 0, 1).rars.len(), 1);
    }

    #[test]
    fn test_msg3_from_connected_ue_keeps_its_rnti() {
        let mut sched = scheduler();
        sched.add_ue(Rnti(0x100), 0).unwrap();
        sched.take_notifications();
        sched.deliver(rach(&[3]));
        let tc_rnti = run(&mut sched, 0, 0).rars[0].rnti;

        sched.deliver(UplinkIndication::Msg3(Msg3Indication { rnti: tc_rnti, content: Msg3Content::CRnti(Rnti(0x100)) }));
        run(&mut sched, 0, 7);
        sched.deliver(feedback(tc_rnti, MSG4_HARQ_PID, HarqAck::Ack));
        run(&mut sched, 0, 11);

        assert_eq!(sched.registry().len(), 1);
        assert!(!sched.registry().contains(tc_rnti));
        assert!(sched.take_notifications().is_empty());
    }

    #[test]
    fn test_preambles_beyond_pool_are_counted() {
        let mut sched = scheduler();
        sched.deliver(rach(&[1, 2, 3, 4, 5]));
        let out = run(&mut sched, 0, 0);
        assert_eq!(out.rars.len(), 4);
        let cell = sched.snapshot().cell;
        assert_eq!(cell.ra_attempts, 4);
        assert_eq!(cell.ra_pool_exhausted, 1);

        let rntis: Vec<Rnti> = out.rars.iter().map(|rar| rar.rnti).collect();
        for (i, a) in rntis.iter().enumerate() {
            assert!(!rntis[i + 1..].contains(a));
        }
        for (i, a) in out.rars.iter().enumerate() {
            for b in &out.rars[i + 1..] {
                assert!(a.rar_rbs.end() <= b.rar_rbs.start || b.rar_rbs.end() <= a.rar_rbs.start);
            }
        }
    }

    #[test]
    fn test_rnti_allocation_skips_attached_ues() {
        let mut sched = scheduler();
        sched.add_ue(Rnti(FIRST_C_RNTI), 0).unwrap();
        sched.deliver(rach(&[5]));
        let out = run(&mut sched, 0, 0);
        assert_eq!(out.rars[0].rnti, Rnti(FIRST_C_RNTI + 1));
    }

    #[test]
    fn test_msg3_loss_is_retransmitted() {
        let mut sched = scheduler();
        sched.deliver(rach(&[8]));
        let tc_rnti = run(&mut sched, 0, 0).rars[0].rnti;

        sched.deliver(UplinkIndication::Crc(CrcIndication {
            rnti: tc_rnti,
            harq_pid: 0,
            crc_ok: false,
            dtx: false,
            snr_x10: 0,
            rssi: 1000,
            timing_advance: None,
        }));
        let out = run(&mut sched, 0, 6);
        assert_eq!(out.ul_grants.len(), 1);
        let grant = &out.ul_grants[0];
        assert_eq!(grant.rnti, tc_rnti);
        assert_eq!(grant.harq_pid, None);
        assert_eq!(grant.rv, rv_for_round(1));
        assert_eq!(grant.pusch_time, SlotTime::new(0, 10));
    }

    #[test]
    fn test_dl_retransmission_reuses_transport_block() {
        let mut sched = scheduler();
        let rnti = Rnti(0x200);
        sched.add_ue(rnti, 0).unwrap();
        sched.deliver(UplinkIndication::DlBuffer(DlBufferIndication { rnti, pending_bytes: 2000 }));
        let out = run(&mut sched, 0, 0);
        let first = out.dl_grants.iter().find(|g| g.rnti == rnti).unwrap().clone();
        assert!(!first.retransmission);
        assert!(first.alloc.tb_size > 0);
        assert_eq!(first.pucch_time, SlotTime::new(0, 4));
        sched.attach_transport_block(rnti, first.harq_pid, Bytes::from_static(b"payload")).unwrap();

        sched.deliver(feedback(rnti, first.harq_pid, HarqAck::Nack));
        let out = run(&mut sched, 0, 1);
        let retx = out.dl_grants.iter().find(|g| g.rnti == rnti).unwrap();
        assert!(retx.retransmission);
        assert_eq!(retx.harq_pid, first.harq_pid);
        assert_eq!(retx.alloc.tb_size, first.alloc.tb_size);
        assert_eq!(retx.alloc.rb_size, first.alloc.rb_size);
        assert_eq!(retx.rv, rv_for_round(1));
        assert_eq!(retx.payload, Some(Bytes::from_static(b"payload")));
    }

    #[test]
    fn test_ul_grants_avoid_blacklisted_prbs() {
        let mut sched = scheduler();
        let rnti = Rnti(0x300);
        sched.add_ue(rnti, 0).unwrap();
        sched.apply_action(ControlAction::SetUlPrbBlacklist { prbs: (0..20).collect() }).unwrap();
        sched.deliver(UplinkIndication::Bsr(BsrIndication { rnti, buffer_bytes: 400 }));

        let out = run(&mut sched, 0, 0);
        let grant = out.ul_grants.iter().find(|g| g.rnti == rnti).unwrap();
        assert!(grant.alloc.rb_start >= 20);
        assert_eq!(grant.pusch_time, SlotTime::new(0, 4));

        assert!(sched.apply_action(ControlAction::SetUlPrbBlacklist { prbs: vec![9999] }).is_err());
        sched.apply_action(ControlAction::ClearUlPrbBlacklist).unwrap();
    }

    #[test]
    fn test_grants_never_share_prbs() {
        let mut sched = scheduler();
        for i in 0..6u16 {
            let rnti = Rnti(0x400 + i);
            sched.add_ue(rnti, 0).unwrap();
            sched.deliver(UplinkIndication::DlBuffer(DlBufferIndication { rnti, pending_bytes: 100_000 }));
            sched.deliver(UplinkIndication::Bsr(BsrIndication { rnti, buffer_bytes: 50_000 }));
        }
        let mut ul_by_slot: Vec<(SlotTime, ResourceAllocation)> = Vec::new();
        for slot in 0..20 {
            let out = run(&mut sched, 1, slot);
            assert!(out.dl_grants.len() <= sched.config().max_dl_ues_per_slot);
            for (i, a) in out.dl_grants.iter().enumerate() {
                assert!(a.alloc.rb_start + a.alloc.rb_size <= sched.config().prbs());
                for b in &out.dl_grants[i + 1..] {
                    assert!(!overlaps(&a.alloc, &b.alloc), "DL overlap in slot {}", slot);
                }
            }
            for grant in &out.ul_grants {
                for (time, other) in &ul_by_slot {
                    if *time == grant.pusch_time {
                        assert!(!overlaps(&grant.alloc, other), "UL overlap at {}", time);
                    }
                }
                ul_by_slot.push((grant.pusch_time, grant.alloc));
            }
        }
        let cell = sched.snapshot().cell;
        assert!(cell.used_prb_aggregate > 0);
        assert!(cell.used_prb_aggregate <= cell.total_prb_aggregate);
        assert_eq!(cell.resource_conflicts, 0);
    }

    #[test]
    fn test_remove_ue_drops_queued_indications() {
        let mut sched = scheduler();
        let rnti = Rnti(0x500);
        sched.add_ue(rnti, 0).unwrap();
        sched.deliver(UplinkIndication::DlBuffer(DlBufferIndication { rnti, pending_bytes: 100 }));
        assert_eq!(sched.pending_indications(), 1);

        sched.remove_ue(rnti).unwrap();
        assert_eq!(sched.pending_indications(), 0);
        assert!(sched.registry().is_empty());
        assert_eq!(sched.remove_ue(rnti), Err(MacError::UnknownUe(rnti)));

        sched.deliver(feedback(rnti, 0, HarqAck::Ack));
        let out = run(&mut sched, 0, 0);
        assert!(out.dl_grants.is_empty());
        assert_eq!(sched.stats().unknown_rnti, 1);
    }

    #[test]
    fn test_pusch_dtx_raises_link_failure_once() {
        let mut sched = scheduler();
        let rnti = Rnti(0x600);
        sched.add_ue(rnti, 0).unwrap();
        sched.take_notifications();
        let threshold = sched.config().power.pusch_failure_thres;
        for _ in 0..threshold + 2 {
            sched.deliver(UplinkIndication::Crc(CrcIndication {
                rnti,
                harq_pid: 0,
                crc_ok: false,
                dtx: true,
                snr_x10: 0,
                rssi: 0,
                timing_advance: None,
            }));
        }
        let out = run(&mut sched, 0, 0);
        assert_eq!(sched.take_notifications(), vec![MacNotification::LinkFailure { rnti }]);
        assert!(out.ul_grants.iter().all(|g| g.rnti != rnti));
        assert!(sched.snapshot().ues[0].link_failure);
    }

    #[test]
    fn test_bler_action_reaches_every_ue() {
        let mut sched = scheduler();
        sched.add_ue(Rnti(0x700), 0).unwrap();
        sched
            .apply_action(ControlAction::SetBlerOptions { direction: Direction::Uplink, upper: 0.3, lower: 0.1, max_mcs: 12 })
            .unwrap();
        assert_eq!(sched.config().ul_bler.max_mcs, 12);
        assert!(sched
            .apply_action(ControlAction::SetBlerOptions { direction: Direction::Uplink, upper: 0.1, lower: 0.3, max_mcs: 12 })
            .is_err());
    }

    #[test]
    fn test_reconfigure_refuses_to_drop_attached_ues() {
        let mut sched = scheduler();
        sched.add_ue(Rnti(0x800), 0).unwrap();
        sched.add_ue(Rnti(0x801), 0).unwrap();
        let smaller = MacConfig { max_ues: 1, ..sched.config().clone() };
        assert!(sched.reconfigure(smaller).is_err());

        let wider = MacConfig { num_prbs: Some(106), ..sched.config().clone() };
        sched.reconfigure(wider).unwrap();
        assert_eq!(sched.config().prbs(), 106);
        assert_eq!(sched.registry().len(), 2);
    }
}
