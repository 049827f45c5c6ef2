//! Random Access State Machine
//!
//! Cell-wide pool of random access procedures (3GPP TS 38.321 §5.1).
//! Contention-based 4-step access runs
//! `IDLE -> Msg2 -> WAIT_Msg3 (-> Msg3_retransmission)* -> Msg4 -> WAIT_Msg4_MsgB_ACK -> IDLE`,
//! 2-step access runs `IDLE -> WAIT_MsgA_PUSCH -> MsgB -> WAIT_Msg4_MsgB_ACK -> IDLE`.
//! Contention-free procedures are prepared ahead and complete on Msg3.

use std::fmt;

use common::types::{Rnti, SlotTime};
use interfaces::message_types::{Msg3Content, PreambleInfo};
use tracing::{debug, info, warn};

use super::config::RaConfig;
use super::{MacError, Pool};

/// State of one RA procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RaState {
    #[default]
    Idle,
    Msg2,
    WaitMsgAPusch,
    WaitMsg3,
    Msg3Retransmission,
    Msg4,
    MsgB,
    WaitMsg4MsgBAck,
}

impl fmt::Display for RaState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RaState::Idle => "IDLE",
            RaState::Msg2 => "Msg2",
            RaState::WaitMsgAPusch => "WAIT_MsgA_PUSCH",
            RaState::WaitMsg3 => "WAIT_Msg3",
            RaState::Msg3Retransmission => "Msg3_retransmission",
            RaState::Msg4 => "Msg4",
            RaState::MsgB => "MsgB",
            RaState::WaitMsg4MsgBAck => "WAIT_Msg4_MsgB_ACK",
        };
        f.write_str(name)
    }
}

/// PRACH occasion a preamble was detected in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrachOccasion {
    /// First OFDM symbol of the occasion (s_id, 0..14)
    pub symbol_index: u8,
    /// Slot within the frame (t_id, 0..80)
    pub slot_index: u8,
    /// Frequency-domain occasion (f_id, 0..8)
    pub freq_index: u8,
}

/// Symbols per slot (s_id bound)
const PRACH_SYMBOLS: u32 = 14;
/// Slots per frame at the largest numerology (t_id bound)
const PRACH_SLOTS: u32 = 80;
/// Frequency-domain occasions (f_id bound)
const PRACH_FREQS: u32 = 8;
/// NUL and SUL (ul_carrier_id bound)
pub const PRACH_UL_CARRIERS: u8 = 2;

impl PrachOccasion {
    pub fn is_valid(&self) -> bool {
        (self.symbol_index as u32) < PRACH_SYMBOLS
            && (self.slot_index as u32) < PRACH_SLOTS
            && (self.freq_index as u32) < PRACH_FREQS
    }
}

/// RA-RNTI of a PRACH occasion (38.321 §5.1.3)
pub fn ra_rnti(occasion: PrachOccasion, ul_carrier_id: u8) -> Result<u16, MacError> {
    if !occasion.is_valid() || ul_carrier_id >= PRACH_UL_CARRIERS {
        return Err(MacError::InvalidPrachOccasion {
            symbol: occasion.symbol_index,
            slot: occasion.slot_index,
            freq: occasion.freq_index,
            ul_carrier: ul_carrier_id,
        });
    }
    let rnti = 1
        + occasion.symbol_index as u32
        + PRACH_SYMBOLS * occasion.slot_index as u32
        + PRACH_SYMBOLS * PRACH_SLOTS * occasion.freq_index as u32
        + PRACH_SYMBOLS * PRACH_SLOTS * PRACH_FREQS * ul_carrier_id as u32;
    // at most 17920 once the ranges hold
    Ok(rnti as u16)
}

/// MsgB-RNTI of a PRACH occasion (38.321 §5.1.3a)
pub fn msgb_rnti(occasion: PrachOccasion, ul_carrier_id: u8) -> Result<u16, MacError> {
    let offset = PRACH_SYMBOLS * PRACH_SLOTS * PRACH_FREQS * PRACH_UL_CARRIERS as u32;
    Ok(ra_rnti(occasion, ul_carrier_id)? + offset as u16)
}

/// Msg3 PUSCH resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Msg3Alloc {
    pub rb_start: u16,
    pub rb_size: u16,
    pub tpc: u8,
    pub round: u8,
    pub start_symbol: u8,
    pub nb_symbols: u8,
}

/// One random access procedure
#[derive(Debug, Clone, Default)]
pub struct RaProcedure {
    state: RaState,
    cfra: bool,
    two_step: bool,
    /// Dedicated preambles of a prepared contention-free procedure
    dedicated_preambles: Vec<u8>,
    preamble_index: u8,
    preamble_time: SlotTime,
    occasion: PrachOccasion,
    timing_advance: u16,
    beam_index: u8,
    ra_rnti: u16,
    msgb_rnti: u16,
    /// TC-RNTI, or the C-RNTI of a contention-free procedure
    rnti: Option<Rnti>,
    msg2_time: SlotTime,
    msg3_time: SlotTime,
    msg3: Msg3Alloc,
    msg4_round: u8,
    /// Expiry of the state being waited in
    deadline: Option<SlotTime>,
    cont_res_id: Option<[u8; 6]>,
    /// C-RNTI reported in Msg3 by an already connected UE
    msg3_crnti: Option<Rnti>,
}

impl RaProcedure {
    pub fn state(&self) -> RaState {
        self.state
    }

    pub fn is_idle(&self) -> bool {
        self.state == RaState::Idle
    }

    /// Idle and not held for a contention-free access
    fn is_free(&self) -> bool {
        self.is_idle() && !self.cfra
    }

    pub fn is_cfra(&self) -> bool {
        self.cfra
    }

    pub fn is_two_step(&self) -> bool {
        self.two_step
    }

    pub fn rnti(&self) -> Option<Rnti> {
        self.rnti
    }

    pub fn preamble_index(&self) -> u8 {
        self.preamble_index
    }

    pub fn preamble_time(&self) -> SlotTime {
        self.preamble_time
    }

    pub fn timing_advance(&self) -> u16 {
        self.timing_advance
    }

    pub fn beam_index(&self) -> u8 {
        self.beam_index
    }

    pub fn ra_rnti(&self) -> u16 {
        self.ra_rnti
    }

    pub fn msgb_rnti(&self) -> u16 {
        self.msgb_rnti
    }

    pub fn msg2_time(&self) -> SlotTime {
        self.msg2_time
    }

    pub fn msg3_time(&self) -> SlotTime {
        self.msg3_time
    }

    pub fn msg3(&self) -> &Msg3Alloc {
        &self.msg3
    }

    pub fn msg4_round(&self) -> u8 {
        self.msg4_round
    }

    pub fn deadline(&self) -> Option<SlotTime> {
        self.deadline
    }

    pub fn contention_resolution_id(&self) -> Option<[u8; 6]> {
        self.cont_res_id
    }

    pub fn msg3_crnti(&self) -> Option<Rnti> {
        self.msg3_crnti
    }

    fn store_msg3(&mut self, content: &Msg3Content) {
        match content {
            Msg3Content::ContentionResolutionId(id) => self.cont_res_id = Some(*id),
            Msg3Content::CRnti(rnti) => self.msg3_crnti = Some(*rnti),
        }
    }
}

/// What a successful procedure hands to the scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaCompletion {
    /// RNTI the UE keeps (TC-RNTI promoted, or the CFRA C-RNTI)
    pub rnti: Rnti,
    /// C-RNTI from Msg3 when an already connected UE did the access
    pub msg3_crnti: Option<Rnti>,
    pub cont_res_id: Option<[u8; 6]>,
    pub beam_index: u8,
    pub timing_advance: u16,
    pub cfra: bool,
}

/// Result of an RA event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaProgress {
    /// Procedure moved on and is still running
    Pending,
    Completed(RaCompletion),
    /// Procedure abandoned and its slot released
    Failed { rnti: Option<Rnti> },
}

/// RA counters of the cell
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RaStats {
    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub pool_exhausted: u64,
    /// Preambles reported on an impossible PRACH occasion
    pub invalid_occasions: u64,
}

/// Bounded pool of RA procedures
#[derive(Debug, Clone)]
pub struct RaPool {
    procedures: Vec<RaProcedure>,
    config: RaConfig,
    slots_per_frame: u16,
    stats: RaStats,
}

impl RaPool {
    pub fn new(config: &RaConfig, slots_per_frame: u16) -> Self {
        Self {
            procedures: vec![RaProcedure::default(); config.pool_size],
            config: config.clone(),
            slots_per_frame,
            stats: RaStats::default(),
        }
    }

    /// Apply new timing. A changed pool size drops every running procedure.
    pub fn reconfigure(&mut self, config: &RaConfig, slots_per_frame: u16) {
        if config.pool_size != self.procedures.len() || slots_per_frame != self.slots_per_frame {
            let active = self.active_count();
            if active > 0 {
                warn!("RA pool rebuilt with {} procedures in progress", active);
            }
            self.procedures = vec![RaProcedure::default(); config.pool_size];
        }
        self.config = config.clone();
        self.slots_per_frame = slots_per_frame;
    }

    pub fn stats(&self) -> &RaStats {
        &self.stats
    }

    pub fn capacity(&self) -> usize {
        self.procedures.len()
    }

    pub fn get(&self, idx: usize) -> Option<&RaProcedure> {
        self.procedures.get(idx)
    }

    /// Procedures with their pool index
    pub fn iter(&self) -> impl Iterator<Item = (usize, &RaProcedure)> {
        self.procedures.iter().enumerate()
    }

    /// Procedures that are not idle
    pub fn active_count(&self) -> usize {
        self.procedures.iter().filter(|p| !p.is_idle()).count()
    }

    /// Procedure using `rnti`, including prepared contention-free ones
    pub fn find_by_rnti(&self, rnti: Rnti) -> Option<usize> {
        self.procedures
            .iter()
            .position(|p| (!p.is_idle() || p.cfra) && p.rnti == Some(rnti))
    }

    pub fn rnti_in_use(&self, rnti: Rnti) -> bool {
        self.find_by_rnti(rnti).is_some()
    }

    fn add(&self, time: SlotTime, slots: u16) -> SlotTime {
        time.add_slots(slots as u32, self.slots_per_frame)
    }

    /// Slot of the Msg3 granted by a RAR sent at `now`
    pub fn msg3_time_for(&self, now: SlotTime) -> SlotTime {
        self.add(now, self.config.msg3_delay_slots as u16)
    }

    fn procedure_mut(&mut self, idx: usize, expected: RaState, event: &'static str) -> Result<&mut RaProcedure, MacError> {
        let procedure = self.procedures.get_mut(idx).ok_or(MacError::UnknownRaProcedure(idx))?;
        if procedure.state != expected {
            debug!("RA {}: {} not expected in {}", idx, event, procedure.state);
            return Err(MacError::UnexpectedRaEvent { state: procedure.state, event });
        }
        Ok(procedure)
    }

    /// Hold a slot for a UE that was given dedicated preambles
    pub fn prepare_cfra(&mut self, rnti: Rnti, preambles: &[u8], beam_index: u8) -> Result<usize, MacError> {
        let Some(idx) = self.procedures.iter().position(RaProcedure::is_free) else {
            self.stats.pool_exhausted += 1;
            warn!("No RA slot to prepare contention-free access for {}", rnti);
            return Err(MacError::PoolExhausted(Pool::RandomAccess));
        };
        self.procedures[idx] = RaProcedure {
            cfra: true,
            dedicated_preambles: preambles.to_vec(),
            rnti: Some(rnti),
            beam_index,
            ..RaProcedure::default()
        };
        debug!("RA {}: contention-free access prepared for {} with preambles {:?}", idx, rnti, preambles);
        Ok(idx)
    }

    /// Drop every procedure held by `rnti`. Returns whether one existed.
    pub fn release_rnti(&mut self, rnti: Rnti) -> bool {
        match self.find_by_rnti(rnti) {
            Some(idx) => {
                self.procedures[idx] = RaProcedure::default();
                true
            }
            None => false,
        }
    }

    /// Start a procedure for a detected preamble.
    ///
    /// A dedicated preamble resumes the prepared contention-free procedure;
    /// otherwise a free slot is claimed with `tc_rnti`. A full pool rejects
    /// the preamble and leaves running procedures untouched.
    pub fn on_preamble(
        &mut self,
        now: SlotTime,
        occasion: PrachOccasion,
        preamble: &PreambleInfo,
        beam_index: u8,
        msg_a: bool,
        tc_rnti: Rnti,
    ) -> Result<usize, MacError> {
        let ul_carrier_id = self.config.ul_carrier_id;
        let rntis = ra_rnti(occasion, ul_carrier_id).and_then(|ra| msgb_rnti(occasion, ul_carrier_id).map(|b| (ra, b)));
        let (occasion_ra_rnti, occasion_msgb_rnti) = match rntis {
            Ok(rntis) => rntis,
            Err(e) => {
                self.stats.invalid_occasions += 1;
                warn!("{}: preamble {} dropped: {}", now, preamble.preamble_index, e);
                return Err(e);
            }
        };
        let cfra = self.procedures.iter().position(|p| {
            p.cfra && p.is_idle() && p.dedicated_preambles.contains(&preamble.preamble_index)
        });
        let idx = match cfra.or_else(|| self.procedures.iter().position(RaProcedure::is_free)) {
            Some(idx) => idx,
            None => {
                self.stats.pool_exhausted += 1;
                warn!("{}: RA pool full, dropping preamble {}", now, preamble.preamble_index);
                return Err(MacError::PoolExhausted(Pool::RandomAccess));
            }
        };

        let deadline = self.add(now, self.config.response_window_slots);
        let procedure = &mut self.procedures[idx];
        if !procedure.cfra {
            procedure.rnti = Some(tc_rnti);
            procedure.beam_index = beam_index;
        }
        procedure.two_step = msg_a && !procedure.cfra;
        procedure.state = if procedure.two_step { RaState::WaitMsgAPusch } else { RaState::Msg2 };
        procedure.preamble_index = preamble.preamble_index;
        procedure.preamble_time = now;
        procedure.occasion = occasion;
        procedure.timing_advance = preamble.timing_advance;
        procedure.ra_rnti = occasion_ra_rnti;
        procedure.msgb_rnti = occasion_msgb_rnti;
        procedure.deadline = Some(deadline);
        procedure.msg3 = Msg3Alloc::default();
        procedure.msg4_round = 0;
        procedure.cont_res_id = None;
        procedure.msg3_crnti = None;

        self.stats.attempts += 1;
        info!(
            "{}: RA {} preamble {} TA {} -> {} rnti {} ra-rnti {:04x}{}",
            now,
            idx,
            preamble.preamble_index,
            preamble.timing_advance,
            procedure.state,
            procedure.rnti.map(|r| r.to_string()).unwrap_or_default(),
            procedure.ra_rnti,
            if procedure.cfra { " (contention-free)" } else { "" }
        );
        Ok(idx)
    }

    /// RAR transmitted at `now` granting `msg3`. Returns the Msg3 slot.
    pub fn rar_sent(&mut self, idx: usize, now: SlotTime, msg3: Msg3Alloc) -> Result<SlotTime, MacError> {
        let msg3_time = self.msg3_time_for(now);
        let deadline = self.add(msg3_time, self.config.msg3_timeout_slots);
        let procedure = self.procedure_mut(idx, RaState::Msg2, "RAR sent")?;
        procedure.state = RaState::WaitMsg3;
        procedure.msg2_time = now;
        procedure.msg3_time = msg3_time;
        procedure.msg3 = Msg3Alloc { round: 0, ..msg3 };
        procedure.deadline = Some(deadline);
        debug!("{}: RA {} RAR sent, Msg3 expected at {}", now, idx, msg3_time);
        Ok(msg3_time)
    }

    /// Msg3 decoded
    pub fn msg3_received(&mut self, idx: usize, content: &Msg3Content, now: SlotTime) -> Result<RaProgress, MacError> {
        let deadline = self.add(now, self.config.contention_resolution_timer_slots);
        let procedure = self.procedure_mut(idx, RaState::WaitMsg3, "Msg3 received")?;
        procedure.store_msg3(content);
        if procedure.cfra {
            return Ok(self.complete(idx, now));
        }
        procedure.state = RaState::Msg4;
        procedure.deadline = Some(deadline);
        debug!("{}: RA {} Msg3 received, contention resolution until {}", now, idx, deadline);
        Ok(RaProgress::Pending)
    }

    /// Msg3 missed or failed CRC
    pub fn msg3_failed(&mut self, idx: usize, now: SlotTime) -> Result<RaProgress, MacError> {
        self.procedure_mut(idx, RaState::WaitMsg3, "Msg3 failed")?;
        Ok(self.retry_msg3(idx, now))
    }

    fn retry_msg3(&mut self, idx: usize, now: SlotTime) -> RaProgress {
        let max_rounds = self.config.msg3_max_rounds;
        let deadline = self.add(now, self.config.response_window_slots);
        let procedure = &mut self.procedures[idx];
        procedure.msg3.round += 1;
        if procedure.msg3.round >= max_rounds {
            debug!("{}: RA {} Msg3 failed after {} rounds", now, idx, procedure.msg3.round);
            return self.fail(idx, now);
        }
        procedure.state = RaState::Msg3Retransmission;
        procedure.deadline = Some(deadline);
        debug!("{}: RA {} Msg3 round {} needs a retransmission", now, idx, procedure.msg3.round);
        RaProgress::Pending
    }

    /// Msg3 retransmission granted for `msg3_time`
    pub fn msg3_retx_scheduled(&mut self, idx: usize, msg3_time: SlotTime, msg3: Msg3Alloc) -> Result<(), MacError> {
        let deadline = self.add(msg3_time, self.config.msg3_timeout_slots);
        let procedure = self.procedure_mut(idx, RaState::Msg3Retransmission, "Msg3 retransmission scheduled")?;
        procedure.state = RaState::WaitMsg3;
        procedure.msg3 = Msg3Alloc { round: procedure.msg3.round, ..msg3 };
        procedure.msg3_time = msg3_time;
        procedure.deadline = Some(deadline);
        Ok(())
    }

    /// Msg4 transmitted; the contention-resolution timer keeps running
    pub fn msg4_sent(&mut self, idx: usize, now: SlotTime) -> Result<(), MacError> {
        let procedure = self.procedure_mut(idx, RaState::Msg4, "Msg4 sent")?;
        procedure.state = RaState::WaitMsg4MsgBAck;
        debug!("{}: RA {} Msg4 round {} sent", now, idx, procedure.msg4_round);
        Ok(())
    }

    /// MsgA PUSCH decoded
    pub fn msga_pusch_received(&mut self, idx: usize, content: &Msg3Content, now: SlotTime) -> Result<RaProgress, MacError> {
        let deadline = self.add(now, self.config.contention_resolution_timer_slots);
        let procedure = self.procedure_mut(idx, RaState::WaitMsgAPusch, "MsgA PUSCH received")?;
        procedure.store_msg3(content);
        procedure.state = RaState::MsgB;
        procedure.deadline = Some(deadline);
        Ok(RaProgress::Pending)
    }

    /// MsgA PUSCH not decoded: fall back to the 4-step procedure
    pub fn msga_pusch_failed(&mut self, idx: usize, now: SlotTime) -> Result<RaProgress, MacError> {
        let deadline = self.add(now, self.config.response_window_slots);
        let procedure = self.procedure_mut(idx, RaState::WaitMsgAPusch, "MsgA PUSCH failed")?;
        procedure.two_step = false;
        procedure.state = RaState::Msg2;
        procedure.deadline = Some(deadline);
        debug!("{}: RA {} MsgA PUSCH lost, falling back to RAR", now, idx);
        Ok(RaProgress::Pending)
    }

    /// MsgB transmitted
    pub fn msgb_sent(&mut self, idx: usize, now: SlotTime) -> Result<(), MacError> {
        let procedure = self.procedure_mut(idx, RaState::MsgB, "MsgB sent")?;
        procedure.state = RaState::WaitMsg4MsgBAck;
        debug!("{}: RA {} MsgB sent", now, idx);
        Ok(())
    }

    /// HARQ feedback for Msg4 or MsgB
    pub fn msg4_feedback(&mut self, idx: usize, ack: bool, now: SlotTime) -> Result<RaProgress, MacError> {
        let max_rounds = self.config.msg4_max_rounds;
        let procedure = self.procedure_mut(idx, RaState::WaitMsg4MsgBAck, "Msg4/MsgB feedback")?;
        if ack {
            return Ok(self.complete(idx, now));
        }
        procedure.msg4_round += 1;
        if procedure.msg4_round >= max_rounds {
            return Ok(self.fail(idx, now));
        }
        procedure.state = if procedure.two_step { RaState::MsgB } else { RaState::Msg4 };
        Ok(RaProgress::Pending)
    }

    /// Expire every procedure whose timer passed at `now`.
    ///
    /// RNTIs of abandoned procedures are appended to `failed`.
    pub fn expire(&mut self, now: SlotTime, failed: &mut Vec<Option<Rnti>>) -> usize {
        let mut expired = 0;
        for idx in 0..self.procedures.len() {
            let procedure = &self.procedures[idx];
            let Some(deadline) = procedure.deadline else {
                continue;
            };
            if procedure.is_idle() || !now.has_reached(deadline, self.slots_per_frame) {
                continue;
            }
            let state = procedure.state;
            expired += 1;
            debug!("{}: RA {} timer expired in {}", now, idx, state);
            let progress = match state {
                RaState::WaitMsg3 => self.retry_msg3(idx, now),
                _ => self.fail(idx, now),
            };
            if let RaProgress::Failed { rnti } = progress {
                failed.push(rnti);
            }
        }
        expired
    }

    fn complete(&mut self, idx: usize, now: SlotTime) -> RaProgress {
        let procedure = std::mem::take(&mut self.procedures[idx]);
        let Some(rnti) = procedure.rnti else {
            warn!("{}: RA {} completed without an RNTI", now, idx);
            self.stats.failures += 1;
            return RaProgress::Failed { rnti: None };
        };
        self.stats.successes += 1;
        info!("{}: RA {} completed for {}", now, idx, rnti);
        RaProgress::Completed(RaCompletion {
            rnti,
            msg3_crnti: procedure.msg3_crnti,
            cont_res_id: procedure.cont_res_id,
            beam_index: procedure.beam_index,
            timing_advance: procedure.timing_advance,
            cfra: procedure.cfra,
        })
    }

    fn fail(&mut self, idx: usize, now: SlotTime) -> RaProgress {
        let procedure = std::mem::take(&mut self.procedures[idx]);
        self.stats.failures += 1;
        info!(
            "{}: RA {} failed in {} for {}",
            now,
            idx,
            procedure.state,
            procedure.rnti.map(|r| r.to_string()).unwrap_or_default()
        );
        RaProgress::Failed { rnti: procedure.rnti }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPF: u16 = 20;

    fn config() -> RaConfig {
        RaConfig { pool_size: 4, ..RaConfig::default() }
    }

    fn preamble(index: u8) -> PreambleInfo {
        PreambleInfo { preamble_index: index, timing_advance: 12, preamble_power: -90 }
    }

    fn start(pool: &mut RaPool, now: SlotTime, rnti: u16) -> usize {
        pool.on_preamble(now, PrachOccasion::default(), &preamble(5), 0, false, Rnti(rnti)).unwrap()
    }

    #[test]
    fn test_ra_rnti_formula() {
        let occasion = PrachOccasion { symbol_index: 0, slot_index: 0, freq_index: 0 };
        assert_eq!(ra_rnti(occasion, 0), Ok(1));
        let occasion = PrachOccasion { symbol_index: 2, slot_index: 19, freq_index: 1 };
        assert_eq!(ra_rnti(occasion, 0), Ok(1 + 2 + 14 * 19 + 14 * 80));
        assert_eq!(msgb_rnti(occasion, 0), Ok(1 + 2 + 14 * 19 + 14 * 80 + 17920));
        let last = PrachOccasion { symbol_index: 13, slot_index: 79, freq_index: 7 };
        assert_eq!(msgb_rnti(last, 1), Ok(35840));
    }

    #[test]
    fn test_missing_msg3_exhausts_retries_then_fails() {
        let mut pool = RaPool::new(&config(), SPF);
        let mut now = SlotTime::new(100, 0);
        let idx = start(&mut pool, now, 0x4601);
        assert_eq!(pool.get(idx).unwrap().state(), RaState::Msg2);
        assert_eq!(pool.active_count(), 1);

        let msg3_time = pool.rar_sent(idx, now, Msg3Alloc::default()).unwrap();
        assert_eq!(pool.get(idx).unwrap().state(), RaState::WaitMsg3);

        let mut failed = Vec::new();
        for round in 1..config().msg3_max_rounds {
            let deadline = pool.get(idx).unwrap().deadline().unwrap();
            now = deadline;
            assert_eq!(pool.expire(now, &mut failed), 1);
            let procedure = pool.get(idx).unwrap();
            assert_eq!(procedure.state(), RaState::Msg3Retransmission);
            assert_eq!(procedure.msg3().round, round);

            let retx_time = pool.msg3_time_for(now);
            pool.msg3_retx_scheduled(idx, retx_time, Msg3Alloc::default()).unwrap();
            assert_eq!(pool.get(idx).unwrap().state(), RaState::WaitMsg3);
        }
        assert!(msg3_time.frame >= 100);

        now = pool.get(idx).unwrap().deadline().unwrap();
        assert_eq!(pool.expire(now, &mut failed), 1);
        assert_eq!(pool.get(idx).unwrap().state(), RaState::Idle);
        assert_eq!(failed, vec![Some(Rnti(0x4601))]);
        assert_eq!(pool.stats().failures, 1);
        assert_eq!(pool.stats().attempts, 1);
    }

    #[test]
    fn test_four_step_success() {
        let mut pool = RaPool::new(&config(), SPF);
        let now = SlotTime::new(7, 3);
        let idx = start(&mut pool, now, 0x1234);
        pool.rar_sent(idx, now, Msg3Alloc { rb_start: 0, rb_size: 8, ..Default::default() }).unwrap();

        let id = [1, 2, 3, 4, 5, 6];
        let progress = pool.msg3_received(idx, &Msg3Content::ContentionResolutionId(id), now).unwrap();
        assert_eq!(progress, RaProgress::Pending);
        assert_eq!(pool.get(idx).unwrap().state(), RaState::Msg4);

        pool.msg4_sent(idx, now).unwrap();
        assert_eq!(pool.get(idx).unwrap().state(), RaState::WaitMsg4MsgBAck);
        match pool.msg4_feedback(idx, true, now).unwrap() {
            RaProgress::Completed(done) => {
                assert_eq!(done.rnti, Rnti(0x1234));
                assert_eq!(done.cont_res_id, Some(id));
                assert!(!done.cfra);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pool.get(idx).unwrap().state(), RaState::Idle);
        assert_eq!(pool.stats().successes, 1);
    }

    #[test]
    fn test_events_cannot_skip_states() {
        let mut pool = RaPool::new(&config(), SPF);
        let now = SlotTime::new(0, 0);
        let content = Msg3Content::ContentionResolutionId([0; 6]);

        assert_eq!(
            pool.msg3_received(0, &content, now),
            Err(MacError::UnexpectedRaEvent { state: RaState::Idle, event: "Msg3 received" })
        );
        let idx = start(&mut pool, now, 0x100);
        // Msg2 has not been sent yet
        assert!(pool.msg3_received(idx, &content, now).is_err());
        assert!(pool.msg4_sent(idx, now).is_err());
        assert_eq!(pool.get(idx).unwrap().state(), RaState::Msg2);
        assert!(matches!(pool.rar_sent(9, now, Msg3Alloc::default()), Err(MacError::UnknownRaProcedure(9))));
    }

    #[test]
    fn test_full_pool_rejects_without_disturbing_others() {
        let mut pool = RaPool::new(&config(), SPF);
        let now = SlotTime::new(1, 1);
        for i in 0..4 {
            start(&mut pool, now, 0x10 + i);
        }
        let before: Vec<_> = pool.iter().map(|(_, p)| (p.state(), p.rnti())).collect();
        let result = pool.on_preamble(now, PrachOccasion::default(), &preamble(9), 0, false, Rnti(0x99));
        assert_eq!(result, Err(MacError::PoolExhausted(Pool::RandomAccess)));
        let after: Vec<_> = pool.iter().map(|(_, p)| (p.state(), p.rnti())).collect();
        assert_eq!(before, after);
        assert_eq!(pool.stats().pool_exhausted, 1);
        assert_eq!(pool.stats().attempts, 4);
    }

    #[test]
    fn test_out_of_range_occasion_rejected() {
        let mut pool = RaPool::new(&config(), SPF);
        let now = SlotTime::new(2, 0);
        for occasion in [
            PrachOccasion { symbol_index: 14, ..Default::default() },
            PrachOccasion { slot_index: 80, ..Default::default() },
            PrachOccasion { freq_index: 255, ..Default::default() },
        ] {
            let result = pool.on_preamble(now, occasion, &preamble(3), 0, false, Rnti(0x50));
            assert!(matches!(result, Err(MacError::InvalidPrachOccasion { .. })));
        }
        assert_eq!(pool.stats().invalid_occasions, 3);
        assert_eq!(pool.stats().attempts, 0);
        assert!(pool.iter().all(|(_, p)| p.state() == RaState::Idle));
        assert_eq!(pool.find_by_rnti(Rnti(0x50)), None);
    }

    #[test]
    fn test_completion_without_rnti_counts_only_failure() {
        let mut pool = RaPool::new(&config(), SPF);
        let now = SlotTime::new(7, 3);
        let idx = start(&mut pool, now, 0x1234);
        pool.rar_sent(idx, now, Msg3Alloc { rb_start: 0, rb_size: 8, ..Default::default() }).unwrap();
        pool.msg3_received(idx, &Msg3Content::ContentionResolutionId([9; 6]), now).unwrap();
        pool.msg4_sent(idx, now).unwrap();
        pool.procedures[idx].rnti = None;

        assert_eq!(pool.msg4_feedback(idx, true, now).unwrap(), RaProgress::Failed { rnti: None });
        assert_eq!(pool.stats().successes, 0);
        assert_eq!(pool.stats().failures, 1);
        assert_eq!(pool.get(idx).unwrap().state(), RaState::Idle);
    }

    #[test]
    fn test_rar_window_expiry_fails_procedure() {
        let mut pool = RaPool::new(&config(), SPF);
        let now = SlotTime::new(1023, 15);
        let idx = start(&mut pool, now, 0x77);
        let mut failed = Vec::new();
        // Window wraps over the SFN boundary
        assert_eq!(pool.expire(SlotTime::new(1023, 19), &mut failed), 0);
        assert_eq!(pool.expire(SlotTime::new(0, 15), &mut failed), 1);
        assert_eq!(pool.get(idx).unwrap().state(), RaState::Idle);
        assert_eq!(failed, vec![Some(Rnti(0x77))]);
    }

    #[test]
    fn test_contention_free_completes_on_msg3() {
        let mut pool = RaPool::new(&config(), SPF);
        let now = SlotTime::new(3, 0);
        let prepared = pool.prepare_cfra(Rnti(0x5000), &[60, 61], 2).unwrap();
        assert!(pool.rnti_in_use(Rnti(0x5000)));
        assert_eq!(pool.get(prepared).unwrap().state(), RaState::Idle);

        // A contention-based preamble must not take the prepared slot
        let other = start(&mut pool, now, 0x20);
        assert_ne!(other, prepared);

        let idx = pool
            .on_preamble(now, PrachOccasion::default(), &preamble(61), 0, false, Rnti(0x21))
            .unwrap();
        assert_eq!(idx, prepared);
        assert_eq!(pool.get(idx).unwrap().rnti(), Some(Rnti(0x5000)));
        pool.rar_sent(idx, now, Msg3Alloc::default()).unwrap();
        match pool.msg3_received(idx, &Msg3Content::CRnti(Rnti(0x5000)), now).unwrap() {
            RaProgress::Completed(done) => {
                assert!(done.cfra);
                assert_eq!(done.rnti, Rnti(0x5000));
                assert_eq!(done.beam_index, 2);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!pool.rnti_in_use(Rnti(0x5000)));
    }

    #[test]
    fn test_two_step_and_fallback() {
        let mut pool = RaPool::new(&config(), SPF);
        let now = SlotTime::new(10, 0);
        let content = Msg3Content::ContentionResolutionId([9; 6]);

        let idx = pool.on_preamble(now, PrachOccasion::default(), &preamble(1), 0, true, Rnti(0x30)).unwrap();
        assert_eq!(pool.get(idx).unwrap().state(), RaState::WaitMsgAPusch);
        pool.msga_pusch_received(idx, &content, now).unwrap();
        pool.msgb_sent(idx, now).unwrap();
        // NACK on MsgB sends it again
        assert_eq!(pool.msg4_feedback(idx, false, now), Ok(RaProgress::Pending));
        assert_eq!(pool.get(idx).unwrap().state(), RaState::MsgB);
        pool.msgb_sent(idx, now).unwrap();
        assert!(matches!(pool.msg4_feedback(idx, true, now), Ok(RaProgress::Completed(_))));

        let idx = pool.on_preamble(now, PrachOccasion::default(), &preamble(2), 0, true, Rnti(0x31)).unwrap();
        pool.msga_pusch_failed(idx, now).unwrap();
        let procedure = pool.get(idx).unwrap();
        assert_eq!(procedure.state(), RaState::Msg2);
        assert!(!procedure.is_two_step());
    }

    #[test]
    fn test_msg4_nack_budget() {
        let mut pool = RaPool::new(&RaConfig { msg4_max_rounds: 2, ..config() }, SPF);
        let now = SlotTime::new(0, 0);
        let idx = start(&mut pool, now, 0x40);
        pool.rar_sent(idx, now, Msg3Alloc::default()).unwrap();
        pool.msg3_received(idx, &Msg3Content::ContentionResolutionId([1; 6]), now).unwrap();
        pool.msg4_sent(idx, now).unwrap();
        assert_eq!(pool.msg4_feedback(idx, false, now), Ok(RaProgress::Pending));
        pool.msg4_sent(idx, now).unwrap();
        assert_eq!(pool.msg4_feedback(idx, false, now), Ok(RaProgress::Failed { rnti: Some(Rnti(0x40)) }));
        assert_eq!(pool.stats().failures, 1);
    }
}
