//! HARQ Process Management
//!
//! Per-UE, per-direction pool of HARQ processes (3GPP TS 38.321 §5.3.2 / §5.4.2).
//! Process ids are partitioned into three index lists: available, awaiting
//! feedback and awaiting retransmission. Every id is in exactly one of them.

use bytes::Bytes;
use common::types::{Direction, SlotTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::list::IndexList;
use super::mcs::rv_for_round;
use super::{MacError, Pool};

/// Upper bound on HARQ processes per direction
pub const MAX_HARQ_PROCESSES: usize = 32;

/// Lifecycle state of a HARQ process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqState {
    Free,
    AwaitingFeedback,
    AwaitingRetransmission,
}

/// How a transport block dropped on its first NACK with HARQ disabled is counted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DisabledHarqAccounting {
    /// Count it like a transport block that exhausted all rounds
    #[default]
    BlockError,
    /// Count it in a dedicated drop counter
    Dropped,
}

/// Resources granted to a transport block
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceAllocation {
    /// First PRB within the BWP
    pub rb_start: u16,
    /// Number of PRBs
    pub rb_size: u16,
    pub mcs: u8,
    /// Transport block size in bytes
    pub tb_size: u32,
    pub nr_of_layers: u8,
    pub start_symbol: u8,
    pub nb_symbols: u8,
}

/// One HARQ process
#[derive(Debug, Clone)]
pub struct HarqProcess {
    state: HarqState,
    ndi: bool,
    round: u8,
    grant_time: SlotTime,
    feedback_deadline: SlotTime,
    alloc: ResourceAllocation,
    /// Payload kept for retransmission (downlink only)
    transport_block: Option<Bytes>,
}

impl HarqProcess {
    fn new() -> Self {
        Self {
            state: HarqState::Free,
            ndi: false,
            round: 0,
            grant_time: SlotTime::default(),
            feedback_deadline: SlotTime::default(),
            alloc: ResourceAllocation::default(),
            transport_block: None,
        }
    }

    pub fn state(&self) -> HarqState {
        self.state
    }

    /// New-data indicator, toggled on every new transport block
    pub fn ndi(&self) -> bool {
        self.ndi
    }

    /// Retransmission round of the current transport block
    pub fn round(&self) -> u8 {
        self.round
    }

    /// Slot of the last (re)transmission
    pub fn grant_time(&self) -> SlotTime {
        self.grant_time
    }

    /// Slot by which feedback must have arrived
    pub fn feedback_deadline(&self) -> SlotTime {
        self.feedback_deadline
    }

    pub fn allocation(&self) -> &ResourceAllocation {
        &self.alloc
    }

    pub fn transport_block(&self) -> Option<&Bytes> {
        self.transport_block.as_ref()
    }

    /// Redundancy version of the current round
    pub fn rv(&self) -> u8 {
        rv_for_round(self.round)
    }
}

/// Result of resolving one HARQ transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HarqOutcome {
    /// Positive acknowledgement, process freed
    Acknowledged,
    /// Negative acknowledgement, process waits for retransmission
    Retransmit { round: u8 },
    /// Last round failed, process freed and counted as a block error
    Failed,
    /// HARQ disabled, process freed on the first NACK
    Dropped,
}

/// Counters of one HARQ entity
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HarqStats {
    /// Transmissions per round
    pub rounds: [u64; 8],
    /// Transport blocks lost
    pub errors: u64,
    /// First-NACK drops with HARQ disabled (when counted separately)
    pub harq_disabled_drops: u64,
    /// Feedback deadlines missed
    pub expired: u64,
}

/// Counts produced by one expiry scan
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiryReport {
    pub expired: u32,
    pub retransmit: u32,
    pub failed: u32,
}

/// Retransmission policy of a HARQ entity
#[derive(Debug, Clone, Copy)]
pub struct HarqPolicy {
    /// Rounds after which a transport block is dropped
    pub max_rounds: u8,
    /// Free processes on the first NACK instead of retransmitting
    pub disabled: bool,
    pub disabled_accounting: DisabledHarqAccounting,
    /// Offset from the granted slot to the feedback deadline
    pub rtt_slots: u16,
    pub slots_per_frame: u16,
}

/// HARQ processes of one UE in one direction
#[derive(Debug, Clone)]
pub struct HarqEntity {
    direction: Direction,
    processes: Vec<HarqProcess>,
    available: IndexList,
    feedback: IndexList,
    retrans: IndexList,
    policy: HarqPolicy,
    stats: HarqStats,
}

impl HarqEntity {
    /// Create an entity with `num_processes` free processes
    pub fn new(direction: Direction, num_processes: usize, policy: HarqPolicy) -> Self {
        debug_assert!(num_processes > 0 && num_processes <= MAX_HARQ_PROCESSES);
        Self {
            direction,
            processes: (0..num_processes).map(|_| HarqProcess::new()).collect(),
            available: IndexList::new_full(num_processes),
            feedback: IndexList::new(num_processes),
            retrans: IndexList::new(num_processes),
            policy,
            stats: HarqStats::default(),
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn num_processes(&self) -> usize {
        self.processes.len()
    }

    pub fn policy(&self) -> &HarqPolicy {
        &self.policy
    }

    /// Replace the retransmission policy. Processes in flight keep their deadlines.
    pub fn set_policy(&mut self, policy: HarqPolicy) {
        self.policy = policy;
    }

    pub fn stats(&self) -> &HarqStats {
        &self.stats
    }

    pub fn process(&self, pid: u8) -> Option<&HarqProcess> {
        self.processes.get(pid as usize)
    }

    pub fn state(&self, pid: u8) -> Option<HarqState> {
        self.process(pid).map(HarqProcess::state)
    }

    /// Oldest free process
    pub fn next_free(&self) -> Option<u8> {
        self.available.head().map(|pid| pid as u8)
    }

    /// Oldest free process, or `PoolExhausted` when every process is busy
    pub fn free_process(&self) -> Result<u8, MacError> {
        self.next_free().ok_or(MacError::PoolExhausted(match self.direction {
            Direction::Downlink => Pool::DlHarq,
            Direction::Uplink => Pool::UlHarq,
        }))
    }

    /// Oldest process waiting for retransmission
    pub fn next_retransmission(&self) -> Option<u8> {
        self.retrans.head().map(|pid| pid as u8)
    }

    pub fn num_free(&self) -> usize {
        self.available.len()
    }

    pub fn num_awaiting_feedback(&self) -> usize {
        self.feedback.len()
    }

    pub fn num_awaiting_retransmission(&self) -> usize {
        self.retrans.len()
    }

    fn process_mut(&mut self, pid: u8, action: &'static str) -> Result<&mut HarqProcess, MacError> {
        let num = self.processes.len();
        if pid as usize >= num {
            warn!("{:?} HARQ: cannot {} on pid {}", self.direction, action, pid);
            return Err(MacError::InvalidHarqPid { pid, num });
        }
        Ok(&mut self.processes[pid as usize])
    }

    fn expect_state(&self, pid: u8, expected: HarqState, action: &'static str) -> Result<(), MacError> {
        let process = self.processes.get(pid as usize).ok_or(MacError::InvalidHarqPid {
            pid,
            num: self.processes.len(),
        })?;
        if process.state != expected {
            return Err(MacError::InvalidHarqState { pid, state: process.state, action });
        }
        Ok(())
    }

    fn deadline_for(&self, grant: SlotTime) -> SlotTime {
        grant.add_slots(self.policy.rtt_slots as u32, self.policy.slots_per_frame)
    }

    /// Start a new transport block on a free process.
    ///
    /// `grant` is the slot the transmission occupies; the feedback deadline is
    /// derived from it.
    pub fn start_new_transmission(
        &mut self,
        pid: u8,
        alloc: ResourceAllocation,
        grant: SlotTime,
        transport_block: Option<Bytes>,
    ) -> Result<(), MacError> {
        self.expect_state(pid, HarqState::Free, "start a new transmission")?;
        self.available.remove(pid as usize);

        let deadline = self.deadline_for(grant);
        let process = self.process_mut(pid, "start a new transmission")?;
        process.state = HarqState::AwaitingFeedback;
        process.ndi = !process.ndi;
        process.round = 0;
        process.alloc = alloc;
        process.grant_time = grant;
        process.feedback_deadline = deadline;
        process.transport_block = transport_block;

        self.feedback.push_tail(pid as usize);
        self.stats.rounds[0] += 1;
        trace!("{:?} HARQ pid {}: new TB {} bytes at {}, feedback by {}", self.direction, pid, alloc.tb_size, grant, deadline);
        Ok(())
    }

    /// Re-grant the stored transport block of a process awaiting retransmission.
    ///
    /// `alloc` may carry adapted resources; the transport block size is kept.
    /// Returns the redundancy version to use.
    pub fn start_retransmission(
        &mut self,
        pid: u8,
        alloc: Option<ResourceAllocation>,
        grant: SlotTime,
    ) -> Result<u8, MacError> {
        self.expect_state(pid, HarqState::AwaitingRetransmission, "retransmit")?;
        self.retrans.remove(pid as usize);

        let deadline = self.deadline_for(grant);
        let process = self.process_mut(pid, "retransmit")?;
        if let Some(alloc) = alloc {
            process.alloc = ResourceAllocation { tb_size: process.alloc.tb_size, ..alloc };
        }
        process.state = HarqState::AwaitingFeedback;
        process.grant_time = grant;
        process.feedback_deadline = deadline;
        let round = process.round;
        let rv = process.rv();

        self.feedback.push_tail(pid as usize);
        self.stats.rounds[(round as usize).min(7)] += 1;
        trace!("{:?} HARQ pid {}: retransmission round {} rv {} at {}", self.direction, pid, round, rv, grant);
        Ok(rv)
    }

    /// Attach the payload of a granted transport block
    pub fn store_transport_block(&mut self, pid: u8, payload: Bytes) -> Result<(), MacError> {
        self.expect_state(pid, HarqState::AwaitingFeedback, "store a transport block")?;
        let process = self.process_mut(pid, "store a transport block")?;
        process.transport_block = Some(payload);
        Ok(())
    }

    /// Apply an ACK/NACK for a process awaiting feedback
    pub fn handle_feedback(&mut self, pid: u8, ack: bool) -> Result<HarqOutcome, MacError> {
        self.expect_state(pid, HarqState::AwaitingFeedback, "take feedback")?;
        self.feedback.remove(pid as usize);
        Ok(self.resolve(pid as usize, ack))
    }

    /// Treat every process whose feedback deadline passed as NACKed.
    ///
    /// The whole feedback list is scanned, oldest first: deadlines are not
    /// ordered along it once the policy's RTT changes mid-flight.
    pub fn expire(&mut self, now: SlotTime) -> ExpiryReport {
        let mut report = ExpiryReport::default();
        let spf = self.policy.slots_per_frame;
        loop {
            let processes = &self.processes;
            let expired = self.feedback.iter().find(|&pid| now.has_reached(processes[pid].feedback_deadline, spf));
            let Some(pid) = expired else { break };
            self.feedback.remove(pid);
            debug!("{:?} HARQ pid {}: no feedback by {}, treating as NACK", self.direction, pid, self.processes[pid].feedback_deadline);
            self.stats.expired += 1;
            report.expired += 1;
            match self.resolve(pid, false) {
                HarqOutcome::Retransmit { .. } => report.retransmit += 1,
                HarqOutcome::Failed | HarqOutcome::Dropped => report.failed += 1,
                HarqOutcome::Acknowledged => {}
            }
        }
        report
    }

    /// Move a process that already left the feedback list to its next state
    fn resolve(&mut self, idx: usize, ack: bool) -> HarqOutcome {
        let policy = self.policy;
        let process = &mut self.processes[idx];

        if ack {
            process.state = HarqState::Free;
            process.transport_block = None;
            self.available.push_tail(idx);
            return HarqOutcome::Acknowledged;
        }

        if policy.disabled {
            process.state = HarqState::Free;
            process.transport_block = None;
            self.available.push_tail(idx);
            match policy.disabled_accounting {
                DisabledHarqAccounting::BlockError => self.stats.errors += 1,
                DisabledHarqAccounting::Dropped => self.stats.harq_disabled_drops += 1,
            }
            return HarqOutcome::Dropped;
        }

        process.round += 1;
        if process.round >= policy.max_rounds {
            debug!("{:?} HARQ pid {}: dropped after {} rounds", self.direction, idx, process.round);
            process.state = HarqState::Free;
            process.transport_block = None;
            self.available.push_tail(idx);
            self.stats.errors += 1;
            HarqOutcome::Failed
        } else {
            process.state = HarqState::AwaitingRetransmission;
            let round = process.round;
            self.retrans.push_tail(idx);
            HarqOutcome::Retransmit { round }
        }
    }

    /// Return every process to the free pool (UE release or reconfiguration)
    pub fn flush(&mut self) {
        self.available.clear();
        self.feedback.clear();
        self.retrans.clear();
        for (idx, process) in self.processes.iter_mut().enumerate() {
            process.state = HarqState::Free;
            process.round = 0;
            process.transport_block = None;
            self.available.push_tail(idx);
        }
    }

    /// Check that every process id sits in exactly the list matching its state
    pub fn is_consistent(&self) -> bool {
        let total = self.available.len() + self.feedback.len() + self.retrans.len();
        if total != self.processes.len() {
            return false;
        }
        self.processes.iter().enumerate().all(|(idx, process)| {
            let memberships = [
                (&self.available, HarqState::Free),
                (&self.feedback, HarqState::AwaitingFeedback),
                (&self.retrans, HarqState::AwaitingRetransmission),
            ];
            memberships
                .iter()
                .filter(|(list, _)| list.contains(idx))
                .map(|(_, state)| *state)
                .eq(std::iter::once(process.state))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_rounds: u8, disabled: bool) -> HarqPolicy {
        HarqPolicy {
            max_rounds,
            disabled,
            disabled_accounting: DisabledHarqAccounting::BlockError,
            rtt_slots: 8,
            slots_per_frame: 10,
        }
    }

    fn alloc() -> ResourceAllocation {
        ResourceAllocation { rb_start: 0, rb_size: 10, mcs: 9, tb_size: 100, nr_of_layers: 1, start_symbol: 2, nb_symbols: 12 }
    }

    #[test]
    fn test_nack_until_max_rounds() {
        let mut harq = HarqEntity::new(Direction::Downlink, 8, policy(4, false));
        let t0 = SlotTime::new(0, 0);

        harq.start_new_transmission(3, alloc(), t0, Some(Bytes::from_static(b"tb"))).unwrap();
        assert_eq!(harq.state(3), Some(HarqState::AwaitingFeedback));
        assert!(harq.is_consistent());

        assert_eq!(harq.handle_feedback(3, false), Ok(HarqOutcome::Retransmit { round: 1 }));
        assert_eq!(harq.state(3), Some(HarqState::AwaitingRetransmission));
        assert_eq!(harq.process(3).unwrap().round(), 1);

        for expected_round in 2..4 {
            harq.start_retransmission(3, None, t0).unwrap();
            assert_eq!(harq.handle_feedback(3, false), Ok(HarqOutcome::Retransmit { round: expected_round }));
        }
        harq.start_retransmission(3, None, t0).unwrap();
        assert_eq!(harq.handle_feedback(3, false), Ok(HarqOutcome::Failed));

        assert_eq!(harq.state(3), Some(HarqState::Free));
        assert_eq!(harq.stats().errors, 1);
        assert_eq!(harq.stats().rounds[..4], [1, 1, 1, 1]);
        assert!(harq.is_consistent());
    }

    #[test]
    fn test_ack_frees_process_and_keeps_payload_until_then() {
        let mut harq = HarqEntity::new(Direction::Downlink, 4, policy(4, false));
        let payload = Bytes::from_static(b"payload");
        harq.start_new_transmission(0, alloc(), SlotTime::new(1, 0), Some(payload.clone())).unwrap();
        harq.handle_feedback(0, false).unwrap();
        assert_eq!(harq.process(0).unwrap().transport_block(), Some(&payload));

        let rv = harq.start_retransmission(0, None, SlotTime::new(1, 5)).unwrap();
        assert_eq!(rv, 2);
        assert_eq!(harq.handle_feedback(0, true), Ok(HarqOutcome::Acknowledged));
        assert_eq!(harq.state(0), Some(HarqState::Free));
        assert!(harq.process(0).unwrap().transport_block().is_none());
        assert_eq!(harq.stats().errors, 0);
    }

    #[test]
    fn test_ndi_toggles_per_new_transport_block() {
        let mut harq = HarqEntity::new(Direction::Uplink, 2, policy(4, false));
        let first = harq.process(1).unwrap().ndi();
        harq.start_new_transmission(1, alloc(), SlotTime::new(0, 0), None).unwrap();
        assert_ne!(harq.process(1).unwrap().ndi(), first);
        harq.handle_feedback(1, true).unwrap();
        harq.start_new_transmission(1, alloc(), SlotTime::new(0, 1), None).unwrap();
        assert_eq!(harq.process(1).unwrap().ndi(), first);
    }

    #[test]
    fn test_wrong_state_is_rejected() {
        let mut harq = HarqEntity::new(Direction::Downlink, 4, policy(4, false));
        assert!(matches!(
            harq.handle_feedback(2, true),
            Err(MacError::InvalidHarqState { pid: 2, state: HarqState::Free, .. })
        ));
        assert!(harq.start_retransmission(2, None, SlotTime::new(0, 0)).is_err());
        harq.start_new_transmission(2, alloc(), SlotTime::new(0, 0), None).unwrap();
        assert!(harq.start_new_transmission(2, alloc(), SlotTime::new(0, 0), None).is_err());
        assert!(matches!(harq.handle_feedback(9, true), Err(MacError::InvalidHarqPid { pid: 9, num: 4 })));
        assert!(harq.is_consistent());
    }

    #[test]
    fn test_expiry_happens_once_per_missed_deadline() {
        let mut harq = HarqEntity::new(Direction::Downlink, 4, policy(4, false));
        harq.start_new_transmission(0, alloc(), SlotTime::new(10, 0), None).unwrap();
        harq.start_new_transmission(1, alloc(), SlotTime::new(10, 5), None).unwrap();

        // Deadline of pid 0 is 10.8, pid 1 is 11.3
        assert_eq!(harq.expire(SlotTime::new(10, 7)).expired, 0);
        let report = harq.expire(SlotTime::new(10, 8));
        assert_eq!(report, ExpiryReport { expired: 1, retransmit: 1, failed: 0 });
        assert_eq!(harq.state(0), Some(HarqState::AwaitingRetransmission));

        // Scanning again in a later slot must not count pid 0 a second time
        let report = harq.expire(SlotTime::new(11, 0));
        assert_eq!(report.expired, 0);
        assert_eq!(harq.process(0).unwrap().round(), 1);
        assert_eq!(harq.stats().expired, 1);

        assert_eq!(harq.expire(SlotTime::new(11, 3)).expired, 1);
        assert!(harq.is_consistent());
    }

    #[test]
    fn test_expiry_after_rtt_change_finds_later_entries() {
        let mut harq = HarqEntity::new(Direction::Downlink, 4, policy(4, false));
        harq.start_new_transmission(0, alloc(), SlotTime::new(5, 0), None).unwrap();
        harq.set_policy(HarqPolicy { rtt_slots: 2, ..policy(4, false) });
        harq.start_new_transmission(1, alloc(), SlotTime::new(5, 1), None).unwrap();

        // pid 1 (deadline 5.3) sits behind pid 0 (deadline 5.8)
        let report = harq.expire(SlotTime::new(5, 3));
        assert_eq!(report.expired, 1);
        assert_eq!(harq.state(0), Some(HarqState::AwaitingFeedback));
        assert_eq!(harq.state(1), Some(HarqState::AwaitingRetransmission));

        assert_eq!(harq.expire(SlotTime::new(5, 8)).expired, 1);
        assert_eq!(harq.state(0), Some(HarqState::AwaitingRetransmission));
        assert_eq!(harq.stats().expired, 2);
        assert!(harq.is_consistent());
    }

    #[test]
    fn test_expiry_across_sfn_wrap() {
        let mut harq = HarqEntity::new(Direction::Uplink, 2, policy(4, false));
        harq.start_new_transmission(0, alloc(), SlotTime::new(1023, 6), None).unwrap();
        // Deadline wraps to 0.4
        assert_eq!(harq.expire(SlotTime::new(1023, 9)).expired, 0);
        assert_eq!(harq.expire(SlotTime::new(0, 4)).expired, 1);
    }

    #[test]
    fn test_disabled_harq_accounting() {
        let mut harq = HarqEntity::new(Direction::Downlink, 2, policy(4, true));
        harq.start_new_transmission(0, alloc(), SlotTime::new(0, 0), None).unwrap();
        assert_eq!(harq.handle_feedback(0, false), Ok(HarqOutcome::Dropped));
        assert_eq!(harq.state(0), Some(HarqState::Free));
        assert_eq!(harq.stats().errors, 1);
        assert_eq!(harq.stats().harq_disabled_drops, 0);

        let mut separate = policy(4, true);
        separate.disabled_accounting = DisabledHarqAccounting::Dropped;
        let mut harq = HarqEntity::new(Direction::Downlink, 2, separate);
        harq.start_new_transmission(1, alloc(), SlotTime::new(0, 0), None).unwrap();
        assert_eq!(harq.handle_feedback(1, false), Ok(HarqOutcome::Dropped));
        assert_eq!(harq.stats().errors, 0);
        assert_eq!(harq.stats().harq_disabled_drops, 1);
    }

    #[test]
    fn test_exhausted_pool_is_reported() {
        let mut harq = HarqEntity::new(Direction::Uplink, 2, policy(4, false));
        for pid in 0..2 {
            assert_eq!(harq.free_process(), Ok(pid));
            harq.start_new_transmission(pid, alloc(), SlotTime::new(0, 0), None).unwrap();
        }
        assert_eq!(harq.free_process(), Err(MacError::PoolExhausted(Pool::UlHarq)));
    }

    #[test]
    fn test_flush_returns_everything() {
        let mut harq = HarqEntity::new(Direction::Downlink, 4, policy(4, false));
        harq.start_new_transmission(0, alloc(), SlotTime::new(0, 0), None).unwrap();
        harq.start_new_transmission(1, alloc(), SlotTime::new(0, 0), None).unwrap();
        harq.handle_feedback(1, false).unwrap();
        harq.flush();
        assert_eq!(harq.num_free(), 4);
        assert_eq!(harq.num_awaiting_feedback(), 0);
        assert_eq!(harq.num_awaiting_retransmission(), 0);
        assert!(harq.is_consistent());
    }

    #[test]
    fn test_partition_holds_over_mixed_sequence() {
        let mut harq = HarqEntity::new(Direction::Downlink, 8, policy(2, false));
        let mut now = SlotTime::new(0, 0);
        for step in 0..200u32 {
            now = now.add_slots(1, 10);
            if let Some(pid) = harq.next_retransmission() {
                harq.start_retransmission(pid, None, now).unwrap();
            } else if let Some(pid) = harq.next_free() {
                harq.start_new_transmission(pid, alloc(), now, None).unwrap();
            }
            if step % 3 == 0 {
                if let Some(pid) = (0..8u8).find(|&p| harq.state(p) == Some(HarqState::AwaitingFeedback)) {
                    harq.handle_feedback(pid, step % 2 == 0).unwrap();
                }
            }
            harq.expire(now);
            assert!(harq.is_consistent());
        }
    }
}
