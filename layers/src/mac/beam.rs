//! Beam and PRB Allocation Maps
//!
//! A ring of beam periods covering one radio frame. For every period the
//! allocator records which analog beams are in use, and the resource map
//! keeps one PRB bitmap per (period, beam) pair.

use common::types::SlotTime;
use tracing::{error, trace};

use super::MacError;

/// Largest BWP the maps are sized for
pub const MAX_PRBS: usize = 275;
const WORDS: usize = MAX_PRBS.div_ceil(64);

type PrbBitmap = [u64; WORDS];

/// Contiguous range of PRBs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RbRange {
    pub start: u16,
    pub len: u16,
}

impl RbRange {
    pub fn new(start: u16, len: u16) -> Self {
        Self { start, len }
    }

    /// One past the last PRB
    pub fn end(&self) -> u16 {
        self.start + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn mask(&self) -> PrbBitmap {
        let mut mask = [0u64; WORDS];
        for prb in self.start..self.end() {
            mask[prb as usize / 64] |= 1 << (prb % 64);
        }
        mask
    }
}

/// Position of a beam within its period
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamAlloc {
    /// Index within the beams served in the period
    pub idx: usize,
    /// The beam was not active in the period before this call
    pub new_beam: bool,
}

/// Which beams each period of the frame serves
#[derive(Debug, Clone)]
pub struct BeamAllocator {
    beam_duration: u16,
    beams_per_period: usize,
    periods: usize,
    slots_per_frame: u16,
    /// Active beam id per (period, beam index)
    allocation: Vec<Option<u16>>,
}

impl BeamAllocator {
    /// `beam_duration` must divide `slots_per_frame`
    pub fn new(beam_duration: u16, beams_per_period: usize, slots_per_frame: u16) -> Self {
        let periods = (slots_per_frame / beam_duration.max(1)) as usize;
        Self {
            beam_duration: beam_duration.max(1),
            beams_per_period,
            periods,
            slots_per_frame,
            allocation: vec![None; periods * beams_per_period],
        }
    }

    pub fn periods(&self) -> usize {
        self.periods
    }

    pub fn beams_per_period(&self) -> usize {
        self.beams_per_period
    }

    /// Period a slot falls into
    pub fn period_of(&self, time: SlotTime) -> usize {
        (time.abs_slot(self.slots_per_frame) / self.beam_duration as u32) as usize % self.periods
    }

    /// Find or claim a beam index for `beam_id` in the period of `time`.
    ///
    /// Returns `None` when every beam of the period already serves another beam id.
    pub fn allocate(&mut self, time: SlotTime, beam_id: u16) -> Option<BeamAlloc> {
        let period = self.period_of(time);
        for idx in 0..self.beams_per_period {
            let entry = &mut self.allocation[period * self.beams_per_period + idx];
            match *entry {
                Some(active) if active == beam_id => return Some(BeamAlloc { idx, new_beam: false }),
                None => {
                    *entry = Some(beam_id);
                    trace!("{}: beam {} takes index {} of period {}", time, beam_id, idx, period);
                    return Some(BeamAlloc { idx, new_beam: true });
                }
                Some(_) => {}
            }
        }
        None
    }

    /// Undo an allocation that claimed a new beam but ended up unused
    pub fn release(&mut self, time: SlotTime, beam_id: u16, alloc: BeamAlloc) {
        if !alloc.new_beam {
            return;
        }
        let period = self.period_of(time);
        let entry = &mut self.allocation[period * self.beams_per_period + alloc.idx];
        if *entry == Some(beam_id) {
            *entry = None;
        }
    }

    /// Beam id active at (period, idx)
    pub fn beam_at(&self, period: usize, idx: usize) -> Option<u16> {
        self.allocation.get(period * self.beams_per_period + idx).copied().flatten()
    }

    pub fn clear_period(&mut self, period: usize) {
        let start = period * self.beams_per_period;
        self.allocation[start..start + self.beams_per_period].fill(None);
    }
}

/// Committed PRBs per (period, beam)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceMap {
    periods: usize,
    beams: usize,
    num_prbs: u16,
    committed: Vec<PrbBitmap>,
    /// PRBs the allocator must never hand out
    blocked: PrbBitmap,
}

impl ResourceMap {
    pub fn new(periods: usize, beams: usize, num_prbs: u16) -> Self {
        debug_assert!(num_prbs as usize <= MAX_PRBS);
        Self {
            periods,
            beams,
            num_prbs,
            committed: vec![[0; WORDS]; periods * beams],
            blocked: [0; WORDS],
        }
    }

    /// Resize and clear every period. Only called on reconfiguration.
    pub fn rebuild(&mut self, periods: usize, beams: usize, num_prbs: u16) {
        let blocked = self.blocked;
        *self = Self::new(periods, beams, num_prbs);
        self.blocked = blocked;
        self.clamp_blocked();
    }

    pub fn num_prbs(&self) -> u16 {
        self.num_prbs
    }

    pub fn periods(&self) -> usize {
        self.periods
    }

    fn check_bounds(&self, period: usize, beams: &[usize], range: RbRange) -> Result<(), MacError> {
        if range.end() > self.num_prbs {
            return Err(MacError::OutOfBandwidth { rb_end: range.end(), num_prbs: self.num_prbs });
        }
        if period >= self.periods || beams.iter().any(|&b| b >= self.beams) {
            return Err(MacError::InvalidConfiguration(format!(
                "period {} / beams {:?} outside {}x{} map",
                period, beams, self.periods, self.beams
            )));
        }
        Ok(())
    }

    /// Commit `range` on every beam of `beams` within `period`.
    ///
    /// Fails without changing anything if any PRB is already committed on
    /// one of those beams.
    pub fn reserve(&mut self, period: usize, beams: &[usize], range: RbRange) -> Result<(), MacError> {
        self.check_bounds(period, beams, range)?;
        let mask = range.mask();
        for &beam in beams {
            let bitmap = &self.committed[period * self.beams + beam];
            if bitmap.iter().zip(mask.iter()).any(|(b, m)| b & m != 0) {
                return Err(MacError::ResourceConflict { period, rb_start: range.start, rb_end: range.end() });
            }
        }
        for &beam in beams {
            let bitmap = &mut self.committed[period * self.beams + beam];
            bitmap.iter_mut().zip(mask.iter()).for_each(|(b, m)| *b |= m);
        }
        Ok(())
    }

    /// Reverse a prior [`ResourceMap::reserve`] with identical arguments
    pub fn release(&mut self, period: usize, beams: &[usize], range: RbRange) {
        if let Err(e) = self.check_bounds(period, beams, range) {
            error!("Release outside the resource map: {}", e);
            debug_assert!(false, "release outside the resource map");
            return;
        }
        let mask = range.mask();
        for &beam in beams {
            let bitmap = &mut self.committed[period * self.beams + beam];
            debug_assert!(
                bitmap.iter().zip(mask.iter()).all(|(b, m)| b & m == *m),
                "PRBs {}..{} released twice in period {}",
                range.start,
                range.end(),
                period
            );
            bitmap.iter_mut().zip(mask.iter()).for_each(|(b, m)| *b &= !m);
        }
    }

    /// Whether every PRB of `range` is uncommitted on `beam`
    pub fn is_free(&self, period: usize, beam: usize, range: RbRange) -> bool {
        if self.check_bounds(period, &[beam], range).is_err() {
            return false;
        }
        let mask = range.mask();
        self.committed[period * self.beams + beam]
            .iter()
            .zip(mask.iter())
            .all(|(b, m)| b & m == 0)
    }

    fn prb_available(&self, bitmap: &PrbBitmap, prb: u16, honour_blocked: bool) -> bool {
        let (word, bit) = (prb as usize / 64, prb % 64);
        let used = bitmap[word] & (1 << bit) != 0;
        let blocked = honour_blocked && self.blocked[word] & (1 << bit) != 0;
        !used && !blocked
    }

    /// First free run of at least `wanted` PRBs within `limit`, or else the
    /// longest run of at least `min` PRBs, truncated to `wanted`.
    pub fn find_free(
        &self,
        period: usize,
        beam: usize,
        limit: RbRange,
        wanted: u16,
        min: u16,
        honour_blocked: bool,
    ) -> Option<RbRange> {
        if wanted == 0 || period >= self.periods || beam >= self.beams {
            return None;
        }
        let bitmap = &self.committed[period * self.beams + beam];
        let end = limit.end().min(self.num_prbs);

        let mut best: Option<RbRange> = None;
        let mut prb = limit.start;
        while prb < end {
            if !self.prb_available(bitmap, prb, honour_blocked) {
                prb += 1;
                continue;
            }
            let start = prb;
            while prb < end && prb - start < wanted && self.prb_available(bitmap, prb, honour_blocked) {
                prb += 1;
            }
            let run = RbRange::new(start, prb - start);
            if run.len >= wanted {
                return Some(run);
            }
            if run.len >= min.max(1) && best.map_or(true, |b| run.len > b.len) {
                best = Some(run);
            }
        }
        best
    }

    /// PRBs committed on any beam of `period`
    pub fn used_prbs(&self, period: usize) -> u32 {
        let start = period * self.beams;
        self.committed[start..start + self.beams]
            .iter()
            .map(|bitmap| bitmap.iter().map(|w| w.count_ones()).sum::<u32>())
            .sum()
    }

    pub fn clear_period(&mut self, period: usize) {
        let start = period * self.beams;
        self.committed[start..start + self.beams].fill([0; WORDS]);
    }

    /// Replace the blocked PRB set
    pub fn set_blocked(&mut self, prbs: &[u16]) {
        self.blocked = [0; WORDS];
        for &prb in prbs {
            if (prb as usize) < MAX_PRBS {
                self.blocked[prb as usize / 64] |= 1 << (prb % 64);
            }
        }
        self.clamp_blocked();
    }

    pub fn blocked_count(&self) -> u32 {
        self.blocked.iter().map(|w| w.count_ones()).sum()
    }

    fn clamp_blocked(&mut self) {
        let keep = RbRange::new(0, self.num_prbs).mask();
        self.blocked.iter_mut().zip(keep.iter()).for_each(|(b, k)| *b &= k);
    }
}
