//! Tagged (overlapped) queueing state.
//!
//! A drive that accepts READ/WRITE DMA QUEUED may release the bus and
//! interrupt later for service. Each in-flight command holds a tag slot;
//! the SERVICE handshake reads the tag back from the sector-count register
//! to find out which one the drive wants to finish. Drives that keep
//! botching the protocol are dropped back to one-at-a-time operation.

use keel_xpt::CcbRef;
use tracing::warn;

use crate::regs::MAX_QUEUE_DEPTH;

/// Protocol failures tolerated before tagged queueing is switched off for
/// a drive.
pub const MAX_CQ_FAILURES: u8 = 3;

/// Tag-indexed slots for the commands the drive currently owns.
#[derive(Debug, Default)]
pub struct TagSlots {
    slots: Vec<Option<CcbRef>>,
}

impl TagSlots {
    pub fn new(depth: usize) -> Self {
        TagSlots {
            slots: vec![None; depth.min(MAX_QUEUE_DEPTH)],
        }
    }

    /// Park `ccb` in the lowest free slot and return its tag.
    pub fn alloc(&mut self, ccb: CcbRef) -> Option<u8> {
        let (tag, slot) = self
            .slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.is_none())?;
        *slot = Some(ccb);
        Some(tag as u8)
    }

    pub fn take(&mut self, tag: u8) -> Option<CcbRef> {
        self.slots.get_mut(usize::from(tag))?.take()
    }

    pub fn get(&self, tag: u8) -> Option<&CcbRef> {
        self.slots.get(usize::from(tag))?.as_ref()
    }

    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.outstanding() == 0
    }

    pub fn has_free(&self) -> bool {
        self.slots.iter().any(|s| s.is_none())
    }

    /// Pull every parked command out, e.g. when the whole queue is failed
    /// after a reset.
    pub fn drain(&mut self) -> Vec<CcbRef> {
        self.slots.iter_mut().filter_map(|s| s.take()).collect()
    }
}

/// Per-drive queueing health and negotiation state.
#[derive(Debug)]
pub struct QueueState {
    pub slots: TagSlots,
    failures: u8,
    enabled: bool,
}

impl QueueState {
    /// `depth` is the identify-reported queue depth; a depth below 2 means
    /// the drive cannot overlap anything.
    pub fn new(depth: usize) -> Self {
        let depth = depth.min(MAX_QUEUE_DEPTH);
        QueueState {
            slots: TagSlots::new(depth.max(1)),
            failures: 0,
            enabled: depth > 1,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Returns true when this failure disables tagged queueing for good.
    pub fn record_failure(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        self.failures += 1;
        if self.failures >= MAX_CQ_FAILURES {
            self.enabled = false;
            warn!(
                failures = self.failures,
                "disabling tagged queueing after repeated protocol failures"
            );
            return true;
        }
        false
    }
}

/// Tag announced by the drive during the SERVICE handshake: bits 7..3 of
/// the sector-count register.
pub fn service_tag(sector_count_reg: u8) -> u8 {
    sector_count_reg >> 3
}
