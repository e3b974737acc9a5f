//! Command intake, per-device ordering, backpressure, and the dispatcher.

use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::ccb::{CcbFunction, CcbRef, CcbStatus, TagAction};
use crate::error::XptError;
use crate::registry::{Bus, Device, PathId, Xpt};
use crate::sim::SimEvent;

/// Expected CDB length for a SCSI group code, `None` for vendor/reserved
/// groups (accepted as submitted).
fn cdb_len_for_opcode(opcode: u8) -> Option<usize> {
    match opcode >> 5 {
        0 => Some(6),
        1 | 2 => Some(10),
        4 => Some(16),
        5 => Some(12),
        _ => None,
    }
}

/// Cyclic "comes after" comparison of two sort keys relative to a base.
///
/// Keys are free-running and wrap (resolved Open Question: wraparound is
/// explicit, not saturating); distance from the base decides order, so keys
/// handed out just after the base sort first even across the numeric limit.
fn cyclic_distance(base: u64, key: u64) -> u64 {
    key.wrapping_sub(base)
}

impl Device {
    /// Insert a simple (unordered) CCB: sorted by cyclic distance from the
    /// last-dispatched key, never passing an ordered barrier.
    fn insert_simple(&mut self, ccb: CcbRef) {
        let key = cyclic_distance(self.last_used_key, ccb.borrow().sort_key);
        let mut pos = self.queued.len();
        for i in (0..self.queued.len()).rev() {
            let q = self.queued[i].borrow();
            if q.tag_action == TagAction::Ordered {
                break;
            }
            if key >= cyclic_distance(self.last_used_key, q.sort_key) {
                break;
            }
            pos = i;
        }
        self.queued.insert(pos, ccb);
        self.lock_count += 1;
    }

    fn insert_ordered(&mut self, ccb: CcbRef) {
        self.queued.push_back(ccb);
        self.lock_count += 1;
    }

    fn requeue_head(&mut self, ccb: CcbRef) {
        {
            let mut c = ccb.borrow_mut();
            c.status = CcbStatus::InProgress;
            c.completed = false;
        }
        self.queued.push_front(ccb);
        self.lock_count += 1;
    }

    fn pop_head(&mut self) -> Option<CcbRef> {
        let ccb = self.queued.pop_front()?;
        self.lock_count -= 1;
        Some(ccb)
    }
}

impl Bus {
    fn ensure_waiting(&mut self, target: u8, lun: u8) {
        if !self.waiting.contains(&(target, lun)) {
            self.waiting.push_back((target, lun));
        }
    }

    fn clear_active_if(&mut self, ccb: &CcbRef) {
        if let Some(active) = &self.active {
            if Rc::ptr_eq(active, ccb) {
                self.active = None;
            }
        }
    }
}

impl Xpt {
    /// Submit a command. Validation failures complete the CCB immediately
    /// with `InvalidCdb`; flow-control decides whether the CCB is queued or
    /// dispatched right away.
    pub fn submit(&mut self, path: PathId, ccb: CcbRef) -> Result<(), XptError> {
        let function = ccb.borrow().function;
        match function {
            CcbFunction::ResetBus => {
                // Bus-wide operation: bypasses device queues; the SIM runs
                // it as a synced call and fails in-flight work itself.
                let bus = self.bus_mut(path)?;
                bus.sim.action(ccb);
                self.pump(path)
            }
            CcbFunction::AbortCommand => {
                self.abort_queued(path, ccb);
                Ok(())
            }
            CcbFunction::ScsiIo => self.submit_io(path, ccb),
        }
    }

    fn submit_io(&mut self, path: PathId, ccb: CcbRef) -> Result<(), XptError> {
        let (target, lun) = {
            let c = ccb.borrow();
            (c.target, c.lun)
        };

        if !self.validate_cdb(&ccb) {
            self.finish_ccb(path, ccb);
            return Ok(());
        }

        self.ensure_device(path, target, lun)?;
        let bus_tagged = {
            let bus = self.bus(path)?;
            bus.sim.tagged_queueing()
        };

        let bus = self.bus_mut(path)?;
        let dev = bus
            .device_mut(target, lun)
            .ok_or(XptError::NoSuchDevice { target, lun })?;

        // Disable hardware tagging when either side lacks it; the ordering
        // class of the CCB is unaffected.
        {
            let mut c = ccb.borrow_mut();
            c.hw_tagged =
                bus_tagged && dev.tagged_queueing && c.tag_action == TagAction::Simple;
            c.sort_key = dev.next_sort_key;
            dev.next_sort_key = dev.next_sort_key.wrapping_add(1);
        }

        let ordered = ccb.borrow().tag_action == TagAction::Ordered;
        let backlog = !dev.queued.is_empty();
        let dev_ready = dev.blocked == 0 && !dev.overflowed;
        let can_dispatch = bus.dispatch_allowed() && dev_ready && !backlog;

        if can_dispatch {
            // Dispatch immediately; the CCB acts as ordered for the span of
            // its execution so later simple submissions cannot pass it.
            let dev = bus.device_mut(target, lun).expect("device exists");
            dev.last_used_key = ccb.borrow().sort_key;
            ccb.borrow_mut().ordered_lock = true;
            bus.active = Some(ccb.clone());
            trace!(path = path.0, target, lun, "dispatching immediately");
            bus.sim.action(ccb);
            self.pump(path)
        } else {
            let dev = bus.device_mut(target, lun).expect("device exists");
            if ordered {
                dev.insert_ordered(ccb);
            } else {
                dev.insert_simple(ccb);
            }
            bus.ensure_waiting(target, lun);
            trace!(path = path.0, target, lun, "queued");
            self.pump(path)
        }
    }

    fn validate_cdb(&mut self, ccb: &CcbRef) -> bool {
        let mut c = ccb.borrow_mut();
        let opcode = c.cdb[0];
        if let Some(expected) = cdb_len_for_opcode(opcode) {
            if c.cdb_len != expected {
                warn!(opcode, len = c.cdb_len, "CDB length does not match group code");
                c.status = CcbStatus::InvalidCdb;
                return false;
            }
        }
        // Implicit LUN bits in byte 1 of 6-byte CDBs.
        if c.cdb_len == 6 {
            if c.lun > 7 {
                c.status = CcbStatus::InvalidCdb;
                return false;
            }
            c.cdb[1] = (c.cdb[1] & 0x1F) | (c.lun << 5);
        }
        true
    }

    fn abort_queued(&mut self, path: PathId, abort_ccb: CcbRef) {
        let target_ccb = abort_ccb.borrow_mut().abort_target.take();
        let mut aborted = None;
        if let (Some(victim), Ok(bus)) = (target_ccb, self.bus_mut(path)) {
            let (t, l) = {
                let v = victim.borrow();
                (v.target, v.lun)
            };
            if let Some(dev) = bus.device_mut(t, l) {
                if let Some(idx) = dev.queued.iter().position(|q| Rc::ptr_eq(q, &victim)) {
                    dev.queued.remove(idx);
                    dev.lock_count -= 1;
                    aborted = Some(victim);
                }
            }
        }
        let status = if let Some(victim) = aborted {
            victim.borrow_mut().status = CcbStatus::Aborted;
            self.finish_ccb(path, victim);
            CcbStatus::Ok
        } else {
            // Already dispatched (or unknown): cancellation is advisory only.
            CcbStatus::SequenceFailure
        };
        abort_ccb.borrow_mut().status = status;
        self.finish_ccb(path, abort_ccb);
    }

    /// Raise the bus-wide backpressure counter.
    pub fn block_bus(&mut self, path: PathId) -> Result<(), XptError> {
        self.bus_mut(path)?.blocked += 1;
        Ok(())
    }

    /// Lower the bus-wide backpressure counter (or clear a bus overflow);
    /// idempotent when neither is set.
    pub fn unblock_bus(&mut self, path: PathId) -> Result<(), XptError> {
        {
            let bus = self.bus_mut(path)?;
            if bus.blocked > 0 {
                bus.blocked -= 1;
            } else if bus.overflowed {
                bus.overflowed = false;
            } else {
                return Ok(());
            }
        }
        self.pump(path)
    }

    pub fn block_device(&mut self, path: PathId, target: u8, lun: u8) -> Result<(), XptError> {
        let bus = self.bus_mut(path)?;
        let dev = bus
            .device_mut(target, lun)
            .ok_or(XptError::NoSuchDevice { target, lun })?;
        dev.blocked += 1;
        dev.lock_count += 1;
        Ok(())
    }

    /// Idempotent: unblocking an unblocked device (no overflow either) is a
    /// no-op; counters never go negative.
    pub fn unblock_device(&mut self, path: PathId, target: u8, lun: u8) -> Result<(), XptError> {
        {
            let bus = self.bus_mut(path)?;
            let dev = bus
                .device_mut(target, lun)
                .ok_or(XptError::NoSuchDevice { target, lun })?;
            if dev.blocked > 0 {
                dev.blocked -= 1;
                dev.lock_count -= 1;
            } else if dev.overflowed {
                dev.overflowed = false;
                dev.lock_count -= 1;
            } else {
                return Ok(());
            }
        }
        self.pump(path)
    }

    /// Advance the bus: pump the SIM's hardware model, absorb its events,
    /// and dispatch until nothing moves.
    pub fn pump(&mut self, path: PathId) -> Result<(), XptError> {
        loop {
            self.bus_mut(path)?.sim.pump();
            let absorbed = self.drain_sim_events(path)?;
            let dispatched = self.run_service(path)?;
            if !absorbed && !dispatched {
                return Ok(());
            }
        }
    }

    /// The dispatcher: start the head command of the first serviceable
    /// waiting device.
    fn run_service(&mut self, path: PathId) -> Result<bool, XptError> {
        let bus = self.bus_mut(path)?;
        if !bus.dispatch_allowed() {
            return Ok(false);
        }
        let Some(pos) = bus.waiting.iter().position(|&(t, l)| {
            bus.device(t, l).is_some_and(|d| d.serviceable())
        }) else {
            return Ok(false);
        };
        let (target, lun) = bus.waiting.remove(pos).expect("position valid");
        let dev = bus
            .device_mut(target, lun)
            .ok_or(XptError::NoSuchDevice { target, lun })?;
        let Some(ccb) = dev.pop_head() else {
            return Ok(false);
        };
        dev.last_used_key = ccb.borrow().sort_key;
        let more = !dev.queued.is_empty();
        if more {
            // Round-robin: devices with remaining work go to the tail.
            bus.waiting.push_back((target, lun));
        }
        ccb.borrow_mut().ordered_lock = true;
        bus.active = Some(ccb.clone());
        trace!(path = path.0, target, lun, "service dispatch");
        bus.sim.action(ccb);
        Ok(true)
    }

    /// Absorb everything the SIM reported since the last drain. Returns
    /// whether anything was processed.
    fn drain_sim_events(&mut self, path: PathId) -> Result<bool, XptError> {
        let queue = self.bus(path)?.sim_events.clone();
        let mut any = false;
        while let Some(ev) = queue.pop() {
            any = true;
            match ev {
                SimEvent::Done(ccb) => self.complete(path, ccb)?,
                SimEvent::BusFree => {
                    // Overlapped command released the bus early; the CCB
                    // stays in flight at the device.
                    self.bus_mut(path)?.active = None;
                }
                SimEvent::BlockBus => self.block_bus(path)?,
                SimEvent::UnblockBus => {
                    let bus = self.bus_mut(path)?;
                    if bus.blocked > 0 {
                        bus.blocked -= 1;
                    } else if bus.overflowed {
                        bus.overflowed = false;
                    }
                }
                SimEvent::BlockDevice { target, lun } => {
                    self.block_device(path, target, lun)?
                }
                SimEvent::UnblockDevice { target, lun } => {
                    let bus = self.bus_mut(path)?;
                    if let Some(dev) = bus.device_mut(target, lun) {
                        if dev.blocked > 0 {
                            dev.blocked -= 1;
                            dev.lock_count -= 1;
                        } else if dev.overflowed {
                            dev.overflowed = false;
                            dev.lock_count -= 1;
                        }
                    }
                }
                SimEvent::Async(ev) => self.emit(ev),
            }
        }
        Ok(any)
    }

    /// The completion dispatcher: retry, re-queue, or finish.
    fn complete(&mut self, path: PathId, ccb: CcbRef) -> Result<(), XptError> {
        let (status, target, lun) = {
            let c = ccb.borrow();
            (c.status, c.target, c.lun)
        };
        let bus = self.bus_mut(path)?;
        bus.clear_active_if(&ccb);
        match status {
            CcbStatus::DeviceQueueFull => {
                debug!(path = path.0, target, lun, "device queue full, re-queueing");
                if let Some(dev) = bus.device_mut(target, lun) {
                    dev.requeue_head(ccb);
                    if !dev.overflowed {
                        dev.overflowed = true;
                        dev.lock_count += 1;
                    }
                }
                bus.ensure_waiting(target, lun);
            }
            CcbStatus::BusQueueFull => {
                debug!(path = path.0, "bus queue full, re-queueing");
                if let Some(dev) = bus.device_mut(target, lun) {
                    dev.requeue_head(ccb);
                }
                bus.ensure_waiting(target, lun);
                bus.overflowed = true;
            }
            CcbStatus::Resubmit => {
                trace!(path = path.0, target, lun, "resubmit requested");
                bus.overflowed = false;
                if let Some(dev) = bus.device_mut(target, lun) {
                    if dev.overflowed {
                        dev.overflowed = false;
                        dev.lock_count -= 1;
                    }
                    dev.requeue_head(ccb);
                }
                bus.ensure_waiting(target, lun);
            }
            _ => {
                self.finish_ccb(path, ccb);
            }
        }
        Ok(())
    }

    /// Final completion: release ordering state and hand the CCB back to
    /// the submitter.
    pub(crate) fn finish_ccb(&mut self, _path: PathId, ccb: CcbRef) {
        {
            let mut c = ccb.borrow_mut();
            debug_assert!(c.status.is_final(), "finishing non-final status {:?}", c.status);
            c.ordered_lock = false;
            c.completed = true;
        }
        self.completed.push_back(ccb);
    }
}
