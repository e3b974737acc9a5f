//! The interface between the transport and a bus driver (SIM).

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::ccb::CcbRef;

/// Out-of-band notifications delivered to registered listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncEvent {
    BusRegistered { path_id: u8 },
    BusReset { path_id: u8 },
    DeviceFound { path_id: u8, target: u8, lun: u8 },
    DeviceLost { path_id: u8, target: u8, lun: u8 },
}

/// Everything a SIM reports back to the transport.
///
/// A SIM never calls into the transport directly (the transport may be on
/// the stack when the SIM runs); it queues events here and the transport
/// drains them after each `action`/`pump` call, so completions always run
/// from a clean stack.
#[derive(Debug)]
pub enum SimEvent {
    /// The CCB reached a (possibly internal) completion status; the status
    /// field on the CCB is already set.
    Done(CcbRef),
    /// The CCB is still running on the device (overlapped/tagged), but the
    /// bus itself is free for the next dispatch.
    BusFree,
    BlockBus,
    UnblockBus,
    BlockDevice { target: u8, lun: u8 },
    UnblockDevice { target: u8, lun: u8 },
    Async(AsyncEvent),
}

/// Cloneable handle onto a per-bus SIM event queue.
#[derive(Debug, Clone, Default)]
pub struct SimEventQueue {
    inner: Rc<RefCell<VecDeque<SimEvent>>>,
}

impl SimEventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, ev: SimEvent) {
        self.inner.borrow_mut().push_back(ev);
    }

    pub fn done(&self, ccb: CcbRef) {
        self.push(SimEvent::Done(ccb));
    }

    pub(crate) fn pop(&self) -> Option<SimEvent> {
        self.inner.borrow_mut().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.borrow().is_empty()
    }
}

/// A registered bus driver.
///
/// `action` must eventually produce a [`SimEvent::Done`] for every CCB it
/// accepts; "eventually" means after enough [`SimDriver::pump`] calls, since
/// hardware progress only happens inside the pump.
pub trait SimDriver {
    /// Dispatch one CCB. Never blocks; long operations continue in `pump`.
    fn action(&mut self, ccb: CcbRef);

    /// Advance the deterministic hardware model: fire due timeouts, observe
    /// the interrupt line, drain deferred work.
    fn pump(&mut self);

    /// Whether the bus supports tagged (overlapped) commands at all. The
    /// transport downgrades tag actions when this is false.
    fn tagged_queueing(&self) -> bool;

    /// Number of selectable target ids on this bus.
    fn target_count(&self) -> u8;

    /// Number of logical units probed per target during a scan.
    fn lun_count(&self) -> u8 {
        1
    }
}
