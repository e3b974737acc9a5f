//! Command control blocks and the per-bus CCB pool.

use std::cell::RefCell;
use std::rc::Rc;

use crate::sense::SenseData;

/// Shared handle to one outstanding command.
///
/// The submitter keeps a clone to observe completion; the transport and the
/// bus driver pass further clones among their queues. All access is scoped
/// `borrow()`/`borrow_mut()` on the single-threaded pump.
pub type CcbRef = Rc<RefCell<Ccb>>;

/// What the transport is being asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcbFunction {
    /// Execute the SCSI CDB in [`Ccb::cdb`].
    ScsiIo,
    /// Reset the bus; fails all in-flight commands with [`CcbStatus::BusReset`].
    ResetBus,
    /// Best-effort abort of a still-queued CCB (identified by [`Ccb::abort_target`]).
    AbortCommand,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataDirection {
    In,
    Out,
    None,
}

/// Queue-ordering class requested by the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagAction {
    /// May be reordered for fairness and overlapped on a tagged device.
    Simple,
    /// Barrier: never overtaken by later submissions to the same device.
    Ordered,
    /// No hardware tag; one at a time.
    Untagged,
}

/// Completion status. `InProgress` until the transport finishes the CCB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcbStatus {
    InProgress,
    Ok,
    /// Completed with sense data; see [`Ccb::sense`].
    CheckCondition,
    /// The target's command queue is full; the transport re-queues the CCB
    /// and marks the device overflowed.
    DeviceQueueFull,
    /// The bus driver cannot accept more work; re-queued, bus overflowed.
    BusQueueFull,
    /// The bus driver wants the CCB re-dispatched (e.g. after a capability
    /// downgrade); the transport retries it transparently.
    Resubmit,
    Timeout,
    BusReset,
    DeviceNotThere,
    InvalidCdb,
    Aborted,
    /// Device or bus busy at the register level after bounded retries.
    BusBusy,
    /// Transfer over/underrun; `residual` holds the untransferred byte count.
    DataOverrun,
    /// Protocol violation detected mid-command (unexpected register state).
    SequenceFailure,
}

impl CcbStatus {
    /// True for every status that ends the CCB's life at the transport
    /// (as opposed to the internal re-queue statuses).
    pub fn is_final(self) -> bool {
        !matches!(
            self,
            CcbStatus::InProgress
                | CcbStatus::DeviceQueueFull
                | CcbStatus::BusQueueFull
                | CcbStatus::Resubmit
        )
    }
}

/// One entry of a scatter/gather list: a `(base, len)` window into the
/// CCB's data buffer, standing in for one physical run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SgEntry {
    pub base: usize,
    pub len: usize,
}

/// One outstanding I/O request.
///
/// Allocated from the per-bus [`CcbPool`], owned by the submitter until the
/// transport marks it `completed`, then returned to the pool.
#[derive(Debug)]
pub struct Ccb {
    pub function: CcbFunction,
    pub target: u8,
    pub lun: u8,

    pub cdb: [u8; 16],
    pub cdb_len: usize,
    pub direction: DataDirection,

    /// Data buffer. The scatter/gather list (if any) indexes into it.
    pub data: Vec<u8>,
    /// Empty means "one run covering the whole buffer".
    pub sg_list: Vec<SgEntry>,
    /// Bytes *not* transferred, valid once the CCB completes.
    pub residual: usize,

    pub timeout_ms: u64,
    pub tag_action: TagAction,
    /// Hardware tagging permitted for this CCB: set by the transport when
    /// both the bus and the device advertise tagged queueing and the CCB is
    /// a simple command.
    pub hw_tagged: bool,

    pub status: CcbStatus,
    /// Autosense result for `CheckCondition` completions.
    pub sense: Option<SenseData>,
    /// Set by the transport when the CCB reaches a final status.
    pub completed: bool,

    /// For `AbortCommand`: the CCB to hunt down.
    pub abort_target: Option<CcbRef>,

    /// Transport ordering state: free-running per-device sort key assigned
    /// at submit.
    pub(crate) sort_key: u64,
    /// Transport ordering state: this CCB currently holds the device's
    /// dispatch slot (set when dispatched, cleared on completion).
    pub(crate) ordered_lock: bool,
}

impl Default for Ccb {
    fn default() -> Self {
        Ccb::empty()
    }
}

impl Ccb {
    /// A fresh, unsubmitted CCB. Pool allocation via [`crate::Xpt::alloc_ccb`]
    /// is the normal path; this exists for drivers and tests that build
    /// commands directly.
    pub fn empty() -> Self {
        Ccb {
            function: CcbFunction::ScsiIo,
            target: 0,
            lun: 0,
            cdb: [0; 16],
            cdb_len: 0,
            direction: DataDirection::None,
            data: Vec::new(),
            sg_list: Vec::new(),
            residual: 0,
            timeout_ms: 10_000,
            tag_action: TagAction::Simple,
            hw_tagged: false,
            status: CcbStatus::InProgress,
            sense: None,
            completed: false,
            abort_target: None,
            sort_key: 0,
            ordered_lock: false,
        }
    }

    /// Reset submitter-visible state so a pooled CCB can be reused.
    pub(crate) fn recycle(&mut self) {
        *self = Ccb::empty();
    }

    /// The bytes of the CDB that are actually valid.
    pub fn cdb_bytes(&self) -> &[u8] {
        &self.cdb[..self.cdb_len]
    }

    pub fn set_cdb(&mut self, cdb: &[u8]) {
        self.cdb = [0; 16];
        self.cdb[..cdb.len()].copy_from_slice(cdb);
        self.cdb_len = cdb.len();
    }
}

/// Fixed-capacity free list of CCBs, one per bus.
///
/// The pool is the single allocation authority for commands on its bus;
/// exhaustion is reported as resource exhaustion, never grown past
/// capacity.
#[derive(Debug)]
pub struct CcbPool {
    free: Vec<CcbRef>,
    capacity: usize,
}

impl CcbPool {
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity)
            .map(|_| Rc::new(RefCell::new(Ccb::empty())))
            .collect();
        CcbPool { free, capacity }
    }

    pub fn take(&mut self) -> Option<CcbRef> {
        self.free.pop()
    }

    pub fn put(&mut self, ccb: CcbRef) {
        ccb.borrow_mut().recycle();
        if self.free.len() < self.capacity {
            self.free.push(ccb);
        }
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}
