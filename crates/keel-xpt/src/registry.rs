//! Bus/device registry: path-id allocation, reference-counted lookup,
//! deferred teardown.

use std::collections::VecDeque;

use tracing::{debug, warn};

use crate::ccb::{CcbPool, CcbRef};
use crate::error::XptError;
use crate::sim::{AsyncEvent, SimDriver, SimEventQueue};

/// Highest number of concurrently registered buses.
pub const MAX_PATHS: usize = 8;

/// Commands each bus pool holds.
const CCBS_PER_BUS: usize = 16;

/// Stable handle to a registered bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PathId(pub u8);

/// Presence snapshot of one LUN, as last observed by a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub target: u8,
    pub lun: u8,
    pub inquiry: Option<Vec<u8>>,
}

/// One target/LUN on a bus.
///
/// Created lazily on first reference, reaped once the last reference is
/// released while the device is still marked temporary (i.e. discovery
/// never confirmed it, or a rescan un-confirmed it).
#[derive(Debug)]
pub(crate) struct Device {
    pub(crate) target: u8,
    pub(crate) lun: u8,
    pub(crate) refs: u32,
    /// Not yet (or no longer) confirmed by discovery.
    pub(crate) temporary: bool,
    pub(crate) inquiry: Option<Vec<u8>>,

    /// Pending CCBs, ordered: simple commands sorted cyclically after
    /// `last_used_key`, ordered commands at the tail as barriers.
    pub(crate) queued: VecDeque<CcbRef>,
    pub(crate) blocked: u32,
    pub(crate) overflowed: bool,
    /// Invariant: `lock_count == queued.len() + blocked + overflowed as u32`.
    pub(crate) lock_count: u32,

    /// Sort key of the most recently dispatched CCB; the cyclic insertion
    /// base.
    pub(crate) last_used_key: u64,
    /// Free-running key generator. Wraps; see `sort_key_after`.
    pub(crate) next_sort_key: u64,

    /// The device advertised tagged queueing in its inquiry data.
    pub(crate) tagged_queueing: bool,
}

impl Device {
    fn new(target: u8, lun: u8) -> Self {
        Device {
            target,
            lun,
            refs: 0,
            temporary: true,
            inquiry: None,
            queued: VecDeque::new(),
            blocked: 0,
            overflowed: false,
            lock_count: 0,
            last_used_key: 0,
            next_sort_key: 1,
            tagged_queueing: false,
        }
    }

    pub(crate) fn check_lock_invariant(&self) -> bool {
        self.lock_count == self.queued.len() as u32 + self.blocked + u32::from(self.overflowed)
    }

    /// Has work that the dispatcher is currently allowed to start: a
    /// blocked or overflowed device keeps its queue parked until the
    /// corresponding unblock/clear.
    pub(crate) fn serviceable(&self) -> bool {
        !self.queued.is_empty() && self.blocked == 0 && !self.overflowed
    }
}

/// One hardware channel plus its driver.
pub(crate) struct Bus {
    pub(crate) path_id: PathId,
    pub(crate) sim: Box<dyn SimDriver>,
    pub(crate) sim_events: SimEventQueue,
    pub(crate) pool: CcbPool,

    pub(crate) devices: Vec<Device>,
    /// Devices with pending work, in arrival order.
    pub(crate) waiting: VecDeque<(u8, u8)>,
    /// The single CCB currently occupying the bus (not merely the device).
    pub(crate) active: Option<CcbRef>,

    pub(crate) blocked: u32,
    pub(crate) overflowed: bool,

    pub(crate) refs: u32,
    pub(crate) dying: bool,
}

impl Bus {
    pub(crate) fn device(&self, target: u8, lun: u8) -> Option<&Device> {
        self.devices.iter().find(|d| d.target == target && d.lun == lun)
    }

    pub(crate) fn device_mut(&mut self, target: u8, lun: u8) -> Option<&mut Device> {
        self.devices
            .iter_mut()
            .find(|d| d.target == target && d.lun == lun)
    }

    pub(crate) fn dispatch_allowed(&self) -> bool {
        self.active.is_none() && self.blocked == 0 && !self.overflowed
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("path_id", &self.path_id)
            .field("devices", &self.devices.len())
            .field("waiting", &self.waiting.len())
            .field("blocked", &self.blocked)
            .field("overflowed", &self.overflowed)
            .field("refs", &self.refs)
            .field("dying", &self.dying)
            .finish()
    }
}

/// The transport. Single allocation authority for buses, devices and CCBs.
#[derive(Default)]
pub struct Xpt {
    pub(crate) buses: Vec<Option<Bus>>,
    pub(crate) listeners: Vec<Box<dyn FnMut(&AsyncEvent)>>,
    pub(crate) completed: VecDeque<CcbRef>,
}

impl Xpt {
    pub fn new() -> Self {
        Xpt {
            buses: (0..MAX_PATHS).map(|_| None).collect(),
            listeners: Vec::new(),
            completed: VecDeque::new(),
        }
    }

    /// Register a bus driver and assign it the lowest free path id.
    ///
    /// The driver is built by `make_sim` so it can hold the event queue the
    /// transport will drain for it. Registration finishes with an initial
    /// bus scan.
    pub fn register_driver(
        &mut self,
        make_sim: impl FnOnce(SimEventQueue, PathId) -> Box<dyn SimDriver>,
    ) -> Result<PathId, XptError> {
        let slot = self
            .buses
            .iter()
            .position(|b| b.is_none())
            .ok_or(XptError::OutOfSlots)?;
        let path = PathId(slot as u8);
        let sim_events = SimEventQueue::new();
        let sim = make_sim(sim_events.clone(), path);
        self.buses[slot] = Some(Bus {
            path_id: path,
            sim,
            sim_events,
            pool: CcbPool::new(CCBS_PER_BUS),
            devices: Vec::new(),
            waiting: VecDeque::new(),
            active: None,
            blocked: 0,
            overflowed: false,
            refs: 1,
            dying: false,
        });
        debug!(path = path.0, "bus registered");
        self.emit(AsyncEvent::BusRegistered { path_id: path.0 });
        self.scan_bus(path);
        Ok(path)
    }

    /// Begin unregistration. The bus is torn down once the registration
    /// reference (released here) and all lookup references are gone.
    pub fn unregister_driver(&mut self, path: PathId) -> Result<(), XptError> {
        {
            let bus = self.bus_mut(path)?;
            bus.dying = true;
        }
        self.put_bus(path);
        Ok(())
    }

    /// Reference-counted bus acquisition.
    pub fn get_bus(&mut self, path: PathId) -> Result<(), XptError> {
        let bus = self.bus_mut(path)?;
        if bus.dying {
            return Err(XptError::BusDying(path.0));
        }
        bus.refs += 1;
        Ok(())
    }

    /// Release one bus reference; tears the bus down at zero.
    pub fn put_bus(&mut self, path: PathId) {
        let Some(slot) = self.buses.get_mut(path.0 as usize) else {
            return;
        };
        let Some(bus) = slot.as_mut() else { return };
        bus.refs = bus.refs.saturating_sub(1);
        if bus.refs == 0 {
            if bus.active.is_some() || !bus.waiting.is_empty() {
                warn!(path = path.0, "bus destroyed with work still queued");
            }
            debug!(path = path.0, "bus destroyed");
            *slot = None;
        }
    }

    /// Create the device record if it does not exist yet (temporary until
    /// discovery confirms it). Does not take a reference; queued CCBs keep
    /// the record alive on their own.
    pub(crate) fn ensure_device(
        &mut self,
        path: PathId,
        target: u8,
        lun: u8,
    ) -> Result<(), XptError> {
        let bus = self.bus_mut(path)?;
        if bus.device(target, lun).is_none() {
            bus.devices.push(Device::new(target, lun));
            debug!(path = path.0, target, lun, "temporary device created");
        }
        Ok(())
    }

    /// Reference-counted device acquisition; creates a temporary device on
    /// first reference.
    pub fn get_device(&mut self, path: PathId, target: u8, lun: u8) -> Result<(), XptError> {
        self.ensure_device(path, target, lun)?;
        let bus = self.bus_mut(path)?;
        let dev = bus
            .device_mut(target, lun)
            .ok_or(XptError::NoSuchDevice { target, lun })?;
        dev.refs += 1;
        Ok(())
    }

    /// Release one device reference; a temporary device is reaped at zero.
    pub fn put_device(&mut self, path: PathId, target: u8, lun: u8) {
        let Ok(bus) = self.bus_mut(path) else { return };
        let Some(idx) = bus
            .devices
            .iter()
            .position(|d| d.target == target && d.lun == lun)
        else {
            return;
        };
        let dev = &mut bus.devices[idx];
        dev.refs = dev.refs.saturating_sub(1);
        if dev.refs == 0 && dev.temporary && dev.queued.is_empty() {
            debug!(path = path.0, target, lun, "temporary device reaped");
            bus.devices.swap_remove(idx);
        }
    }

    /// Register an async-event listener (device found/lost, bus reset).
    pub fn register_listener(&mut self, listener: Box<dyn FnMut(&AsyncEvent)>) {
        self.listeners.push(listener);
    }

    /// Snapshot of confirmed devices on a bus.
    pub fn devices(&self, path: PathId) -> Vec<DeviceInfo> {
        let Ok(bus) = self.bus(path) else {
            return Vec::new();
        };
        bus.devices
            .iter()
            .filter(|d| !d.temporary)
            .map(|d| DeviceInfo {
                target: d.target,
                lun: d.lun,
                inquiry: d.inquiry.clone(),
            })
            .collect()
    }

    /// Lock-count invariant check, exposed for tests.
    pub fn device_invariants_hold(&self, path: PathId) -> bool {
        let Ok(bus) = self.bus(path) else { return true };
        bus.devices.iter().all(|d| d.check_lock_invariant())
    }

    /// Take one CCB from the bus pool.
    pub fn alloc_ccb(&mut self, path: PathId) -> Result<CcbRef, XptError> {
        let bus = self.bus_mut(path)?;
        bus.pool.take().ok_or(XptError::NoCcbSlots(path.0))
    }

    /// Return a completed CCB to its bus pool.
    pub fn free_ccb(&mut self, path: PathId, ccb: CcbRef) {
        if let Ok(bus) = self.bus_mut(path) {
            bus.pool.put(ccb);
        }
    }

    /// Pop the next finally-completed CCB, if any.
    pub fn next_completed(&mut self) -> Option<CcbRef> {
        self.completed.pop_front()
    }

    pub(crate) fn bus(&self, path: PathId) -> Result<&Bus, XptError> {
        self.buses
            .get(path.0 as usize)
            .and_then(|b| b.as_ref())
            .ok_or(XptError::NoSuchBus(path.0))
    }

    pub(crate) fn bus_mut(&mut self, path: PathId) -> Result<&mut Bus, XptError> {
        self.buses
            .get_mut(path.0 as usize)
            .and_then(|b| b.as_mut())
            .ok_or(XptError::NoSuchBus(path.0))
    }

    pub(crate) fn emit(&mut self, ev: AsyncEvent) {
        for l in &mut self.listeners {
            l(&ev);
        }
    }
}

impl std::fmt::Debug for Xpt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Xpt")
            .field("buses", &self.buses)
            .field("completed", &self.completed.len())
            .finish()
    }
}
