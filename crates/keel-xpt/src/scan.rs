//! Bus and LUN discovery: TEST UNIT READY + INQUIRY probing with
//! presence-flip notifications.

use std::rc::Rc;

use tracing::{debug, warn};

use crate::ccb::{CcbRef, CcbStatus, DataDirection, TagAction};
use crate::error::XptError;
use crate::registry::{PathId, Xpt};
use crate::sim::AsyncEvent;

/// Standard INQUIRY allocation used by the scanner.
pub const INQUIRY_DATA_LEN: usize = 36;

/// Peripheral qualifier reported for a LUN that is not connected.
pub const LUN_ABSENT_QUALIFIER: u8 = 0b011;

/// Pump iterations a synchronous submission is allowed before the scanner
/// gives up on it. Deterministic SIMs complete in a handful of pumps.
const MAX_SYNC_PUMPS: usize = 256;

pub fn test_unit_ready_cdb() -> [u8; 6] {
    [0; 6]
}

pub fn inquiry_cdb(alloc_len: u8) -> [u8; 6] {
    [0x12, 0, 0, 0, alloc_len, 0]
}

fn fill_probe_ccb(ccb: &CcbRef, target: u8, lun: u8, cdb: &[u8], data_len: usize) {
    let mut c = ccb.borrow_mut();
    c.target = target;
    c.lun = lun;
    c.set_cdb(cdb);
    c.direction = if data_len > 0 {
        DataDirection::In
    } else {
        DataDirection::None
    };
    c.data = vec![0; data_len];
    c.tag_action = TagAction::Ordered;
    c.timeout_ms = 2_000;
}

impl Xpt {
    /// Submit and pump until the CCB completes (bounded). The CCB is
    /// removed from the completion queue before returning, so synchronous
    /// callers never see their commands in [`Xpt::next_completed`].
    pub fn execute_sync(&mut self, path: PathId, ccb: CcbRef) -> Result<(), XptError> {
        self.submit(path, ccb.clone())?;
        for _ in 0..MAX_SYNC_PUMPS {
            if ccb.borrow().completed {
                break;
            }
            self.pump(path)?;
        }
        if !ccb.borrow().completed {
            warn!("synchronous command did not complete within the pump bound");
        }
        if let Some(pos) = self.completed.iter().position(|c| Rc::ptr_eq(c, &ccb)) {
            self.completed.remove(pos);
        }
        Ok(())
    }

    /// Probe every target/LUN of a bus, emitting `DeviceFound`/`DeviceLost`
    /// exactly when a LUN's presence state flips.
    pub fn scan_bus(&mut self, path: PathId) {
        let (targets, luns) = match self.bus(path) {
            Ok(bus) => (bus.sim.target_count(), bus.sim.lun_count()),
            Err(_) => return,
        };
        for target in 0..targets {
            for lun in 0..luns {
                self.scan_lun(path, target, lun);
            }
        }
    }

    /// Probe a single LUN. Discovery failures leave the LUN absent; they
    /// are never surfaced as scan errors.
    pub fn scan_lun(&mut self, path: PathId, target: u8, lun: u8) {
        if self.get_device(path, target, lun).is_err() {
            return;
        }

        let inquiry = self.probe_lun(path, target, lun);

        let mut flip = None;
        if let Ok(bus) = self.bus_mut(path) {
            if let Some(dev) = bus.device_mut(target, lun) {
                let was_present = !dev.temporary;
                match inquiry {
                    Some(data) => {
                        let changed = was_present && dev.inquiry.as_deref() != Some(&data[..]);
                        if changed {
                            // Same address, different identity: report the
                            // old device gone before the new one appears.
                            flip = Some((true, true));
                        } else if !was_present {
                            flip = Some((false, true));
                        }
                        dev.temporary = false;
                        dev.tagged_queueing = data.len() > 7 && (data[7] & 0x02) != 0;
                        dev.inquiry = Some(data);
                    }
                    None => {
                        if was_present {
                            flip = Some((true, false));
                        }
                        dev.temporary = true;
                        dev.inquiry = None;
                        dev.tagged_queueing = false;
                    }
                }
            }
        }

        match flip {
            Some((true, found)) => {
                debug!(path = path.0, target, lun, "device lost");
                self.emit(AsyncEvent::DeviceLost { path_id: path.0, target, lun });
                if found {
                    debug!(path = path.0, target, lun, "device found (changed)");
                    self.emit(AsyncEvent::DeviceFound { path_id: path.0, target, lun });
                }
            }
            Some((false, true)) => {
                debug!(path = path.0, target, lun, "device found");
                self.emit(AsyncEvent::DeviceFound { path_id: path.0, target, lun });
            }
            _ => {}
        }

        self.put_device(path, target, lun);
    }

    /// Issue the probe commands; returns the inquiry data when the LUN
    /// answered and is connected.
    fn probe_lun(&mut self, path: PathId, target: u8, lun: u8) -> Option<Vec<u8>> {
        // TEST UNIT READY first (LUN 0 only): clears power-on unit
        // attention and weeds out dead targets cheaply. The result other
        // than "no such device" is ignored.
        if lun == 0 {
            let ccb = self.alloc_ccb(path).ok()?;
            fill_probe_ccb(&ccb, target, lun, &test_unit_ready_cdb(), 0);
            let _ = self.execute_sync(path, ccb.clone());
            let gone = matches!(ccb.borrow().status, CcbStatus::DeviceNotThere);
            self.free_ccb(path, ccb);
            if gone {
                return None;
            }
        }

        let ccb = self.alloc_ccb(path).ok()?;
        fill_probe_ccb(&ccb, target, lun, &inquiry_cdb(INQUIRY_DATA_LEN as u8), INQUIRY_DATA_LEN);
        let _ = self.execute_sync(path, ccb.clone());
        let result = {
            let c = ccb.borrow();
            match c.status {
                CcbStatus::Ok if (c.data[0] >> 5) != LUN_ABSENT_QUALIFIER => {
                    Some(c.data.clone())
                }
                _ => None,
            }
        };
        self.free_ccb(path, ccb);
        result
    }
}
