//! Channel state machine: drive selection, register waits, interrupt
//! acknowledgement, and the deferred-work queue.
//!
//! Exactly one access owns the channel at a time. An access that expects
//! an interrupt arms a wait with a fresh wait id; the interrupt handler
//! and the timeout check race to claim that id, and whichever claims it
//! first queues the deferred work item. The loser sees a stale id and
//! does nothing, so a late interrupt can never complete a request the
//! timeout path already failed (or vice versa).

use std::collections::VecDeque;
use std::rc::Rc;

use thiserror::Error;
use tracing::{debug, trace, warn};

use crate::hw::{Clock, HwChannel, TfReg};
use crate::regs::{
    CTRL_NIEN, CTRL_SRST, DEVICE_OBSOLETE_BITS, DEVICE_SLAVE, RESET_SPINUP_MS, SIG_ATAPI_HIGH,
    SIG_ATAPI_MID, STATUS_BSY, STATUS_DRQ, STATUS_ERR,
};
use crate::taskfile::TaskFile;

/// Bound on register-poll iterations during a synchronous wait, so a wedged
/// controller cannot hang the pump even if the clock never advances.
const MAX_SYNC_SPINS: u32 = 100_000;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChannelError {
    #[error("timed out waiting for drive (status {status:#04x})")]
    WaitTimeout { status: u8 },
    #[error("drive reported error (status {status:#04x})")]
    DriveError { status: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    /// No access in flight. An interrupt here is a service request from a
    /// released tagged command.
    Idle,
    /// An access is running but not expecting an interrupt right now.
    Accessing,
    /// An access released the channel pending an interrupt.
    AsyncWaiting,
    /// An access is spinning in-line for an interrupt; no DPC is queued
    /// when it arrives.
    SyncWaiting,
}

/// Deferred work queued from the interrupt and timeout paths, run from the
/// pump where it is safe to touch the rest of the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dpc {
    /// Awaited interrupt arrived; `status` was latched when it was
    /// acknowledged.
    Completion { status: u8 },
    /// Interrupt on an idle channel: a released command wants service.
    ServiceRequest,
    /// The armed wait expired without an interrupt.
    Timeout,
}

/// What a drive's post-reset signature says it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveKind {
    Ata,
    Atapi,
}

pub struct Channel {
    pub hw: Box<dyn HwChannel>,
    pub clock: Rc<dyn Clock>,
    state: BusState,
    wait_id: u64,
    /// Armed timeout: (deadline in clock ms, wait id it belongs to).
    timeout: Option<(u64, u64)>,
    dpcs: VecDeque<Dpc>,
    selected: Option<u8>,
    /// Status latched by an interrupt that landed during a sync wait.
    sync_status: Option<u8>,
}

impl Channel {
    pub fn new(hw: Box<dyn HwChannel>, clock: Rc<dyn Clock>) -> Self {
        Self {
            hw,
            clock,
            state: BusState::Idle,
            wait_id: 0,
            timeout: None,
            dpcs: VecDeque::new(),
            selected: None,
            sync_status: None,
        }
    }

    pub fn state(&self) -> BusState {
        self.state
    }

    pub fn set_accessing(&mut self) {
        self.state = BusState::Accessing;
    }

    pub fn set_idle(&mut self) {
        self.state = BusState::Idle;
        self.timeout = None;
    }

    /// Select `drive` (0 or 1) via the device register. Re-selection of the
    /// already-selected drive is free.
    pub fn select(&mut self, drive: u8, device_bits: u8) {
        let val = DEVICE_OBSOLETE_BITS
            | if drive == 1 { DEVICE_SLAVE } else { 0 }
            | device_bits;
        if self.selected != Some(drive) {
            trace!(drive, "selecting drive");
        }
        self.hw.write_reg(TfReg::Device, val);
        self.selected = Some(drive);
    }

    pub fn deselect(&mut self) {
        self.selected = None;
    }

    /// Program the taskfile registers and fire the command.
    pub fn issue(&mut self, tf: &TaskFile) {
        for (reg, val) in tf.register_writes() {
            self.hw.write_reg(reg, val);
        }
        self.hw.write_reg(TfReg::Command, tf.command());
    }

    /// Poll until BSY clears or the deadline passes. Reads the alternate
    /// status register so no pending interrupt is acknowledged.
    pub fn wait_not_busy(&mut self, timeout_ms: u64) -> Result<u8, ChannelError> {
        let deadline = self.clock.now_ms().saturating_add(timeout_ms);
        for _ in 0..MAX_SYNC_SPINS {
            let status = self.hw.alt_status();
            if status & STATUS_BSY == 0 {
                return Ok(status);
            }
            if self.clock.now_ms() >= deadline {
                return Err(ChannelError::WaitTimeout { status });
            }
        }
        Err(ChannelError::WaitTimeout {
            status: self.hw.alt_status(),
        })
    }

    /// Wait for the drive to raise DRQ for a data phase. ERR before DRQ is
    /// the drive rejecting the command.
    pub fn wait_drq(&mut self, timeout_ms: u64) -> Result<u8, ChannelError> {
        let deadline = self.clock.now_ms().saturating_add(timeout_ms);
        for _ in 0..MAX_SYNC_SPINS {
            let status = self.hw.alt_status();
            if status & STATUS_BSY == 0 {
                if status & STATUS_ERR != 0 {
                    return Err(ChannelError::DriveError { status });
                }
                if status & STATUS_DRQ != 0 {
                    return Ok(status);
                }
            }
            if self.clock.now_ms() >= deadline {
                return Err(ChannelError::WaitTimeout { status });
            }
        }
        Err(ChannelError::WaitTimeout {
            status: self.hw.alt_status(),
        })
    }

    /// Release the channel pending an interrupt, arming a timeout for the
    /// new wait.
    pub fn arm_wait(&mut self, timeout_ms: u64) {
        self.wait_id = self.wait_id.wrapping_add(1);
        self.state = BusState::AsyncWaiting;
        self.timeout = Some((self.clock.now_ms().saturating_add(timeout_ms), self.wait_id));
        trace!(wait_id = self.wait_id, timeout_ms, "armed interrupt wait");
    }

    /// Spin in-line until the drive interrupts, returning the status
    /// latched at acknowledgement. For paths that cannot make progress
    /// anyway, such as pulling identify data during bring-up; everything
    /// else goes through [`Channel::arm_wait`] and the DPC queue.
    pub fn wait_interrupt(&mut self, timeout_ms: u64) -> Result<u8, ChannelError> {
        let resume = self.state;
        self.wait_id = self.wait_id.wrapping_add(1);
        self.state = BusState::SyncWaiting;
        self.sync_status = None;
        let deadline = self.clock.now_ms().saturating_add(timeout_ms);
        for _ in 0..MAX_SYNC_SPINS {
            if self.poll_intrq() {
                if let Some(status) = self.sync_status.take() {
                    self.state = resume;
                    return Ok(status);
                }
            }
            let status = self.hw.alt_status();
            if self.clock.now_ms() >= deadline {
                self.wait_id = self.wait_id.wrapping_add(1);
                self.state = resume;
                return Err(ChannelError::WaitTimeout { status });
            }
        }
        self.wait_id = self.wait_id.wrapping_add(1);
        self.state = resume;
        Err(ChannelError::WaitTimeout {
            status: self.hw.alt_status(),
        })
    }

    /// Hardware interrupt entry point. Reading the status register
    /// acknowledges the interrupt; the latched value travels with the DPC.
    pub fn on_interrupt(&mut self) {
        let status = self.hw.read_reg(TfReg::Command);
        match self.state {
            BusState::AsyncWaiting => {
                // Claim the wait; a later timeout check sees a stale id.
                self.wait_id = self.wait_id.wrapping_add(1);
                self.timeout = None;
                self.state = BusState::Accessing;
                self.dpcs.push_back(Dpc::Completion { status });
            }
            BusState::SyncWaiting => {
                self.wait_id = self.wait_id.wrapping_add(1);
                self.timeout = None;
                self.sync_status = Some(status);
            }
            BusState::Idle => {
                self.dpcs.push_back(Dpc::ServiceRequest);
            }
            BusState::Accessing => {
                warn!(status = format_args!("{status:#04x}"), "spurious interrupt");
            }
        }
    }

    /// Fire the armed timeout if its deadline has passed and no interrupt
    /// claimed the wait first.
    pub fn check_timeout(&mut self) {
        let Some((deadline, armed_id)) = self.timeout else {
            return;
        };
        if self.clock.now_ms() < deadline {
            return;
        }
        self.timeout = None;
        if armed_id != self.wait_id {
            // Interrupt won the race.
            return;
        }
        self.wait_id = self.wait_id.wrapping_add(1);
        self.state = BusState::Accessing;
        debug!("interrupt wait expired");
        self.dpcs.push_back(Dpc::Timeout);
    }

    pub fn take_dpc(&mut self) -> Option<Dpc> {
        self.dpcs.pop_front()
    }

    pub fn has_dpcs(&self) -> bool {
        !self.dpcs.is_empty()
    }

    /// Poll the INTRQ line and deliver any pending interrupt. Returns true
    /// if one was delivered.
    pub fn poll_intrq(&mut self) -> bool {
        if self.hw.intrq() {
            self.on_interrupt();
            true
        } else {
            false
        }
    }

    /// Soft-reset the channel: pulse SRST, then wait out the (virtual)
    /// spin-up. Drops any armed wait and pending DPCs; the caller fails the
    /// requests they belonged to.
    pub fn soft_reset(&mut self) -> Result<(), ChannelError> {
        self.hw.write_device_control(CTRL_SRST | CTRL_NIEN);
        self.hw.write_device_control(0);
        self.wait_id = self.wait_id.wrapping_add(1);
        self.timeout = None;
        self.dpcs.clear();
        self.sync_status = None;
        self.state = BusState::Idle;
        self.selected = None;
        self.wait_not_busy(RESET_SPINUP_MS)?;
        Ok(())
    }

    /// Read the post-reset signature of `drive`, if one is present.
    pub fn probe_signature(&mut self, drive: u8) -> Option<DriveKind> {
        self.select(drive, 0);
        let status = match self.wait_not_busy(1_000) {
            Ok(s) => s,
            Err(_) => return None,
        };
        let count = self.hw.read_reg(TfReg::SectorCount);
        let low = self.hw.read_reg(TfReg::LbaLow);
        let mid = self.hw.read_reg(TfReg::LbaMid);
        let high = self.hw.read_reg(TfReg::LbaHigh);
        if count != 0x01 || low != 0x01 {
            return None;
        }
        if mid == SIG_ATAPI_MID && high == SIG_ATAPI_HIGH {
            return Some(DriveKind::Atapi);
        }
        if mid == 0 && high == 0 {
            // ATA signature, but a floating bus also reads zero; require a
            // live status.
            if status == 0 || status == 0xFF {
                return None;
            }
            return Some(DriveKind::Ata);
        }
        None
    }
}
