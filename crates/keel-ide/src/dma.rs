//! Bus-master DMA policy and buffer handoff.
//!
//! The request buffer moves into the controller for the duration of a
//! transfer and comes back when it finishes, so the engine never aliases
//! memory the controller is writing. Drives that keep failing DMA are
//! downgraded to PIO rather than failing requests forever.

use keel_xpt::{Ccb, DataDirection, SgEntry};
use tracing::warn;

use crate::hw::{DmaError, DmaXfer, HwChannel};

/// Consecutive DMA failures tolerated before a drive falls back to PIO.
pub const MAX_DMA_FAILURES: u8 = 2;

/// Per-drive DMA health tracking.
#[derive(Debug, Default)]
pub struct DmaPolicy {
    failures: u8,
    disabled: bool,
}

impl DmaPolicy {
    /// Whether the next transfer may use DMA. `capable` is the drive's
    /// identify-reported DMA support.
    pub fn allows(&self, capable: bool) -> bool {
        capable && !self.disabled
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Returns true when this failure tips the drive over into PIO-only
    /// operation.
    pub fn record_failure(&mut self) -> bool {
        if self.disabled {
            return false;
        }
        self.failures += 1;
        if self.failures >= MAX_DMA_FAILURES {
            self.disabled = true;
            warn!(failures = self.failures, "disabling DMA after repeated failures");
            return true;
        }
        false
    }

    pub fn disabled(&self) -> bool {
        self.disabled
    }
}

/// Hand the request buffer to the controller and arm the engine. The
/// direction is taken from the request; the drive must already have been
/// given the matching command.
pub fn begin(hw: &mut dyn HwChannel, ccb: &mut Ccb) -> Result<(), DmaError> {
    let is_write = ccb.direction == DataDirection::Out;
    let sg_list = effective_sg(ccb);
    let xfer = DmaXfer {
        buffer: std::mem::take(&mut ccb.data),
        sg_list,
        is_write,
    };
    hw.prepare_dma(xfer)?;
    hw.start_dma();
    Ok(())
}

/// Collect the engine's result and return the buffer to the request. The
/// buffer comes back even when the transfer failed, so a retry or PIO
/// fallback can reuse it.
pub fn complete(hw: &mut dyn HwChannel, ccb: &mut Ccb) -> Result<(), DmaError> {
    let outcome = hw.finish_dma();
    ccb.data = outcome.xfer.buffer;
    match outcome.error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// A request with no scatter list is one contiguous window over its buffer.
pub fn effective_sg(ccb: &Ccb) -> Vec<SgEntry> {
    if ccb.sg_list.is_empty() {
        vec![SgEntry {
            base: 0,
            len: ccb.data.len(),
        }]
    } else {
        ccb.sg_list.clone()
    }
}
