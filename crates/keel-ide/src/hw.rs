//! The hardware collaborator: register-level access to one IDE channel.
//!
//! The bus manager never touches I/O ports; everything chip-specific lives
//! behind [`HwChannel`]. Tests implement it with an in-memory channel model.

use thiserror::Error;

use keel_xpt::SgEntry;

/// Task-file register selector. One selector per register pair; the
/// direction of the access picks the read or write meaning
/// (error/features, status/command).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TfReg {
    /// Error (read) / Features (write).
    Features,
    SectorCount,
    LbaLow,
    LbaMid,
    LbaHigh,
    /// Device/head select.
    Device,
    /// Status (read, acks INTRQ) / Command (write).
    Command,
}

/// DMA engine failures, as reported by the chip driver.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum DmaError {
    /// The scatter/gather list could not be mapped for this transfer.
    #[error("DMA mapping failed")]
    Mapping,
    /// The transfer started but did not complete cleanly.
    #[error("DMA transfer failed")]
    Transfer,
}

/// One DMA transfer: the engine owns the buffer for the duration and hands
/// it back from `finish_dma`.
#[derive(Debug)]
pub struct DmaXfer {
    pub buffer: Vec<u8>,
    pub sg_list: Vec<SgEntry>,
    pub is_write: bool,
}

/// Result of tearing down a transfer. The buffer always comes back, even
/// from a failed transfer, so the request can be retried or refallen to
/// PIO without losing its data.
#[derive(Debug)]
pub struct DmaOutcome {
    pub xfer: DmaXfer,
    pub error: Option<DmaError>,
}

/// Register-level operations on one IDE channel.
pub trait HwChannel {
    fn read_reg(&mut self, reg: TfReg) -> u8;
    fn write_reg(&mut self, reg: TfReg, val: u8);

    /// Status without acknowledging a pending interrupt.
    fn alt_status(&mut self) -> u8;
    /// Device Control register (nIEN, SRST).
    fn write_device_control(&mut self, val: u8);

    /// Transfer words over the data port, device to host.
    fn read_pio(&mut self, words: &mut [u16]);
    /// Transfer words over the data port, host to device.
    fn write_pio(&mut self, words: &[u16]);

    /// Map the buffer for bus-master DMA. Failure here is a host resource
    /// problem, not a device error.
    fn prepare_dma(&mut self, xfer: DmaXfer) -> Result<(), DmaError>;
    /// Start the prepared transfer.
    fn start_dma(&mut self);
    /// Tear down the transfer and return the buffer.
    fn finish_dma(&mut self) -> DmaOutcome;

    /// Level of the channel's interrupt line.
    fn intrq(&mut self) -> bool;
}

/// Virtual time source used for timeouts and bounded polls. Tests use a
/// manually advanced clock.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// A manually stepped [`Clock`].
#[derive(Debug, Default)]
pub struct ManualClock {
    now: std::cell::Cell<u64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, ms: u64) {
        self.now.set(self.now.get() + ms);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.get()
    }
}
