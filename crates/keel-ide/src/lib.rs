//! IDE/ATA bus manager.
//!
//! Implements [`keel_xpt::SimDriver`] for one legacy IDE channel: drive
//! discovery and identify, SCSI-to-ATA and SCSI-to-ATAPI command
//! translation, PIO and bus-master DMA data phases, tagged (overlapped)
//! queueing, and timeout/reset escalation. Hardware access goes through
//! the [`hw::HwChannel`] trait; time goes through [`hw::Clock`]; both are
//! deterministic in tests.

pub mod ata;
pub mod atapi;
mod bus;
pub mod channel;
pub mod dma;
pub mod hw;
pub mod identify;
pub mod pio;
pub mod queuing;
pub mod regs;
pub mod taskfile;

pub use bus::IdeBus;
pub use channel::{BusState, Channel, ChannelError, Dpc, DriveKind};
pub use dma::{DmaPolicy, MAX_DMA_FAILURES};
pub use hw::{Clock, DmaError, DmaOutcome, DmaXfer, HwChannel, ManualClock, TfReg};
pub use identify::{ChsGeometry, IdentifyData};
pub use queuing::MAX_CQ_FAILURES;
