//! SCSI-style block transport core (XPT).
//!
//! The transport owns the bus/device registry and the per-device command
//! queues. Bus drivers ("SIMs") register through [`Xpt::register_driver`],
//! receive commands via [`SimDriver::action`], and report completions and
//! flow-control changes through the [`SimEventQueue`] handed to them at
//! registration. Upper layers allocate a [`Ccb`] from the bus pool, fill in
//! a SCSI CDB, and submit it; the transport decides whether to dispatch it
//! immediately or park it on the target device's pending list.
//!
//! Everything runs on a deterministic pump model: hardware-side progress is
//! made by [`Xpt::pump`], which advances the SIM, drains its event queue,
//! and re-runs the dispatcher. There are no background threads; callers
//! (and tests) decide when the world moves.

mod ccb;
mod error;
mod queue;
mod registry;
mod scan;
mod sense;
mod sim;

pub use ccb::{
    Ccb, CcbFunction, CcbPool, CcbRef, CcbStatus, DataDirection, SgEntry, TagAction,
};
pub use error::XptError;
pub use registry::{DeviceInfo, PathId, Xpt, MAX_PATHS};
pub use scan::{inquiry_cdb, test_unit_ready_cdb, INQUIRY_DATA_LEN, LUN_ABSENT_QUALIFIER};
pub use sense::{asc, SenseData, SenseKey};
pub use sim::{AsyncEvent, SimDriver, SimEvent, SimEventQueue};
