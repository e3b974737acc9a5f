use thiserror::Error;

/// Transport-layer failures surfaced to callers of the registry API.
///
/// Command-level failures are never reported here; they travel in
/// [`crate::CcbStatus`] on the completed CCB.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum XptError {
    #[error("no free path id for a new bus")]
    OutOfSlots,

    #[error("no bus registered for path id {0}")]
    NoSuchBus(u8),

    #[error("no device at target {target} lun {lun}")]
    NoSuchDevice { target: u8, lun: u8 },

    #[error("bus {0} is being unregistered")]
    BusDying(u8),

    #[error("command pool exhausted on path id {0}")]
    NoCcbSlots(u8),
}
