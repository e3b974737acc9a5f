//! SCSI sense data: key / additional sense code / qualifier triples and the
//! fixed-format encoding returned to command submitters.

/// SPC sense keys. Values are the wire encoding (low nibble of byte 2 of
/// fixed-format sense data).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SenseKey {
    NoSense = 0x0,
    RecoveredError = 0x1,
    NotReady = 0x2,
    MediumError = 0x3,
    HardwareError = 0x4,
    IllegalRequest = 0x5,
    UnitAttention = 0x6,
    DataProtect = 0x7,
    BlankCheck = 0x8,
    VendorSpecific = 0x9,
    CopyAborted = 0xA,
    AbortedCommand = 0xB,
    VolumeOverflow = 0xD,
    Miscompare = 0xE,
}

impl SenseKey {
    pub fn from_raw(v: u8) -> Self {
        match v & 0x0F {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0x8 => SenseKey::BlankCheck,
            0x9 => SenseKey::VendorSpecific,
            0xA => SenseKey::CopyAborted,
            0xD => SenseKey::VolumeOverflow,
            0xE => SenseKey::Miscompare,
            _ => SenseKey::AbortedCommand,
        }
    }
}

/// Additional sense codes used by the ATA/ATAPI error decoders.
pub mod asc {
    /// (ASC, ASCQ) pairs.
    pub const NO_ADDITIONAL_SENSE: (u8, u8) = (0x00, 0x00);
    pub const UNRECOVERED_READ_ERROR: (u8, u8) = (0x11, 0x00);
    pub const RANDOM_POSITIONING_ERROR: (u8, u8) = (0x15, 0x01);
    pub const INVALID_COMMAND_OPCODE: (u8, u8) = (0x20, 0x00);
    pub const LBA_OUT_OF_RANGE: (u8, u8) = (0x21, 0x00);
    pub const INVALID_FIELD_IN_CDB: (u8, u8) = (0x24, 0x00);
    pub const WRITE_PROTECTED: (u8, u8) = (0x27, 0x00);
    pub const MEDIUM_CHANGED: (u8, u8) = (0x28, 0x00);
    pub const BUS_RESET_OCCURRED: (u8, u8) = (0x29, 0x00);
    pub const MEDIUM_FORMAT_CORRUPTED: (u8, u8) = (0x31, 0x00);
    pub const MEDIUM_NOT_PRESENT: (u8, u8) = (0x3A, 0x00);
    pub const OPERATOR_MEDIUM_REMOVAL_REQUEST: (u8, u8) = (0x5A, 0x01);
    pub const IO_CRC_ERROR: (u8, u8) = (0x47, 0x00);
    pub const INTERNAL_TARGET_FAILURE: (u8, u8) = (0x44, 0x00);
    pub const ABORTED_COMMAND: (u8, u8) = (0x47, 0x80);
}

/// One decoded error classification, attached to a device until the next
/// completion reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenseData {
    pub key: SenseKey,
    pub asc: u8,
    pub ascq: u8,
}

impl SenseData {
    pub fn new(key: SenseKey, (asc, ascq): (u8, u8)) -> Self {
        SenseData { key, asc, ascq }
    }

    pub fn none() -> Self {
        SenseData::new(SenseKey::NoSense, asc::NO_ADDITIONAL_SENSE)
    }

    /// Encode as fixed-format (response code 0x70) sense data.
    ///
    /// Writes up to 18 bytes; returns the number of bytes written, bounded
    /// by the caller's buffer.
    pub fn encode_fixed(&self, out: &mut [u8]) -> usize {
        let mut full = [0u8; 18];
        full[0] = 0x70; // current error, fixed format
        full[2] = self.key as u8;
        full[7] = 10; // additional sense length
        full[12] = self.asc;
        full[13] = self.ascq;
        let n = out.len().min(full.len());
        out[..n].copy_from_slice(&full[..n]);
        n
    }

    /// Decode from fixed-format sense data (e.g. an ATAPI REQUEST SENSE
    /// response). Returns `None` when the buffer is too short or carries an
    /// unknown response code.
    pub fn decode_fixed(buf: &[u8]) -> Option<Self> {
        if buf.len() < 14 || (buf[0] & 0x7F) != 0x70 {
            return None;
        }
        Some(SenseData {
            key: SenseKey::from_raw(buf[2]),
            asc: buf[12],
            ascq: buf[13],
        })
    }
}
