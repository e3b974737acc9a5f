//! SCSI command translation for ATA disk drives.
//!
//! Block commands become task files; the informational commands a disk has
//! no hardware analogue for (INQUIRY, REQUEST SENSE, READ CAPACITY) are
//! answered from identify data and latched sense without touching the
//! drive.

use keel_xpt::{asc, Ccb, CcbStatus, DataDirection, SenseData, SenseKey};

use crate::identify::IdentifyData;
use crate::regs::*;
use crate::taskfile::{rw_taskfile, RwCaps, TaskFile, XferMode};

/// SCSI operation codes handled by the translators.
pub mod op {
    pub const TEST_UNIT_READY: u8 = 0x00;
    pub const REQUEST_SENSE: u8 = 0x03;
    pub const READ_6: u8 = 0x08;
    pub const WRITE_6: u8 = 0x0A;
    pub const INQUIRY: u8 = 0x12;
    pub const MODE_SELECT_6: u8 = 0x15;
    pub const MODE_SENSE_6: u8 = 0x1A;
    pub const START_STOP_UNIT: u8 = 0x1B;
    pub const PREVENT_ALLOW_REMOVAL: u8 = 0x1E;
    pub const READ_CAPACITY_10: u8 = 0x25;
    pub const READ_10: u8 = 0x28;
    pub const WRITE_10: u8 = 0x2A;
    pub const SYNCHRONIZE_CACHE_10: u8 = 0x35;
    pub const MODE_SELECT_10: u8 = 0x55;
    pub const MODE_SENSE_10: u8 = 0x5A;
    pub const READ_12: u8 = 0xA8;
    pub const WRITE_12: u8 = 0xAA;
}

/// Transparent CRC-error retries before the failure is reported.
pub const MAX_CRC_RETRIES: u8 = 3;

/// What a translated command needs from the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Translation {
    /// Finished without a drive access.
    Complete {
        status: CcbStatus,
        sense: Option<SenseData>,
    },
    /// Answered from host-side state; copy into the request buffer.
    Data(Vec<u8>),
    /// Needs a drive access.
    Access(AtaAccess),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AtaAccess {
    pub tf: TaskFile,
    pub mode: XferMode,
    pub is_write: bool,
    /// Total data-phase bytes (zero for non-data commands).
    pub byte_count: usize,
}

impl Translation {
    fn ok() -> Self {
        Translation::Complete {
            status: CcbStatus::Ok,
            sense: None,
        }
    }

    fn non_data(command: u8) -> Self {
        Translation::Access(AtaAccess {
            tf: TaskFile::NonData {
                command,
                features: 0,
                count: 0,
            },
            mode: XferMode::Pio,
            is_write: false,
            byte_count: 0,
        })
    }
}

/// Sector run addressed by a read/write CDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RwRequest {
    pub lba: u64,
    pub count: u64,
    pub is_write: bool,
}

/// Parse the block address and length out of a READ/WRITE CDB. Returns
/// `None` for non-rw opcodes.
pub fn parse_rw(cdb: &[u8]) -> Option<RwRequest> {
    let opcode = *cdb.first()?;
    match opcode {
        op::READ_6 | op::WRITE_6 => Some(RwRequest {
            lba: (u64::from(cdb[1] & 0x1F) << 16) | (u64::from(cdb[2]) << 8) | u64::from(cdb[3]),
            // A zero count means 256 sectors in the 6-byte form.
            count: if cdb[4] == 0 { 256 } else { u64::from(cdb[4]) },
            is_write: opcode == op::WRITE_6,
        }),
        op::READ_10 | op::WRITE_10 => Some(RwRequest {
            lba: u64::from(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]])),
            count: u64::from(u16::from_be_bytes([cdb[7], cdb[8]])),
            is_write: opcode == op::WRITE_10,
        }),
        op::READ_12 | op::WRITE_12 => Some(RwRequest {
            lba: u64::from(u32::from_be_bytes([cdb[2], cdb[3], cdb[4], cdb[5]])),
            count: u64::from(u32::from_be_bytes([cdb[6], cdb[7], cdb[8], cdb[9]])),
            is_write: opcode == op::WRITE_12,
        }),
        _ => None,
    }
}

/// Translate one SCSI request against an ATA disk. `rw_mode` is the data
/// phase the caller can currently drive (PIO fallback, DMA, or a tagged
/// slot). An `Err` is a CHECK CONDITION with the given sense.
pub fn translate(
    identify: &IdentifyData,
    pending_sense: &mut Option<SenseData>,
    ccb: &Ccb,
    rw_mode: XferMode,
) -> Result<Translation, SenseData> {
    let cdb = ccb.cdb_bytes();
    let opcode = cdb[0];

    if let Some(rw) = parse_rw(cdb) {
        if rw.count == 0 {
            // 10/12-byte forms encode zero-length transfers.
            return Ok(Translation::ok());
        }
        if rw.lba + rw.count > identify.sector_count {
            return Err(SenseData::new(SenseKey::IllegalRequest, asc::LBA_OUT_OF_RANGE));
        }
        let caps = RwCaps {
            lba_supported: identify.lba_supported,
            lba48_supported: identify.lba48_supported,
            geometry: identify.geometry,
        };
        let tf = rw_taskfile(&caps, rw.lba, rw.count, rw.is_write, rw_mode)?;
        return Ok(Translation::Access(AtaAccess {
            tf,
            mode: rw_mode,
            is_write: rw.is_write,
            byte_count: rw.count as usize * SECTOR_SIZE,
        }));
    }

    match opcode {
        op::TEST_UNIT_READY => Ok(Translation::ok()),
        op::REQUEST_SENSE => {
            let sense = pending_sense.take().unwrap_or_else(SenseData::none);
            let mut buf = [0u8; 18];
            let n = sense.encode_fixed(&mut buf);
            Ok(Translation::Data(buf[..n].to_vec()))
        }
        op::INQUIRY => Ok(Translation::Data(inquiry_data(identify).to_vec())),
        op::READ_CAPACITY_10 => {
            let last = identify.sector_count.saturating_sub(1).min(u64::from(u32::MAX)) as u32;
            let mut buf = [0u8; 8];
            buf[..4].copy_from_slice(&last.to_be_bytes());
            buf[4..].copy_from_slice(&(SECTOR_SIZE as u32).to_be_bytes());
            Ok(Translation::Data(buf.to_vec()))
        }
        op::SYNCHRONIZE_CACHE_10 => Ok(Translation::non_data(if identify.lba48_supported {
            CMD_FLUSH_CACHE_EXT
        } else {
            CMD_FLUSH_CACHE
        })),
        op::START_STOP_UNIT => {
            let load_eject = cdb[4] & 0x02 != 0;
            let start = cdb[4] & 0x01 != 0;
            if load_eject && !start {
                if !identify.removable {
                    return Err(SenseData::new(
                        SenseKey::IllegalRequest,
                        asc::INVALID_FIELD_IN_CDB,
                    ));
                }
                return Ok(Translation::non_data(CMD_MEDIA_EJECT));
            }
            // Spin up/down is a no-op; the drive manages its own power.
            Ok(Translation::ok())
        }
        op::PREVENT_ALLOW_REMOVAL => Ok(Translation::ok()),
        _ => Err(SenseData::new(
            SenseKey::IllegalRequest,
            asc::INVALID_COMMAND_OPCODE,
        )),
    }
}

/// Standard INQUIRY data synthesized from identify fields.
pub fn inquiry_data(identify: &IdentifyData) -> [u8; 36] {
    let mut buf = [0u8; 36];
    buf[0] = 0x00; // direct-access block device
    buf[1] = if identify.removable { 0x80 } else { 0 };
    buf[2] = 0x02; // SCSI-2 level semantics
    buf[3] = 0x02; // response data format
    buf[4] = 31; // additional length
    if identify.queued_supported {
        buf[7] = 0x02; // CmdQue
    }
    fill_ascii(&mut buf[8..16], "ATA");
    fill_ascii(&mut buf[16..32], &identify.model);
    fill_ascii(&mut buf[32..36], &identify.firmware);
    buf
}

fn fill_ascii(out: &mut [u8], s: &str) {
    for (dst, src) in out.iter_mut().zip(s.bytes().chain(std::iter::repeat(b' '))) {
        *dst = if src.is_ascii_graphic() || src == b' ' {
            src
        } else {
            b' '
        };
    }
}

/// Decode the error register into sense data. Bits are checked strictly in
/// priority order; only the highest-priority condition is reported.
pub fn decode_error(error_reg: u8, is_write: bool) -> SenseData {
    if error_reg & ERROR_ICRC != 0 {
        SenseData::new(SenseKey::HardwareError, asc::IO_CRC_ERROR)
    } else if error_reg & ERROR_UNC_WP != 0 {
        if is_write {
            SenseData::new(SenseKey::DataProtect, asc::WRITE_PROTECTED)
        } else {
            SenseData::new(SenseKey::MediumError, asc::UNRECOVERED_READ_ERROR)
        }
    } else if error_reg & ERROR_MC != 0 {
        SenseData::new(SenseKey::UnitAttention, asc::MEDIUM_CHANGED)
    } else if error_reg & ERROR_IDNF != 0 {
        SenseData::new(SenseKey::MediumError, asc::RANDOM_POSITIONING_ERROR)
    } else if error_reg & ERROR_MCR != 0 {
        SenseData::new(SenseKey::UnitAttention, asc::OPERATOR_MEDIUM_REMOVAL_REQUEST)
    } else if error_reg & ERROR_NM != 0 {
        SenseData::new(SenseKey::NotReady, asc::MEDIUM_NOT_PRESENT)
    } else if error_reg & ERROR_ABRT != 0 {
        SenseData::new(SenseKey::AbortedCommand, asc::ABORTED_COMMAND)
    } else {
        // AMNF and anything else unclassified.
        SenseData::new(SenseKey::HardwareError, asc::INTERNAL_TARGET_FAILURE)
    }
}

/// CRC failures are transient link noise; the command is retried a few
/// times before the error is surfaced.
pub fn crc_retryable(sense: &SenseData) -> bool {
    sense.key == SenseKey::HardwareError && (sense.asc, sense.ascq) == asc::IO_CRC_ERROR
}

/// Direction implied by a CDB, used to sanity-check the request.
pub fn expected_direction(cdb: &[u8]) -> Option<DataDirection> {
    parse_rw(cdb).map(|rw| {
        if rw.is_write {
            DataDirection::Out
        } else {
            DataDirection::In
        }
    })
}
