//! Task-file register images, one variant per addressing mode.
//!
//! A task file is built fresh per command by the translators and written to
//! hardware by a single writer, so the mutually exclusive register layouts
//! are a sum type instead of overlapping unions.

use keel_xpt::{asc, SenseData, SenseKey};

use crate::hw::TfReg;
use crate::identify::ChsGeometry;
use crate::regs::*;

/// Register image plus opcode for one hardware command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFile {
    /// Cylinder/head/sector addressing for pre-LBA drives.
    Chs {
        command: u8,
        cylinder: u16,
        head: u8,
        sector: u8,
        count: u8,
    },
    Lba28 {
        command: u8,
        lba: u32,
        count: u8,
    },
    Lba48 {
        command: u8,
        lba: u64,
        count: u16,
    },
    /// Overlapped 28-bit DMA: the count rides in Features, the tag in the
    /// sector-count register.
    Lba28Queued {
        command: u8,
        lba: u32,
        count: u8,
        tag: u8,
    },
    Lba48Queued {
        command: u8,
        lba: u64,
        count: u16,
        tag: u8,
    },
    /// ATAPI PACKET: byte-count limit in the LBA mid/high pair.
    Packet {
        byte_count_limit: u16,
        dma: bool,
    },
    /// Non-data command with raw feature/count values (SET FEATURES, NOP,
    /// SERVICE, FLUSH, IDENTIFY...).
    NonData {
        command: u8,
        features: u8,
        count: u8,
    },
}

impl TaskFile {
    pub fn command(&self) -> u8 {
        match *self {
            TaskFile::Chs { command, .. }
            | TaskFile::Lba28 { command, .. }
            | TaskFile::Lba48 { command, .. }
            | TaskFile::Lba28Queued { command, .. }
            | TaskFile::Lba48Queued { command, .. }
            | TaskFile::NonData { command, .. } => command,
            TaskFile::Packet { .. } => CMD_PACKET,
        }
    }

    /// Device-register bits this layout needs OR-ed into the select byte.
    pub fn device_bits(&self) -> u8 {
        match *self {
            TaskFile::Chs { head, .. } => head & 0x0F,
            TaskFile::Lba28 { lba, .. } => DEVICE_LBA | ((lba >> 24) & 0x0F) as u8,
            TaskFile::Lba28Queued { lba, .. } => DEVICE_LBA | ((lba >> 24) & 0x0F) as u8,
            TaskFile::Lba48 { .. } | TaskFile::Lba48Queued { .. } => DEVICE_LBA,
            TaskFile::Packet { .. } | TaskFile::NonData { .. } => 0,
        }
    }

    /// Register writes in issue order, excluding the device select and the
    /// final command write. 48-bit layouts write each register twice
    /// (previous/high byte first, current/low byte second).
    pub fn register_writes(&self) -> Vec<(TfReg, u8)> {
        match *self {
            TaskFile::Chs {
                cylinder,
                sector,
                count,
                ..
            } => vec![
                (TfReg::Features, 0),
                (TfReg::SectorCount, count),
                (TfReg::LbaLow, sector),
                (TfReg::LbaMid, (cylinder & 0xFF) as u8),
                (TfReg::LbaHigh, (cylinder >> 8) as u8),
            ],
            TaskFile::Lba28 { lba, count, .. } => vec![
                (TfReg::Features, 0),
                (TfReg::SectorCount, count),
                (TfReg::LbaLow, (lba & 0xFF) as u8),
                (TfReg::LbaMid, ((lba >> 8) & 0xFF) as u8),
                (TfReg::LbaHigh, ((lba >> 16) & 0xFF) as u8),
            ],
            TaskFile::Lba48 { lba, count, .. } => vec![
                (TfReg::Features, 0),
                (TfReg::SectorCount, (count >> 8) as u8),
                (TfReg::SectorCount, (count & 0xFF) as u8),
                (TfReg::LbaLow, ((lba >> 24) & 0xFF) as u8),
                (TfReg::LbaLow, (lba & 0xFF) as u8),
                (TfReg::LbaMid, ((lba >> 32) & 0xFF) as u8),
                (TfReg::LbaMid, ((lba >> 8) & 0xFF) as u8),
                (TfReg::LbaHigh, ((lba >> 40) & 0xFF) as u8),
                (TfReg::LbaHigh, ((lba >> 16) & 0xFF) as u8),
            ],
            TaskFile::Lba28Queued {
                lba, count, tag, ..
            } => vec![
                (TfReg::Features, count),
                (TfReg::SectorCount, tag << 3),
                (TfReg::LbaLow, (lba & 0xFF) as u8),
                (TfReg::LbaMid, ((lba >> 8) & 0xFF) as u8),
                (TfReg::LbaHigh, ((lba >> 16) & 0xFF) as u8),
            ],
            TaskFile::Lba48Queued {
                lba, count, tag, ..
            } => vec![
                (TfReg::Features, (count >> 8) as u8),
                (TfReg::Features, (count & 0xFF) as u8),
                (TfReg::SectorCount, tag << 3),
                (TfReg::LbaLow, ((lba >> 24) & 0xFF) as u8),
                (TfReg::LbaLow, (lba & 0xFF) as u8),
                (TfReg::LbaMid, ((lba >> 32) & 0xFF) as u8),
                (TfReg::LbaMid, ((lba >> 8) & 0xFF) as u8),
                (TfReg::LbaHigh, ((lba >> 40) & 0xFF) as u8),
                (TfReg::LbaHigh, ((lba >> 16) & 0xFF) as u8),
            ],
            TaskFile::Packet {
                byte_count_limit,
                dma,
            } => vec![
                (TfReg::Features, u8::from(dma)),
                (TfReg::SectorCount, 0),
                (TfReg::LbaLow, 0),
                (TfReg::LbaMid, (byte_count_limit & 0xFF) as u8),
                (TfReg::LbaHigh, (byte_count_limit >> 8) as u8),
            ],
            TaskFile::NonData {
                features, count, ..
            } => vec![
                (TfReg::Features, features),
                (TfReg::SectorCount, count),
                (TfReg::LbaLow, 0),
                (TfReg::LbaMid, 0),
                (TfReg::LbaHigh, 0),
            ],
        }
    }
}

/// How the data phase of a read/write will be driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XferMode {
    Pio,
    Dma,
    DmaQueued { tag: u8 },
}

/// Device capabilities the constructor needs.
#[derive(Debug, Clone, Copy)]
pub struct RwCaps {
    pub lba_supported: bool,
    pub lba48_supported: bool,
    pub geometry: ChsGeometry,
}

/// Build the task file for a sector read or write.
///
/// 48-bit addressing is selected exactly when the run touches the 28-bit
/// boundary sector (`LBA28_MAX`) or the count exceeds 256; a run ending one
/// sector below stays 28-bit. Devices without LBA fall back to CHS; an
/// empty geometry is a medium-format error, never a divide fault.
pub fn rw_taskfile(
    caps: &RwCaps,
    lba: u64,
    count: u64,
    is_write: bool,
    mode: XferMode,
) -> Result<TaskFile, SenseData> {
    if count == 0 || count > 0x1_0000 {
        return Err(SenseData::new(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB));
    }

    let needs48 = lba + count > LBA28_MAX || count > 0x100;
    if needs48 && !caps.lba48_supported {
        return Err(SenseData::new(SenseKey::IllegalRequest, asc::LBA_OUT_OF_RANGE));
    }

    if !caps.lba_supported {
        return chs_taskfile(caps, lba, count, is_write, mode);
    }

    let tf = match (needs48, mode) {
        (false, XferMode::Pio) => TaskFile::Lba28 {
            command: if is_write { CMD_WRITE_SECTORS } else { CMD_READ_SECTORS },
            lba: lba as u32,
            count: (count & 0xFF) as u8, // 256 encodes as 0
        },
        (false, XferMode::Dma) => TaskFile::Lba28 {
            command: if is_write { CMD_WRITE_DMA } else { CMD_READ_DMA },
            lba: lba as u32,
            count: (count & 0xFF) as u8,
        },
        (false, XferMode::DmaQueued { tag }) => TaskFile::Lba28Queued {
            command: if is_write { CMD_WRITE_DMA_QUEUED } else { CMD_READ_DMA_QUEUED },
            lba: lba as u32,
            count: (count & 0xFF) as u8,
            tag,
        },
        (true, XferMode::Pio) => TaskFile::Lba48 {
            command: if is_write { CMD_WRITE_SECTORS_EXT } else { CMD_READ_SECTORS_EXT },
            lba,
            count: (count & 0xFFFF) as u16,
        },
        (true, XferMode::Dma) => TaskFile::Lba48 {
            command: if is_write { CMD_WRITE_DMA_EXT } else { CMD_READ_DMA_EXT },
            lba,
            count: (count & 0xFFFF) as u16,
        },
        (true, XferMode::DmaQueued { tag }) => TaskFile::Lba48Queued {
            command: if is_write {
                CMD_WRITE_DMA_QUEUED_EXT
            } else {
                CMD_READ_DMA_QUEUED_EXT
            },
            lba,
            count: (count & 0xFFFF) as u16,
            tag,
        },
    };
    Ok(tf)
}

fn chs_taskfile(
    caps: &RwCaps,
    lba: u64,
    count: u64,
    is_write: bool,
    mode: XferMode,
) -> Result<TaskFile, SenseData> {
    let per_cylinder =
        u64::from(caps.geometry.heads) * u64::from(caps.geometry.sectors_per_track);
    if per_cylinder == 0 {
        return Err(SenseData::new(
            SenseKey::MediumError,
            asc::MEDIUM_FORMAT_CORRUPTED,
        ));
    }
    if !matches!(mode, XferMode::Pio) || count > 0x100 {
        // CHS drives predate DMA-queued operation; the caller only asks for
        // PIO here.
        return Err(SenseData::new(SenseKey::IllegalRequest, asc::INVALID_FIELD_IN_CDB));
    }
    let cylinder = lba / per_cylinder;
    let head = (lba % per_cylinder) / u64::from(caps.geometry.sectors_per_track);
    let sector = (lba % u64::from(caps.geometry.sectors_per_track)) + 1;
    if cylinder > u64::from(u16::MAX) {
        return Err(SenseData::new(SenseKey::IllegalRequest, asc::LBA_OUT_OF_RANGE));
    }
    Ok(TaskFile::Chs {
        command: if is_write { CMD_WRITE_SECTORS } else { CMD_READ_SECTORS },
        cylinder: cylinder as u16,
        head: head as u8,
        sector: sector as u8,
        count: (count & 0xFF) as u8,
    })
}
