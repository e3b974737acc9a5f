//! IDENTIFY DEVICE / IDENTIFY PACKET DEVICE data extraction.

use crate::regs::MAX_QUEUE_DEPTH;

/// Drive geometry for pre-LBA devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChsGeometry {
    pub cylinders: u16,
    pub heads: u16,
    pub sectors_per_track: u16,
}

impl ChsGeometry {
    /// Sectors addressable through this geometry; zero for an empty
    /// (corrupt) geometry.
    pub fn capacity(&self) -> u64 {
        u64::from(self.cylinders) * u64::from(self.heads) * u64::from(self.sectors_per_track)
    }
}

/// The capability subset of identify data this driver acts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyData {
    pub is_atapi: bool,
    /// SCSI peripheral device type from word 0; zero for ATA drives.
    pub atapi_type: u8,
    /// ATAPI device asserts INTRQ before accepting the command packet.
    pub slow_drq: bool,
    pub removable: bool,

    pub lba_supported: bool,
    pub lba48_supported: bool,
    pub dma_supported: bool,
    /// READ/WRITE DMA QUEUED feature set.
    pub queued_supported: bool,
    /// Negotiable overlapped queue depth (1 = no overlap).
    pub queue_depth: u8,

    pub geometry: ChsGeometry,
    /// Total addressable sectors (LBA28 or LBA48 field as appropriate).
    pub sector_count: u64,

    pub model: String,
    pub serial: String,
    pub firmware: String,
}

fn word(raw: &[u8; 512], idx: usize) -> u16 {
    u16::from_le_bytes([raw[idx * 2], raw[idx * 2 + 1]])
}

/// ATA strings are stored with the bytes of each word swapped.
fn ata_string(raw: &[u8; 512], first_word: usize, word_count: usize) -> String {
    let mut out = Vec::with_capacity(word_count * 2);
    for w in first_word..first_word + word_count {
        let v = word(raw, w);
        out.push((v >> 8) as u8);
        out.push((v & 0xFF) as u8);
    }
    String::from_utf8_lossy(&out).trim().to_string()
}

impl IdentifyData {
    pub fn parse(raw: &[u8; 512]) -> Self {
        let w0 = word(raw, 0);
        let is_atapi = (w0 >> 14) == 0b10;
        let atapi_type = if is_atapi { ((w0 >> 8) & 0x1F) as u8 } else { 0 };
        let slow_drq = is_atapi && ((w0 >> 5) & 0x03) == 0b01;
        let removable = (w0 & 0x80) != 0;

        let caps = word(raw, 49);
        let lba_supported = (caps & 0x0200) != 0;
        let dma_supported = (caps & 0x0100) != 0;
        let w83 = word(raw, 83);
        let lba48_supported = (w83 & 0x0400) != 0;
        let queued_supported = (w83 & 0x0002) != 0;
        let queue_depth = ((word(raw, 75) & 0x1F) + 1).min(MAX_QUEUE_DEPTH as u16) as u8;

        let geometry = ChsGeometry {
            cylinders: word(raw, 1),
            heads: word(raw, 3),
            sectors_per_track: word(raw, 6),
        };

        let lba28_sectors =
            u64::from(word(raw, 60)) | (u64::from(word(raw, 61)) << 16);
        let lba48_sectors = u64::from(word(raw, 100))
            | (u64::from(word(raw, 101)) << 16)
            | (u64::from(word(raw, 102)) << 32)
            | (u64::from(word(raw, 103)) << 48);
        let sector_count = if lba48_supported && lba48_sectors != 0 {
            lba48_sectors
        } else if lba_supported {
            lba28_sectors
        } else {
            geometry.capacity()
        };

        IdentifyData {
            is_atapi,
            atapi_type,
            slow_drq,
            removable,
            lba_supported,
            lba48_supported,
            dma_supported,
            queued_supported,
            queue_depth,
            geometry,
            sector_count,
            model: ata_string(raw, 27, 20),
            serial: ata_string(raw, 10, 10),
            firmware: ata_string(raw, 23, 4),
        }
    }
}
