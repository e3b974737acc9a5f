//! ATA-3 / ATAPI register bits and command opcodes.

// Status register.
pub const STATUS_BSY: u8 = 0x80;
pub const STATUS_DRDY: u8 = 0x40;
pub const STATUS_DF: u8 = 0x20;
/// SERV in the overlapped feature set (DSC historically).
pub const STATUS_SERV: u8 = 0x10;
pub const STATUS_DRQ: u8 = 0x08;
/// REL in the overlapped feature set: the device released the bus.
pub const STATUS_REL: u8 = 0x04;
pub const STATUS_ERR: u8 = 0x01;

// Error register.
pub const ERROR_ICRC: u8 = 0x80;
/// UNC on reads, write-protect on writes.
pub const ERROR_UNC_WP: u8 = 0x40;
pub const ERROR_MC: u8 = 0x20;
pub const ERROR_IDNF: u8 = 0x10;
pub const ERROR_MCR: u8 = 0x08;
pub const ERROR_ABRT: u8 = 0x04;
pub const ERROR_NM: u8 = 0x02;
pub const ERROR_AMNF: u8 = 0x01;

// Device Control register.
pub const CTRL_NIEN: u8 = 0x02;
pub const CTRL_SRST: u8 = 0x04;

// Device register.
pub const DEVICE_OBSOLETE_BITS: u8 = 0xA0;
pub const DEVICE_LBA: u8 = 0x40;
pub const DEVICE_SLAVE: u8 = 0x10;

// ATAPI interrupt reason (sector-count register during PACKET protocol).
pub const IREASON_COD: u8 = 0x01;
pub const IREASON_IO: u8 = 0x02;
pub const IREASON_REL: u8 = 0x04;

// Command opcodes.
pub const CMD_NOP: u8 = 0x00;
/// NOP feature value: discard the outstanding command queue.
pub const NOP_DISCARD_QUEUE: u8 = 0x01;
pub const CMD_READ_SECTORS: u8 = 0x20;
pub const CMD_READ_SECTORS_EXT: u8 = 0x24;
pub const CMD_READ_DMA_EXT: u8 = 0x25;
pub const CMD_READ_DMA_QUEUED_EXT: u8 = 0x26;
pub const CMD_WRITE_SECTORS: u8 = 0x30;
pub const CMD_WRITE_SECTORS_EXT: u8 = 0x34;
pub const CMD_WRITE_DMA_EXT: u8 = 0x35;
pub const CMD_WRITE_DMA_QUEUED_EXT: u8 = 0x36;
pub const CMD_PACKET: u8 = 0xA0;
pub const CMD_IDENTIFY_PACKET_DEVICE: u8 = 0xA1;
pub const CMD_SERVICE: u8 = 0xA2;
pub const CMD_READ_DMA_QUEUED: u8 = 0xC7;
pub const CMD_READ_DMA: u8 = 0xC8;
pub const CMD_WRITE_DMA: u8 = 0xCA;
pub const CMD_WRITE_DMA_QUEUED: u8 = 0xCC;
pub const CMD_MEDIA_EJECT: u8 = 0xED;
pub const CMD_FLUSH_CACHE: u8 = 0xE7;
pub const CMD_FLUSH_CACHE_EXT: u8 = 0xEA;
pub const CMD_IDENTIFY_DEVICE: u8 = 0xEC;
pub const CMD_SET_FEATURES: u8 = 0xEF;

// SET FEATURES subcommands.
pub const SF_ENABLE_WRITE_CACHE: u8 = 0x02;
pub const SF_SET_TRANSFER_MODE: u8 = 0x03;
pub const SF_DISABLE_WRITE_CACHE: u8 = 0x82;
pub const SF_ENABLE_RELEASE_IRQ: u8 = 0x5D;
pub const SF_DISABLE_RELEASE_IRQ: u8 = 0xDD;

// Post-reset signature in the LBA mid/high registers.
pub const SIG_ATAPI_MID: u8 = 0x14;
pub const SIG_ATAPI_HIGH: u8 = 0xEB;

pub const SECTOR_SIZE: usize = 512;
pub const ATAPI_PACKET_LEN: usize = 12;
/// SCSI peripheral device type for CD/DVD devices (identify word 0).
pub const ATAPI_TYPE_CDROM: u8 = 0x05;

/// Largest LBA addressable with 28-bit commands.
pub const LBA28_MAX: u64 = 0x0FFF_FFFF;

/// ATA-mandated maximum spin-up time after a reset, in milliseconds.
pub const RESET_SPINUP_MS: u64 = 31_000;

/// Hardware tag limit of the overlapped feature set.
pub const MAX_QUEUE_DEPTH: usize = 32;
