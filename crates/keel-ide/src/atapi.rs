//! SCSI command translation for ATAPI (packet) devices.
//!
//! ATAPI devices take SCSI CDBs nearly verbatim inside a 12-byte packet.
//! The exceptions are the 6-byte MODE SENSE/SELECT forms, which packet
//! devices do not implement: those are rewritten to their 10-byte
//! equivalents through a scratch buffer whose mode headers are re-packed
//! on the way back.

use keel_xpt::{asc, Ccb, DataDirection, SenseData, SenseKey};

use crate::ata::op;
use crate::regs::{ATAPI_PACKET_LEN, IREASON_COD, IREASON_IO, IREASON_REL, STATUS_DRQ};

/// One command ready for the PACKET protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketCmd {
    pub packet: [u8; ATAPI_PACKET_LEN],
    pub dma: bool,
    /// PIO byte-count limit programmed into the task file.
    pub byte_count_limit: u16,
    /// Set when the data phase runs through a rewritten 10-byte command and
    /// the result must be re-packed for the 6-byte caller.
    pub rewrite: Option<ModeRewrite>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeRewrite {
    Sense6To10,
    Select6To10,
}

/// Where the device says the exchange stands, decoded from the interrupt
/// reason register and status after each interrupt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketPhase {
    /// Device wants the 12 command bytes.
    AwaitPacket,
    /// Device offers data; the byte count registers say how much.
    DataIn,
    /// Device wants data.
    DataOut,
    /// Command finished; status has the verdict.
    Complete,
    /// Device released the bus and will interrupt again later.
    Release,
}

pub fn classify_phase(ireason: u8, status: u8) -> PacketPhase {
    if ireason & IREASON_REL != 0 {
        return PacketPhase::Release;
    }
    if status & STATUS_DRQ == 0 {
        return PacketPhase::Complete;
    }
    match (ireason & IREASON_COD != 0, ireason & IREASON_IO != 0) {
        (true, false) => PacketPhase::AwaitPacket,
        (false, true) => PacketPhase::DataIn,
        (false, false) => PacketPhase::DataOut,
        // COD+IO+DRQ is "message in", which ATAPI never uses; treat as done.
        (true, true) => PacketPhase::Complete,
    }
}

/// Build the packet for one SCSI request. CDBs longer than 12 bytes have
/// no packet encoding and are rejected host-side. The 6-to-10 mode
/// rewrite only applies to CD-class (`optical`) devices; other packet
/// devices take the 6-byte forms as-is.
pub fn build_packet(ccb: &Ccb, dma: bool, optical: bool) -> Result<PacketCmd, SenseData> {
    let cdb = ccb.cdb_bytes();
    if cdb.len() > ATAPI_PACKET_LEN {
        return Err(SenseData::new(
            SenseKey::IllegalRequest,
            asc::INVALID_COMMAND_OPCODE,
        ));
    }

    let mut packet = [0u8; ATAPI_PACKET_LEN];
    let rewrite = match cdb[0] {
        op::MODE_SENSE_6 if optical => {
            packet[0] = op::MODE_SENSE_10;
            packet[1] = cdb[1] & 0x08; // DBD
            packet[2] = cdb[2]; // page code + PC
            let len10 = u16::from(cdb[4]) + MODE_HEADER_GROWTH as u16;
            packet[7..9].copy_from_slice(&len10.to_be_bytes());
            packet[9] = cdb[5]; // control
            Some(ModeRewrite::Sense6To10)
        }
        op::MODE_SELECT_6 if optical => {
            packet[0] = op::MODE_SELECT_10;
            packet[1] = cdb[1] & 0x11; // PF + SP
            let len10 = u16::from(cdb[4]) + MODE_HEADER_GROWTH as u16;
            packet[7..9].copy_from_slice(&len10.to_be_bytes());
            packet[9] = cdb[5];
            Some(ModeRewrite::Select6To10)
        }
        _ => {
            packet[..cdb.len()].copy_from_slice(cdb);
            None
        }
    };

    let byte_count_limit = match ccb.direction {
        DataDirection::In | DataDirection::Out => {
            scratch_len(ccb, rewrite).min(0xFFFE).max(2) as u16
        }
        DataDirection::None => 0,
    };

    Ok(PacketCmd {
        packet,
        dma,
        byte_count_limit,
        rewrite,
    })
}

/// The 10-byte mode header is four bytes longer than the 6-byte one.
pub const MODE_HEADER_GROWTH: usize = 4;

/// Data-phase buffer length for the command as sent to the device.
pub fn scratch_len(ccb: &Ccb, rewrite: Option<ModeRewrite>) -> usize {
    match rewrite {
        Some(_) => ccb.data.len() + MODE_HEADER_GROWTH,
        None => ccb.data.len(),
    }
}

/// Expand a 6-byte MODE SELECT parameter list into the 10-byte layout the
/// device expects.
pub fn expand_mode_select(data6: &[u8]) -> Vec<u8> {
    let mut out = vec![0u8; data6.len() + MODE_HEADER_GROWTH];
    if data6.len() >= 4 {
        // 6-byte header: [mode data len, medium type, dev specific, bd len]
        // 10-byte header: [len hi, len lo, medium, dev spec, 0, 0, bd hi, bd lo]
        out[1] = data6[0];
        out[2] = data6[1];
        out[3] = data6[2];
        out[7] = data6[3];
        out[8..].copy_from_slice(&data6[4..]);
    }
    out
}

/// Re-pack a 10-byte MODE SENSE result into the caller's 6-byte layout.
/// Returns the bytes produced.
pub fn repack_mode_sense(dev10: &[u8], out6: &mut [u8]) -> usize {
    if dev10.len() < 8 {
        return 0;
    }
    let len10 = u16::from_be_bytes([dev10[0], dev10[1]]);
    // Mode data length excludes itself: 2 bytes in the 10-byte form, 1 in
    // the 6-byte form, and the header shrinks by 4.
    let len6 = (usize::from(len10) + 2)
        .saturating_sub(MODE_HEADER_GROWTH)
        .saturating_sub(1)
        .min(0xFF);
    let header6 = [len6 as u8, dev10[2], dev10[3], dev10[7]];
    let payload = &dev10[8..];
    let mut n = 0;
    for &b in header6.iter().chain(payload.iter()) {
        if n == out6.len() {
            break;
        }
        out6[n] = b;
        n += 1;
    }
    n
}

/// The internal autosense command issued after a CHECK CONDITION.
pub fn request_sense_packet(alloc_len: u8) -> [u8; ATAPI_PACKET_LEN] {
    let mut packet = [0u8; ATAPI_PACKET_LEN];
    packet[0] = op::REQUEST_SENSE;
    packet[4] = alloc_len;
    packet
}

/// The error register's high nibble is the sense key; usable before
/// autosense fills in the rest.
pub fn quick_sense_key(error_reg: u8) -> SenseKey {
    SenseKey::from_raw(error_reg >> 4)
}
