//! In-memory channel model: two drive bays behind the register interface,
//! with fault injection and observability hooks for the tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use keel_ide::{DmaError, DmaOutcome, DmaXfer, HwChannel, IdeBus, ManualClock, TfReg};
use keel_xpt::{AsyncEvent, Ccb, CcbRef, DataDirection, PathId, Xpt};

pub const SECTOR: usize = 512;
pub const CD_SECTOR: usize = 2048;

// Status bits, mirrored here so the model does not reach into the driver.
const BSY: u8 = 0x80;
const DRDY: u8 = 0x40;
const SERV: u8 = 0x10;
const DRQ: u8 = 0x08;
const REL: u8 = 0x04;
const ERR: u8 = 0x01;

const IREASON_COD: u8 = 0x01;
const IREASON_IO: u8 = 0x02;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedOp {
    pub tag: u8,
    pub lba: u64,
    pub count: u64,
    pub write: bool,
}

/// One modelled drive.
pub struct DriveModel {
    pub atapi: bool,
    pub slow_drq: bool,
    pub identify: [u8; 512],
    /// Backing store; sectors past the end read as a deterministic pattern.
    pub media: Vec<u8>,
    pub block: usize,

    // Fault injection.
    pub fail_dma: u32,
    pub inject_error: VecDeque<u8>,
    pub inject_check: VecDeque<(u8, u8, u8)>,
    pub hang_next: bool,
    pub release_queued: bool,
    pub bogus_service_tag: bool,
    pub refuse_nop: bool,
    /// Error register values reported at DMA completion instead of
    /// running the transfer.
    pub error_dma: VecDeque<u8>,

    // Observability.
    pub commands: Vec<u8>,
    pub packets: Vec<Vec<u8>>,
    pub dma_transfers: u32,
    /// Parameter bytes received by the last MODE SELECT.
    pub mode_select_data: Vec<u8>,

    sense: (u8, u8, u8),
    pub queued: Vec<QueuedOp>,
    /// Keeps SERV asserted while released commands remain queued, like a
    /// drive that wants the rest of its queue serviced.
    pub service_armed: bool,
}

impl DriveModel {
    pub fn ata(sectors: u64, dma: bool, lba48: bool, queue_depth: Option<u8>) -> Self {
        DriveModel {
            atapi: false,
            slow_drq: false,
            identify: ata_identify(sectors, dma, lba48, queue_depth),
            media: vec![0u8; (sectors.min(64) as usize) * SECTOR],
            block: SECTOR,
            fail_dma: 0,
            inject_error: VecDeque::new(),
            inject_check: VecDeque::new(),
            hang_next: false,
            release_queued: false,
            bogus_service_tag: false,
            refuse_nop: false,
            error_dma: VecDeque::new(),
            commands: Vec::new(),
            packets: Vec::new(),
            dma_transfers: 0,
            mode_select_data: Vec::new(),
            sense: (0, 0, 0),
            queued: Vec::new(),
            service_armed: false,
        }
    }

    pub fn atapi(slow_drq: bool, dma: bool) -> Self {
        DriveModel {
            atapi: true,
            slow_drq,
            identify: atapi_identify(slow_drq, dma),
            media: vec![0u8; 16 * CD_SECTOR],
            block: CD_SECTOR,
            fail_dma: 0,
            inject_error: VecDeque::new(),
            inject_check: VecDeque::new(),
            hang_next: false,
            release_queued: false,
            bogus_service_tag: false,
            refuse_nop: false,
            error_dma: VecDeque::new(),
            commands: Vec::new(),
            packets: Vec::new(),
            dma_transfers: 0,
            mode_select_data: Vec::new(),
            sense: (0, 0, 0),
            queued: Vec::new(),
            service_armed: false,
        }
    }

    fn read_sector(&self, lba: u64) -> Vec<u8> {
        let start = lba as usize * self.block;
        if start + self.block <= self.media.len() {
            self.media[start..start + self.block].to_vec()
        } else {
            sector_pattern(lba, self.block)
        }
    }

    fn write_sector(&mut self, lba: u64, data: &[u8]) {
        let start = lba as usize * self.block;
        if start + self.block <= self.media.len() {
            self.media[start..start + self.block].copy_from_slice(&data[..self.block]);
        }
    }
}

/// Pattern for sectors outside the backing store.
pub fn sector_pattern(lba: u64, block: usize) -> Vec<u8> {
    (0..block)
        .map(|i| (lba as u8).wrapping_add(i as u8).wrapping_mul(3))
        .collect()
}

fn set_word(raw: &mut [u8; 512], idx: usize, val: u16) {
    raw[idx * 2..idx * 2 + 2].copy_from_slice(&val.to_le_bytes());
}

fn set_string(raw: &mut [u8; 512], first_word: usize, word_count: usize, s: &str) {
    let mut bytes = s.as_bytes().to_vec();
    bytes.resize(word_count * 2, b' ');
    for i in 0..word_count {
        set_word(
            raw,
            first_word + i,
            u16::from(bytes[i * 2]) << 8 | u16::from(bytes[i * 2 + 1]),
        );
    }
}

pub fn ata_identify(sectors: u64, dma: bool, lba48: bool, queue_depth: Option<u8>) -> [u8; 512] {
    let mut raw = [0u8; 512];
    set_word(&mut raw, 0, 0x0040);
    set_word(&mut raw, 1, 100);
    set_word(&mut raw, 3, 4);
    set_word(&mut raw, 6, 16);
    set_string(&mut raw, 10, 10, "MD-0001");
    set_string(&mut raw, 23, 4, "1.0");
    set_string(&mut raw, 27, 20, "MODEL DISK");
    let mut caps = 0x0200; // LBA
    if dma {
        caps |= 0x0100;
    }
    set_word(&mut raw, 49, caps);
    let lba28 = sectors.min(0x0FFF_FFFF) as u32;
    set_word(&mut raw, 60, (lba28 & 0xFFFF) as u16);
    set_word(&mut raw, 61, (lba28 >> 16) as u16);
    let mut w83 = 0;
    if lba48 {
        w83 |= 0x0400;
        for i in 0..4 {
            set_word(&mut raw, 100 + i, ((sectors >> (16 * i)) & 0xFFFF) as u16);
        }
    }
    if let Some(depth) = queue_depth {
        w83 |= 0x0002;
        set_word(&mut raw, 75, u16::from(depth.saturating_sub(1)));
    }
    set_word(&mut raw, 83, w83);
    raw
}

pub fn atapi_identify(slow_drq: bool, dma: bool) -> [u8; 512] {
    let mut raw = [0u8; 512];
    let mut w0 = 0b10 << 14 | 0x05 << 8 | 0x80; // packet device, CD-class, removable
    if slow_drq {
        w0 |= 0b01 << 5;
    }
    set_word(&mut raw, 0, w0);
    set_string(&mut raw, 10, 10, "MC-0001");
    set_string(&mut raw, 23, 4, "1.0");
    set_string(&mut raw, 27, 20, "MODEL CDROM");
    if dma {
        set_word(&mut raw, 49, 0x0100);
    }
    raw
}

/// What happens once the device's outbound or inbound PIO buffer drains.
enum Phase {
    Idle,
    PioRead { lba: u64, left: u64 },
    PioWrite { lba: u64, left: u64 },
    AwaitPacket { dma: bool, bcl: u16 },
    PacketIn { data: VecDeque<u8>, bcl: u16 },
    PacketOut { expect: usize, got: Vec<u8> },
}

enum DmaOp {
    Rw { lba: u64, count: u64, write: bool },
    PacketIn { data: Vec<u8> },
}

pub struct MockState {
    pub drives: [Option<DriveModel>; 2],
    selected: usize,
    last: [u8; 6],
    prev: [u8; 6],
    status: u8,
    error: u8,
    // Read-side register images.
    count_out: u8,
    low_out: u8,
    mid_out: u8,
    high_out: u8,
    pio_in: VecDeque<u16>,
    pio_out: Vec<u16>,
    pio_out_expect: usize,
    phase: Phase,
    dma: Option<DmaXfer>,
    dma_err: bool,
    dma_op: Option<DmaOp>,
    pub intrq: bool,
    hung: bool,
}

// Writable register indices into last/prev.
const R_FEATURES: usize = 0;
const R_COUNT: usize = 1;
const R_LOW: usize = 2;
const R_MID: usize = 3;
const R_HIGH: usize = 4;
const R_DEVICE: usize = 5;

impl MockState {
    fn drive(&mut self) -> Option<&mut DriveModel> {
        self.drives[self.selected].as_mut()
    }

    /// Status as seen on the wire: an armed drive keeps SERV up for as
    /// long as released commands remain queued.
    fn status_out(&self) -> u8 {
        if self.status & BSY != 0 {
            return self.status;
        }
        let serv = self.drives[self.selected]
            .as_ref()
            .is_some_and(|d| d.service_armed && !d.queued.is_empty());
        if serv {
            self.status | SERV
        } else {
            self.status
        }
    }

    fn apply_signature(&mut self) {
        match &self.drives[self.selected] {
            Some(d) => {
                self.count_out = 0x01;
                self.low_out = 0x01;
                if d.atapi {
                    self.mid_out = 0x14;
                    self.high_out = 0xEB;
                } else {
                    self.mid_out = 0;
                    self.high_out = 0;
                }
                self.status = DRDY;
            }
            None => {
                self.count_out = 0;
                self.low_out = 0;
                self.mid_out = 0;
                self.high_out = 0;
                self.status = 0;
            }
        }
        self.error = 0;
    }

    fn lba28(&self) -> u64 {
        u64::from(self.last[R_DEVICE] & 0x0F) << 24
            | u64::from(self.last[R_HIGH]) << 16
            | u64::from(self.last[R_MID]) << 8
            | u64::from(self.last[R_LOW])
    }

    fn lba48(&self) -> u64 {
        u64::from(self.prev[R_HIGH]) << 40
            | u64::from(self.prev[R_MID]) << 32
            | u64::from(self.prev[R_LOW]) << 24
            | u64::from(self.last[R_HIGH]) << 16
            | u64::from(self.last[R_MID]) << 8
            | u64::from(self.last[R_LOW])
    }

    fn count28(&self) -> u64 {
        match self.last[R_COUNT] {
            0 => 256,
            n => u64::from(n),
        }
    }

    fn count48(&self) -> u64 {
        match u64::from(self.prev[R_COUNT]) << 8 | u64::from(self.last[R_COUNT]) {
            0 => 0x1_0000,
            n => n,
        }
    }

    fn load_sector_in(&mut self, lba: u64) {
        let data = match self.drive() {
            Some(d) => d.read_sector(lba),
            None => return,
        };
        self.pio_in = data
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
            .collect();
    }

    fn exec_command(&mut self, cmd: u8) {
        self.error = 0;
        let Some(drive) = self.drive() else {
            self.status = 0;
            return;
        };
        drive.commands.push(cmd);
        if drive.hang_next {
            drive.hang_next = false;
            self.hung = true;
            self.status = BSY;
            return;
        }
        if let Some(err) = drive.inject_error.pop_front() {
            self.status = DRDY | ERR;
            self.error = err;
            self.intrq = true;
            return;
        }

        match cmd {
            0xEC | 0xA1 => {
                let id = drive.identify;
                self.pio_in = id
                    .chunks(2)
                    .map(|c| u16::from_le_bytes([c[0], c[1]]))
                    .collect();
                self.phase = Phase::Idle;
                self.status = DRDY | DRQ;
                self.intrq = true;
            }
            0x20 | 0x24 => {
                let (lba, count) = if cmd == 0x24 {
                    (self.lba48(), self.count48())
                } else {
                    (self.lba28(), self.count28())
                };
                self.load_sector_in(lba);
                self.phase = Phase::PioRead {
                    lba: lba + 1,
                    left: count - 1,
                };
                self.status = DRDY | DRQ;
                self.intrq = true;
            }
            0x30 | 0x34 => {
                let (lba, count) = if cmd == 0x34 {
                    (self.lba48(), self.count48())
                } else {
                    (self.lba28(), self.count28())
                };
                self.phase = Phase::PioWrite { lba, left: count };
                self.pio_out.clear();
                self.pio_out_expect = SECTOR / 2;
                self.status = DRDY | DRQ;
            }
            0xC8 | 0x25 | 0xCA | 0x35 => {
                let write = cmd == 0xCA || cmd == 0x35;
                let (lba, count) = if cmd == 0x25 || cmd == 0x35 {
                    (self.lba48(), self.count48())
                } else {
                    (self.lba28(), self.count28())
                };
                self.dma_op = Some(DmaOp::Rw { lba, count, write });
                self.status = DRDY;
            }
            0xC7 | 0xCC | 0x26 | 0x36 => {
                let write = cmd == 0xCC || cmd == 0x36;
                let ext = cmd == 0x26 || cmd == 0x36;
                let tag = self.last[R_COUNT] >> 3;
                let (lba, count) = if ext {
                    (
                        self.lba48(),
                        match u64::from(self.prev[R_FEATURES]) << 8
                            | u64::from(self.last[R_FEATURES])
                        {
                            0 => 0x1_0000,
                            n => n,
                        },
                    )
                } else {
                    (
                        self.lba28(),
                        match self.last[R_FEATURES] {
                            0 => 256,
                            n => u64::from(n),
                        },
                    )
                };
                let op = QueuedOp {
                    tag,
                    lba,
                    count,
                    write,
                };
                let Some(drive) = self.drive() else { return };
                if drive.release_queued {
                    drive.queued.push(op);
                    self.status = DRDY | REL;
                } else {
                    self.dma_op = Some(DmaOp::Rw { lba, count, write });
                    self.status = DRDY;
                }
            }
            0xA2 => {
                let Some(drive) = self.drive() else { return };
                let bogus = drive.bogus_service_tag;
                match drive.queued.pop() {
                    Some(op) if !bogus => {
                        self.count_out = op.tag << 3;
                        self.dma_op = Some(DmaOp::Rw {
                            lba: op.lba,
                            count: op.count,
                            write: op.write,
                        });
                        self.status = DRDY;
                    }
                    _ => {
                        self.count_out = 0x1F << 3;
                        self.status = DRDY;
                    }
                }
            }
            0xE7 | 0xEA | 0xED => {
                self.status = DRDY;
                self.intrq = true;
            }
            0xEF => {
                self.status = DRDY;
            }
            0x00 => {
                let Some(drive) = self.drive() else { return };
                if drive.refuse_nop {
                    self.hung = true;
                    self.status = BSY;
                } else {
                    drive.queued.clear();
                    drive.service_armed = false;
                    self.status = DRDY;
                    self.error = 0x04; // NOP always aborts
                }
            }
            0xA0 => {
                let bcl = u16::from_le_bytes([self.last[R_MID], self.last[R_HIGH]]);
                let dma = self.last[R_FEATURES] & 0x01 != 0;
                let slow = self.drive().is_some_and(|d| d.slow_drq);
                self.phase = Phase::AwaitPacket { dma, bcl };
                self.pio_out.clear();
                self.pio_out_expect = 6;
                self.count_out = IREASON_COD;
                self.status = DRDY | DRQ;
                if slow {
                    self.intrq = true;
                }
            }
            _ => {
                self.status = DRDY | ERR;
                self.error = 0x04; // ABRT
                self.intrq = true;
            }
        }
    }

    fn packet_data_in(&mut self, data: Vec<u8>, bcl: u16) {
        self.phase = Phase::PacketIn {
            data: data.into(),
            bcl,
        };
        self.next_packet_chunk();
    }

    fn next_packet_chunk(&mut self) {
        let Phase::PacketIn { data, bcl } = &mut self.phase else {
            return;
        };
        if data.is_empty() {
            self.packet_complete(false);
            return;
        }
        // One sector per data-in phase at most, like a real packet device.
        let mut n = data.len().min(usize::from(*bcl).max(2)).min(CD_SECTOR);
        if n % 2 == 1 && n < data.len() {
            n -= 1;
        }
        let chunk: Vec<u8> = data.drain(..n).collect();
        self.pio_in = chunk
            .chunks(2)
            .map(|c| u16::from_le_bytes([c[0], c.get(1).copied().unwrap_or(0)]))
            .collect();
        self.count_out = IREASON_IO;
        self.mid_out = (n & 0xFF) as u8;
        self.high_out = (n >> 8) as u8;
        self.status = DRDY | DRQ;
        self.intrq = true;
    }

    fn packet_complete(&mut self, check: bool) {
        self.phase = Phase::Idle;
        self.count_out = IREASON_COD | IREASON_IO;
        self.status = if check { DRDY | ERR } else { DRDY };
        self.intrq = true;
    }

    fn exec_packet(&mut self, packet: Vec<u8>, dma: bool, bcl: u16) {
        let Some(drive) = self.drive() else { return };
        drive.packets.push(packet.clone());

        if let Some((key, asc, ascq)) = drive.inject_check.pop_front() {
            drive.sense = (key, asc, ascq);
            self.error = key << 4;
            self.packet_complete(true);
            return;
        }

        let opcode = packet[0];
        match opcode {
            // TEST UNIT READY, PREVENT/ALLOW, START STOP
            0x00 | 0x1E | 0x1B => self.packet_complete(false),
            0x12 => {
                let alloc = usize::from(packet[4]);
                let mut inq = vec![0u8; 36];
                inq[0] = 0x05; // CD-ROM
                inq[1] = 0x80;
                inq[2] = 0x02;
                inq[3] = 0x02;
                inq[4] = 31;
                inq[8..16].copy_from_slice(b"MOCKCD  ");
                inq[16..24].copy_from_slice(b"CD-ROM  ");
                inq.truncate(alloc.max(5).min(36));
                self.packet_data_in(inq, bcl);
            }
            0x03 => {
                let alloc = usize::from(packet[4]);
                let Some(drive) = self.drive() else { return };
                let (key, asc, ascq) = drive.sense;
                drive.sense = (0, 0, 0);
                let mut buf = vec![0u8; 18];
                buf[0] = 0x70;
                buf[2] = key;
                buf[7] = 10;
                buf[12] = asc;
                buf[13] = ascq;
                buf.truncate(alloc.min(18));
                self.packet_data_in(buf, bcl);
            }
            0x28 => {
                let lba = u64::from(u32::from_be_bytes([
                    packet[2], packet[3], packet[4], packet[5],
                ]));
                let count = u64::from(u16::from_be_bytes([packet[7], packet[8]]));
                let Some(drive) = self.drive() else { return };
                let mut data = Vec::new();
                for s in 0..count {
                    data.extend_from_slice(&drive.read_sector(lba + s));
                }
                if dma {
                    if let Some(d) = self.drive() {
                        d.dma_transfers += 1;
                    }
                    self.dma_op = Some(DmaOp::PacketIn { data });
                } else {
                    self.packet_data_in(data, bcl);
                }
            }
            0x5A => {
                // 8-byte header + a 12-byte page.
                let page = packet[2] & 0x3F;
                let mut data = vec![0u8; 8 + 12];
                let len10 = (data.len() - 2) as u16;
                data[..2].copy_from_slice(&len10.to_be_bytes());
                data[2] = 0x70; // medium type
                data[8] = page;
                data[9] = 10;
                for (i, b) in data.iter_mut().enumerate().skip(10) {
                    *b = i as u8;
                }
                self.packet_data_in(data, bcl);
            }
            0x55 => {
                let expect = usize::from(u16::from_be_bytes([packet[7], packet[8]]));
                self.phase = Phase::PacketOut {
                    expect,
                    got: Vec::new(),
                };
                self.pio_out.clear();
                self.pio_out_expect = expect.div_ceil(2);
                self.count_out = 0; // data out
                self.mid_out = (expect & 0xFF) as u8;
                self.high_out = (expect >> 8) as u8;
                self.status = DRDY | DRQ;
                self.intrq = true;
            }
            _ => {
                let Some(drive) = self.drive() else { return };
                drive.sense = (0x05, 0x20, 0x00); // illegal request
                self.error = 0x05 << 4;
                self.packet_complete(true);
            }
        }
    }

    fn after_pio_in_drained(&mut self) {
        match &mut self.phase {
            Phase::PioRead { lba, left } => {
                if *left > 0 {
                    let lba_now = *lba;
                    *lba += 1;
                    *left -= 1;
                    self.load_sector_in(lba_now);
                    self.status = DRDY | DRQ;
                    self.intrq = true;
                } else {
                    self.phase = Phase::Idle;
                    self.status = DRDY;
                }
            }
            Phase::PacketIn { .. } => self.next_packet_chunk(),
            _ => {
                self.status = DRDY;
            }
        }
    }

    fn on_pio_out_filled(&mut self) {
        let words: Vec<u16> = std::mem::take(&mut self.pio_out);
        let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        match &mut self.phase {
            Phase::AwaitPacket { dma, bcl } => {
                let (dma, bcl) = (*dma, *bcl);
                self.exec_packet(bytes[..12].to_vec(), dma, bcl);
            }
            Phase::PioWrite { lba, left } => {
                let lba_now = *lba;
                *lba += 1;
                *left -= 1;
                let done = *left == 0;
                if let Some(d) = self.drive() {
                    d.write_sector(lba_now, &bytes);
                }
                if done {
                    self.phase = Phase::Idle;
                    self.status = DRDY;
                } else {
                    self.pio_out_expect = SECTOR / 2;
                    self.status = DRDY | DRQ;
                }
                self.intrq = true;
            }
            Phase::PacketOut { got, expect } => {
                got.extend_from_slice(&bytes);
                if got.len() >= *expect {
                    let data = std::mem::take(got);
                    if let Some(d) = self.drive() {
                        d.mode_select_data = data;
                    }
                    self.packet_complete(false);
                }
            }
            _ => {}
        }
    }
}

/// The [`HwChannel`] half: shared handle over the model so tests can poke
/// at it while the bus manager owns the trait object.
pub struct MockHw {
    pub state: Rc<RefCell<MockState>>,
    pub clock: Rc<ManualClock>,
}

pub fn mock_channel(
    drive0: Option<DriveModel>,
    drive1: Option<DriveModel>,
) -> (MockHw, Rc<RefCell<MockState>>, Rc<ManualClock>) {
    let state = Rc::new(RefCell::new(MockState {
        drives: [drive0, drive1],
        selected: 0,
        last: [0; 6],
        prev: [0; 6],
        status: DRDY,
        error: 0,
        count_out: 0,
        low_out: 0,
        mid_out: 0,
        high_out: 0,
        pio_in: VecDeque::new(),
        pio_out: Vec::new(),
        pio_out_expect: 0,
        phase: Phase::Idle,
        dma: None,
        dma_err: false,
        dma_op: None,
        intrq: false,
        hung: false,
    }));
    let clock = Rc::new(ManualClock::new());
    (
        MockHw {
            state: state.clone(),
            clock: clock.clone(),
        },
        state,
        clock,
    )
}

impl MockState {
    /// Raise the service interrupt for released queued commands. SERV
    /// stays asserted until the drive's queue drains or is discarded.
    pub fn request_service(&mut self) {
        for d in self.drives.iter_mut().flatten() {
            if !d.queued.is_empty() {
                d.service_armed = true;
            }
        }
        self.intrq = true;
    }
}

/// A transport with one IDE bus on the channel model, scanned and ready.
pub struct Rig {
    pub xpt: Xpt,
    pub path: PathId,
    pub state: Rc<RefCell<MockState>>,
    pub clock: Rc<ManualClock>,
    pub events: Rc<RefCell<Vec<AsyncEvent>>>,
}

pub fn rig(drive0: Option<DriveModel>, drive1: Option<DriveModel>) -> Rig {
    let (hw, state, clock) = mock_channel(drive0, drive1);
    let mut xpt = Xpt::new();
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = events.clone();
    xpt.register_listener(Box::new(move |ev| sink.borrow_mut().push(ev.clone())));
    let bus_clock = clock.clone();
    let path = xpt
        .register_driver(move |q, p| Box::new(IdeBus::new(Box::new(hw), bus_clock, q, p)))
        .expect("path available");
    Rig {
        xpt,
        path,
        state,
        clock,
        events,
    }
}

impl Rig {
    pub fn drive(&self, idx: usize) -> std::cell::RefMut<'_, DriveModel> {
        std::cell::RefMut::map(self.state.borrow_mut(), |s| {
            s.drives[idx].as_mut().expect("drive present")
        })
    }

    /// Submit and pump to quiescence; most commands complete inside the
    /// submit call on this deterministic model.
    pub fn submit(&mut self, ccb: &CcbRef) {
        self.xpt.submit(self.path, ccb.clone()).expect("bus exists");
    }
}

pub fn scsi_ccb(target: u8, cdb: &[u8], data: Vec<u8>, direction: DataDirection) -> CcbRef {
    let mut ccb = Ccb::empty();
    ccb.target = target;
    ccb.set_cdb(cdb);
    ccb.data = data;
    ccb.direction = direction;
    Rc::new(RefCell::new(ccb))
}

pub fn read10(target: u8, lba: u32, count: u16) -> CcbRef {
    let l = lba.to_be_bytes();
    let c = count.to_be_bytes();
    scsi_ccb(
        target,
        &[0x28, 0, l[0], l[1], l[2], l[3], 0, c[0], c[1], 0],
        vec![0u8; usize::from(count) * SECTOR],
        DataDirection::In,
    )
}

pub fn write10(target: u8, lba: u32, data: Vec<u8>) -> CcbRef {
    let l = lba.to_be_bytes();
    let count = (data.len() / SECTOR) as u16;
    let c = count.to_be_bytes();
    scsi_ccb(
        target,
        &[0x2A, 0, l[0], l[1], l[2], l[3], 0, c[0], c[1], 0],
        data,
        DataDirection::Out,
    )
}

impl HwChannel for MockHw {
    fn read_reg(&mut self, reg: TfReg) -> u8 {
        let mut s = self.state.borrow_mut();
        match reg {
            TfReg::Features => s.error,
            TfReg::SectorCount => s.count_out,
            TfReg::LbaLow => s.low_out,
            TfReg::LbaMid => s.mid_out,
            TfReg::LbaHigh => s.high_out,
            TfReg::Device => s.last[R_DEVICE],
            TfReg::Command => {
                s.intrq = false;
                s.status_out()
            }
        }
    }

    fn write_reg(&mut self, reg: TfReg, val: u8) {
        let mut s = self.state.borrow_mut();
        let idx = match reg {
            TfReg::Features => R_FEATURES,
            TfReg::SectorCount => R_COUNT,
            TfReg::LbaLow => R_LOW,
            TfReg::LbaMid => R_MID,
            TfReg::LbaHigh => R_HIGH,
            TfReg::Device => R_DEVICE,
            TfReg::Command => {
                s.exec_command(val);
                return;
            }
        };
        s.prev[idx] = s.last[idx];
        s.last[idx] = val;
        if idx == R_DEVICE {
            let newly = usize::from(val >> 4 & 1);
            if newly != s.selected {
                s.selected = newly;
                s.apply_signature();
            }
        }
    }

    fn alt_status(&mut self) -> u8 {
        // Every poll costs a little virtual time so bounded waits make
        // progress against the clock.
        self.clock.advance(1);
        self.state.borrow().status_out()
    }

    fn write_device_control(&mut self, val: u8) {
        if val & 0x04 != 0 {
            // SRST
            let mut s = self.state.borrow_mut();
            s.hung = false;
            s.phase = Phase::Idle;
            s.pio_in.clear();
            s.pio_out.clear();
            s.dma = None;
            s.dma_op = None;
            s.dma_err = false;
            s.intrq = false;
            s.selected = 0;
            for d in s.drives.iter_mut().flatten() {
                d.queued.clear();
                d.service_armed = false;
            }
            s.apply_signature();
        }
    }

    fn read_pio(&mut self, words: &mut [u16]) {
        let mut s = self.state.borrow_mut();
        for w in words.iter_mut() {
            *w = s.pio_in.pop_front().unwrap_or(0);
        }
        if s.pio_in.is_empty() {
            s.after_pio_in_drained();
        }
    }

    fn write_pio(&mut self, words: &[u16]) {
        let mut s = self.state.borrow_mut();
        s.pio_out.extend_from_slice(words);
        if s.pio_out.len() >= s.pio_out_expect && s.pio_out_expect > 0 {
            s.pio_out_expect = 0;
            s.on_pio_out_filled();
        }
    }

    fn prepare_dma(&mut self, xfer: DmaXfer) -> Result<(), DmaError> {
        self.state.borrow_mut().dma = Some(xfer);
        Ok(())
    }

    fn start_dma(&mut self) {
        let mut s = self.state.borrow_mut();
        if s.hung {
            return;
        }
        if let Some(d) = s.drive() {
            if d.fail_dma > 0 {
                d.fail_dma -= 1;
                s.dma_err = true;
                s.dma_op = None;
                s.status = DRDY;
                s.intrq = true;
                return;
            }
        }
        if let Some(err) = s.drive().and_then(|d| d.error_dma.pop_front()) {
            // Device-side failure: the command ends with ERR set and the
            // error register filled, the engine itself is clean.
            s.dma_op = None;
            s.error = err;
            s.status = DRDY | ERR;
            s.intrq = true;
            return;
        }
        let Some(op) = s.dma_op.take() else {
            // The device already errored out of the command; the engine
            // just idles.
            if s.status & ERR == 0 {
                s.status = DRDY;
                s.intrq = true;
            }
            return;
        };
        let Some(mut xfer) = s.dma.take() else { return };
        match op {
            DmaOp::Rw { lba, count, write } => {
                let block = SECTOR;
                let mut flat: Vec<u8> = Vec::new();
                if write {
                    // Gather the buffer through the scatter list, then
                    // commit whole sectors.
                    for e in &xfer.sg_list {
                        flat.extend_from_slice(&xfer.buffer[e.base..e.base + e.len]);
                    }
                    if let Some(d) = s.drive() {
                        for i in 0..count as usize {
                            if (i + 1) * block <= flat.len() {
                                let sector = flat[i * block..(i + 1) * block].to_vec();
                                d.write_sector(lba + i as u64, &sector);
                            }
                        }
                        d.dma_transfers += 1;
                    }
                } else {
                    if let Some(d) = s.drive() {
                        for i in 0..count {
                            flat.extend_from_slice(&d.read_sector(lba + i));
                        }
                        d.dma_transfers += 1;
                    }
                    let mut off = 0;
                    for e in &xfer.sg_list {
                        let n = e.len.min(flat.len().saturating_sub(off));
                        xfer.buffer[e.base..e.base + n].copy_from_slice(&flat[off..off + n]);
                        off += n;
                    }
                }
                s.status = DRDY;
            }
            DmaOp::PacketIn { data } => {
                let mut off = 0;
                for e in &xfer.sg_list {
                    let n = e.len.min(data.len().saturating_sub(off));
                    xfer.buffer[e.base..e.base + n].copy_from_slice(&data[off..off + n]);
                    off += n;
                }
                s.count_out = IREASON_COD | IREASON_IO;
                s.status = DRDY;
            }
        }
        s.dma = Some(xfer);
        s.intrq = true;
    }

    fn finish_dma(&mut self) -> DmaOutcome {
        let mut s = self.state.borrow_mut();
        let xfer = s.dma.take().unwrap_or(DmaXfer {
            buffer: Vec::new(),
            sg_list: Vec::new(),
            is_write: false,
        });
        let error = if s.dma_err {
            Some(DmaError::Transfer)
        } else {
            None
        };
        s.dma_err = false;
        DmaOutcome { xfer, error }
    }

    fn intrq(&mut self) -> bool {
        let s = self.state.borrow();
        !s.hung && s.intrq
    }
}
