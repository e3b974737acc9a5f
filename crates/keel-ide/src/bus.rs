//! The IDE bus manager: owns one channel and up to two drives, accepts
//! dispatched commands from the transport, and runs each access as a
//! deterministic state machine advanced by interrupts, timeouts, and
//! deferred work drained in [`SimDriver::pump`].

use std::rc::Rc;

use keel_xpt::{
    asc, AsyncEvent, Ccb, CcbFunction, CcbRef, CcbStatus, DataDirection, PathId, SenseData,
    SenseKey, SimDriver, SimEvent, SimEventQueue,
};
use tracing::{debug, info, warn};

use crate::ata::{self, Translation, MAX_CRC_RETRIES};
use crate::atapi::{self, ModeRewrite, PacketCmd, PacketPhase};
use crate::channel::{BusState, Channel, Dpc, DriveKind};
use crate::dma::{self, DmaPolicy};
use crate::hw::{Clock, HwChannel, TfReg};
use crate::identify::IdentifyData;
use crate::pio::PioCursor;
use crate::queuing::{service_tag, QueueState};
use crate::regs::*;
use crate::taskfile::{TaskFile, XferMode};

/// Sync-wait bound for register handshakes that never involve media
/// access.
const REGISTER_WAIT_MS: u64 = 1_000;
/// Sync-wait bound for identify data, which may spin the media up.
const IDENTIFY_WAIT_MS: u64 = 10_000;
/// Timeout for the internal autosense command.
const AUTOSENSE_TIMEOUT_MS: u64 = 5_000;

struct Drive {
    kind: DriveKind,
    identify: IdentifyData,
    dma: DmaPolicy,
    queue: QueueState,
    /// Sense latched by the last failed command, reported by the next
    /// REQUEST SENSE (ATA drives have no hardware sense to ask for).
    pending_sense: Option<SenseData>,
}

/// A bus-level operation that needs the channel idle; scheduled while an
/// access is in flight, it parks until [`IdeBus::access_finished`] drains
/// it.
enum SyncedCall {
    AbortQueue { target: u8 },
}

/// Data-phase shape of the access that currently owns the channel.
enum AccessKind {
    NonData,
    PioIn { remaining: usize },
    PioOut { remaining: usize },
    Dma { queued_tag: Option<u8> },
    Packet { cmd: PacketCmd, sent: bool, autosense: bool },
}

/// The one in-flight access.
struct Active {
    ccb: CcbRef,
    drive: u8,
    kind: AccessKind,
    cursor: PioCursor,
    sg: Vec<keel_xpt::SgEntry>,
    byte_count: usize,
    bytes_done: usize,
    is_write: bool,
    crc_retries: u8,
    /// Side buffer for mode-rewrite data phases and autosense responses.
    scratch: Option<Vec<u8>>,
    scratch_pos: usize,
}

pub struct IdeBus {
    chan: Channel,
    sim_q: SimEventQueue,
    path_id: PathId,
    drives: [Option<Drive>; 2],
    active: Option<Active>,
    /// Commands dispatched while the channel was busy with a serviced
    /// overlapped access; drained from the pump.
    pending: std::collections::VecDeque<CcbRef>,
    /// Deferred bus-level calls, run once the channel goes idle.
    synced: std::collections::VecDeque<SyncedCall>,
}

impl IdeBus {
    /// Bring the channel up: reset, probe drive signatures, pull identify
    /// data, and negotiate queueing. Absent or unresponsive drives simply
    /// stay unattached.
    pub fn new(
        hw: Box<dyn HwChannel>,
        clock: Rc<dyn Clock>,
        sim_q: SimEventQueue,
        path_id: PathId,
    ) -> Self {
        let mut chan = Channel::new(hw, clock);
        let mut drives = [None, None];
        match chan.soft_reset() {
            Ok(()) => {
                for (idx, slot) in drives.iter_mut().enumerate() {
                    *slot = Self::attach(&mut chan, idx as u8);
                }
            }
            Err(e) => warn!(path = path_id.0, error = %e, "channel reset failed at init"),
        }
        IdeBus {
            chan,
            sim_q,
            path_id,
            drives,
            active: None,
            pending: std::collections::VecDeque::new(),
            synced: std::collections::VecDeque::new(),
        }
    }

    fn attach(chan: &mut Channel, drive: u8) -> Option<Drive> {
        let kind = chan.probe_signature(drive)?;
        let command = match kind {
            DriveKind::Ata => CMD_IDENTIFY_DEVICE,
            DriveKind::Atapi => CMD_IDENTIFY_PACKET_DEVICE,
        };
        chan.issue(&TaskFile::NonData {
            command,
            features: 0,
            count: 0,
        });
        // Identify interrupts when its data is ready; take it in-line, the
        // DPC machinery is not running yet.
        let status = chan.wait_interrupt(IDENTIFY_WAIT_MS).ok()?;
        if status & STATUS_ERR != 0 || status & STATUS_DRQ == 0 {
            return None;
        }
        let mut words = [0u16; 256];
        chan.hw.read_pio(&mut words);
        let mut raw = [0u8; 512];
        for (i, w) in words.iter().enumerate() {
            raw[i * 2..i * 2 + 2].copy_from_slice(&w.to_le_bytes());
        }
        let identify = IdentifyData::parse(&raw);

        let depth = if identify.queued_supported && kind == DriveKind::Ata {
            usize::from(identify.queue_depth)
        } else {
            1
        };
        let mut queue = QueueState::new(depth);
        if queue.enabled() {
            chan.issue(&TaskFile::NonData {
                command: CMD_SET_FEATURES,
                features: SF_ENABLE_RELEASE_IRQ,
                count: 0,
            });
            let negotiated = matches!(
                chan.wait_not_busy(REGISTER_WAIT_MS),
                Ok(s) if s & STATUS_ERR == 0
            );
            if !negotiated {
                debug!(drive, "release interrupt negotiation refused");
                queue = QueueState::new(1);
            }
        }

        info!(
            drive,
            kind = ?kind,
            model = %identify.model,
            queued = queue.enabled(),
            "attached drive"
        );
        Some(Drive {
            kind,
            identify,
            dma: DmaPolicy::default(),
            queue,
            pending_sense: None,
        })
    }

    fn finish(&mut self, ccb: CcbRef, status: CcbStatus, sense: Option<SenseData>) {
        {
            let mut c = ccb.borrow_mut();
            c.status = status;
            c.sense = sense;
        }
        self.sim_q.done(ccb);
    }

    /// Finish the active access and free the channel via
    /// [`Self::access_finished`].
    fn finish_active(&mut self, active: Active, status: CcbStatus, sense: Option<SenseData>) {
        if let AccessKind::Dma {
            queued_tag: Some(tag),
        } = active.kind
        {
            if let Some(drive) = self.drives[usize::from(active.drive)].as_mut() {
                drive.queue.slots.take(tag);
            }
        }
        let drive = active.drive;
        self.finish(active.ccb, status, sense);
        self.access_finished(drive);
    }

    /// The single exit point from a finished access. The just-used drive
    /// gets first claim on the channel: if it is requesting overlapped
    /// service, that service starts before the channel returns to general
    /// dispatch. Otherwise deferred synced calls run, then the channel is
    /// idle.
    fn access_finished(&mut self, drive: u8) {
        self.chan.set_idle();
        let has_released = self.drives[usize::from(drive)]
            .as_ref()
            .is_some_and(|d| !d.queue.slots.is_empty());
        if has_released {
            self.chan.select(drive, 0);
            if self.chan.hw.alt_status() & STATUS_SERV != 0 {
                self.try_service_from(drive);
                if self.active.is_some() {
                    return;
                }
            }
        }
        while self.active.is_none() && self.chan.state() == BusState::Idle {
            let Some(call) = self.synced.pop_front() else {
                break;
            };
            self.run_synced(call);
        }
    }

    /// Run `call` now if the channel is free, otherwise park it for
    /// [`Self::access_finished`].
    fn schedule_synced(&mut self, call: SyncedCall) {
        if self.active.is_none() && self.chan.state() == BusState::Idle {
            self.run_synced(call);
        } else {
            self.synced.push_back(call);
        }
    }

    fn run_synced(&mut self, call: SyncedCall) {
        match call {
            SyncedCall::AbortQueue { target } => self.handle_queue_failure(target),
        }
    }

    // ---- dispatch ----

    fn start_io(&mut self, ccb: CcbRef) {
        let target = ccb.borrow().target;
        let kind = match self.drives.get(usize::from(target)).and_then(Option::as_ref) {
            Some(d) => d.kind,
            None => return self.finish(ccb, CcbStatus::DeviceNotThere, None),
        };
        match kind {
            DriveKind::Ata => self.start_ata(ccb, target),
            DriveKind::Atapi => self.start_atapi(ccb, target),
        }
    }

    fn start_ata(&mut self, ccb: CcbRef, target: u8) {
        let idx = usize::from(target);
        let mode = {
            let drive = match self.drives[idx].as_mut() {
                Some(d) => d,
                None => return self.finish(ccb, CcbStatus::DeviceNotThere, None),
            };
            let c = ccb.borrow();
            let is_rw = ata::parse_rw(c.cdb_bytes()).is_some();
            let dma_ok = is_rw && drive.dma.allows(drive.identify.dma_supported);
            if dma_ok && c.hw_tagged && drive.queue.enabled() && drive.queue.slots.has_free() {
                drop(c);
                match self.drives[idx]
                    .as_mut()
                    .and_then(|d| d.queue.slots.alloc(ccb.clone()))
                {
                    Some(tag) => XferMode::DmaQueued { tag },
                    None => XferMode::Dma,
                }
            } else if dma_ok {
                XferMode::Dma
            } else {
                XferMode::Pio
            }
        };
        self.run_ata_translation(ccb, target, mode, 0);
    }

    /// Translate and (if needed) issue; `crc_retries` carries across CRC
    /// reissues of the same request.
    fn run_ata_translation(&mut self, ccb: CcbRef, target: u8, mode: XferMode, crc_retries: u8) {
        let idx = usize::from(target);
        let translation = {
            let drive = match self.drives[idx].as_mut() {
                Some(d) => d,
                None => return self.finish(ccb, CcbStatus::DeviceNotThere, None),
            };
            let c = ccb.borrow();
            ata::translate(&drive.identify, &mut drive.pending_sense, &c, mode)
        };
        match translation {
            Err(sense) => {
                self.free_tag(target, mode);
                if let Some(drive) = self.drives[idx].as_mut() {
                    drive.pending_sense = Some(sense);
                }
                self.finish(ccb, CcbStatus::CheckCondition, Some(sense));
            }
            Ok(Translation::Complete { status, sense }) => {
                self.free_tag(target, mode);
                self.finish(ccb, status, sense);
            }
            Ok(Translation::Data(data)) => {
                self.free_tag(target, mode);
                let copied = copy_to_buffer(&mut ccb.borrow_mut(), &data);
                ccb.borrow_mut().residual = data.len().saturating_sub(copied);
                self.finish(ccb, CcbStatus::Ok, None);
            }
            Ok(Translation::Access(access)) => {
                self.issue_ata(ccb, target, access, mode, crc_retries)
            }
        }
    }

    fn free_tag(&mut self, target: u8, mode: XferMode) {
        if let XferMode::DmaQueued { tag } = mode {
            if let Some(drive) = self.drives[usize::from(target)].as_mut() {
                drive.queue.slots.take(tag);
            }
        }
    }

    fn issue_ata(
        &mut self,
        ccb: CcbRef,
        target: u8,
        access: ata::AtaAccess,
        mode: XferMode,
        crc_retries: u8,
    ) {
        self.chan.select(target, access.tf.device_bits());
        if self.chan.wait_not_busy(REGISTER_WAIT_MS).is_err() {
            self.free_tag(target, mode);
            return self.finish(ccb, CcbStatus::Timeout, None);
        }
        self.chan.issue(&access.tf);

        let timeout_ms = ccb.borrow().timeout_ms;
        let sg = dma::effective_sg(&ccb.borrow());
        let mut active = Active {
            ccb,
            drive: target,
            kind: AccessKind::NonData,
            cursor: PioCursor::new(),
            sg,
            byte_count: access.byte_count,
            bytes_done: 0,
            is_write: access.is_write,
            crc_retries,
            scratch: None,
            scratch_pos: 0,
        };

        match access.mode {
            XferMode::Pio if access.byte_count == 0 => {
                active.kind = AccessKind::NonData;
            }
            XferMode::Pio if access.is_write => {
                // The first DRQ of a PIO write is polled, not signalled.
                if self.chan.wait_drq(REGISTER_WAIT_MS).is_err() {
                    self.free_tag(target, mode);
                    return self.finish(active.ccb, CcbStatus::Timeout, None);
                }
                let guard = active.ccb.clone();
                let c = guard.borrow();
                active.cursor.write_block(
                    self.chan.hw.as_mut(),
                    &c.data,
                    &active.sg,
                    SECTOR_SIZE,
                );
                drop(c);
                active.bytes_done = SECTOR_SIZE.min(access.byte_count);
                active.kind = AccessKind::PioOut {
                    remaining: access.byte_count.saturating_sub(SECTOR_SIZE),
                };
            }
            XferMode::Pio => {
                active.kind = AccessKind::PioIn {
                    remaining: access.byte_count,
                };
            }
            XferMode::Dma => {
                let begun = {
                    let mut c = active.ccb.borrow_mut();
                    dma::begin(self.chan.hw.as_mut(), &mut c)
                };
                if let Err(e) = begun {
                    warn!(error = %e, "DMA setup failed");
                    return self.dma_fallback(active.ccb, target, crc_retries);
                }
                active.kind = AccessKind::Dma { queued_tag: None };
            }
            XferMode::DmaQueued { tag } => {
                // The drive either releases the bus or starts the transfer
                // right away.
                if self.chan.wait_not_busy(REGISTER_WAIT_MS).is_err() {
                    self.free_tag(target, mode);
                    return self.finish(active.ccb, CcbStatus::Timeout, None);
                }
                let status = self.chan.hw.alt_status();
                if status & STATUS_REL != 0 {
                    debug!(target, tag, "drive released the bus");
                    self.chan.set_idle();
                    self.sim_q.push(SimEvent::BusFree);
                    return;
                }
                let begun = {
                    let mut c = active.ccb.borrow_mut();
                    dma::begin(self.chan.hw.as_mut(), &mut c)
                };
                if let Err(e) = begun {
                    warn!(error = %e, "queued DMA setup failed");
                    self.free_tag(target, mode);
                    return self.dma_fallback(active.ccb, target, crc_retries);
                }
                active.kind = AccessKind::Dma {
                    queued_tag: Some(tag),
                };
            }
        }

        self.active = Some(active);
        self.chan.arm_wait(timeout_ms);
    }

    /// A DMA failure downgrades the drive and reruns this request over
    /// PIO. PIO cannot interleave with other tagged commands still in
    /// flight on the drive, so in that case the request goes back to the
    /// transport untagged instead of being rerun in place.
    fn dma_fallback(&mut self, ccb: CcbRef, target: u8, crc_retries: u8) {
        self.note_dma_failure(target);
        let outstanding = self.drives[usize::from(target)]
            .as_ref()
            .map_or(0, |d| d.queue.slots.outstanding());
        if outstanding > 0 {
            ccb.borrow_mut().hw_tagged = false;
            return self.finish(ccb, CcbStatus::Resubmit, None);
        }
        self.run_ata_translation(ccb, target, XferMode::Pio, crc_retries)
    }

    fn note_dma_failure(&mut self, target: u8) {
        if let Some(drive) = self.drives[usize::from(target)].as_mut() {
            if drive.dma.record_failure() && drive.queue.enabled() {
                // Queued operation rides on DMA; a downgraded drive cannot
                // keep its queue either.
                drive.queue.record_failure();
            }
        }
    }

    // ---- ATAPI ----

    fn start_atapi(&mut self, ccb: CcbRef, target: u8) {
        let idx = usize::from(target);
        let (dma_ok, slow_drq, optical) = match self.drives[idx].as_ref() {
            Some(d) => (
                d.dma.allows(d.identify.dma_supported),
                d.identify.slow_drq,
                d.identify.atapi_type == ATAPI_TYPE_CDROM,
            ),
            None => return self.finish(ccb, CcbStatus::DeviceNotThere, None),
        };

        let cmd = {
            let c = ccb.borrow();
            // Rewritten data phases are re-packed host-side; keep them PIO.
            let rewritten = optical
                && matches!(c.cdb_bytes().first(), Some(&op6) if op6 == ata::op::MODE_SENSE_6 || op6 == ata::op::MODE_SELECT_6);
            let want_dma = dma_ok && c.direction != DataDirection::None && !rewritten;
            atapi::build_packet(&c, want_dma, optical)
        };
        let cmd = match cmd {
            Ok(cmd) => cmd,
            Err(sense) => {
                if let Some(drive) = self.drives[idx].as_mut() {
                    drive.pending_sense = Some(sense);
                }
                return self.finish(ccb, CcbStatus::CheckCondition, Some(sense));
            }
        };

        let scratch = match cmd.rewrite {
            Some(ModeRewrite::Sense6To10) => {
                Some(vec![0u8; atapi::scratch_len(&ccb.borrow(), cmd.rewrite)])
            }
            Some(ModeRewrite::Select6To10) => {
                Some(atapi::expand_mode_select(&ccb.borrow().data))
            }
            None => None,
        };
        let byte_count = scratch
            .as_ref()
            .map_or_else(|| ccb.borrow().data.len(), Vec::len);
        let is_write = ccb.borrow().direction == DataDirection::Out;

        self.issue_packet(ccb, target, cmd, scratch, byte_count, is_write, slow_drq, false);
    }

    #[allow(clippy::too_many_arguments)]
    fn issue_packet(
        &mut self,
        ccb: CcbRef,
        target: u8,
        cmd: PacketCmd,
        scratch: Option<Vec<u8>>,
        byte_count: usize,
        is_write: bool,
        slow_drq: bool,
        autosense: bool,
    ) {
        self.chan.select(target, 0);
        if self.chan.wait_not_busy(REGISTER_WAIT_MS).is_err() {
            return self.finish(ccb, CcbStatus::Timeout, None);
        }
        self.chan.issue(&TaskFile::Packet {
            byte_count_limit: cmd.byte_count_limit,
            dma: cmd.dma,
        });

        let timeout_ms = if autosense {
            AUTOSENSE_TIMEOUT_MS
        } else {
            ccb.borrow().timeout_ms
        };
        let sg = dma::effective_sg(&ccb.borrow());
        let mut active = Active {
            ccb,
            drive: target,
            kind: AccessKind::Packet {
                cmd,
                sent: false,
                autosense,
            },
            cursor: PioCursor::new(),
            sg,
            byte_count,
            bytes_done: 0,
            is_write,
            crc_retries: 0,
            scratch,
            scratch_pos: 0,
        };

        if !slow_drq {
            // The drive raises DRQ for the packet without interrupting.
            if self.chan.wait_drq(REGISTER_WAIT_MS).is_err() {
                return self.finish(active.ccb, CcbStatus::Timeout, None);
            }
            self.send_packet(&mut active);
        }
        self.active = Some(active);
        self.chan.arm_wait(timeout_ms);
    }

    fn send_packet(&mut self, active: &mut Active) {
        let AccessKind::Packet { cmd, sent, .. } = &mut active.kind else {
            return;
        };
        let mut words = [0u16; ATAPI_PACKET_LEN / 2];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u16::from_le_bytes([cmd.packet[i * 2], cmd.packet[i * 2 + 1]]);
        }
        self.chan.hw.write_pio(&words);
        *sent = true;
        if cmd.dma {
            if let Err(e) = dma::begin(self.chan.hw.as_mut(), &mut active.ccb.borrow_mut()) {
                warn!(error = %e, "packet DMA setup failed");
                // Completion path will see the engine error.
            }
        }
    }

    // ---- deferred work ----

    fn on_completion(&mut self, status: u8) {
        let Some(active) = self.active.take() else {
            warn!("completion with no active access");
            return;
        };
        match active.kind {
            AccessKind::NonData => self.complete_non_data(active, status),
            AccessKind::PioIn { remaining } => self.continue_pio_in(active, status, remaining),
            AccessKind::PioOut { remaining } => self.continue_pio_out(active, status, remaining),
            AccessKind::Dma { queued_tag } => self.complete_dma(active, status, queued_tag),
            AccessKind::Packet { .. } => self.continue_packet(active, status),
        }
    }

    fn ata_error(&mut self, active: Active, _status: u8) {
        let error_reg = self.chan.hw.read_reg(TfReg::Features);
        let sense = ata::decode_error(error_reg, active.is_write);
        if ata::crc_retryable(&sense) && active.crc_retries < MAX_CRC_RETRIES {
            debug!(retries = active.crc_retries + 1, "retrying after interface CRC error");
            let (ccb, target, retries) = (active.ccb, active.drive, active.crc_retries + 1);
            self.chan.set_idle();
            let mode = match active.kind {
                AccessKind::Dma { .. } => XferMode::Dma,
                _ => XferMode::Pio,
            };
            return self.run_ata_translation(ccb, target, mode, retries);
        }
        let target = active.drive;
        if let Some(drive) = self.drives[usize::from(target)].as_mut() {
            drive.pending_sense = Some(sense);
        }
        let queued = matches!(active.kind, AccessKind::Dma { queued_tag: Some(_) });
        self.finish_active(active, CcbStatus::CheckCondition, Some(sense));
        if queued {
            // A failed queued command leaves the rest of the drive's queue
            // suspect; discard it once the channel is free.
            self.schedule_synced(SyncedCall::AbortQueue { target });
        }
    }

    fn complete_non_data(&mut self, active: Active, status: u8) {
        if status & STATUS_ERR != 0 {
            return self.ata_error(active, status);
        }
        self.finish_active(active, CcbStatus::Ok, None);
    }

    fn continue_pio_in(&mut self, mut active: Active, status: u8, remaining: usize) {
        if status & STATUS_ERR != 0 {
            return self.ata_error(active, status);
        }
        if status & STATUS_DRQ == 0 {
            return self.finish_active(active, CcbStatus::SequenceFailure, None);
        }
        let block = remaining.min(SECTOR_SIZE);
        {
            let ccb = active.ccb.clone();
            let mut c = ccb.borrow_mut();
            let out = active
                .cursor
                .read_block(self.chan.hw.as_mut(), &mut c.data, &active.sg, block);
            active.bytes_done += out.transferred;
        }
        let remaining = remaining - block;
        if remaining > 0 {
            let timeout_ms = active.ccb.borrow().timeout_ms;
            active.kind = AccessKind::PioIn { remaining };
            self.active = Some(active);
            self.chan.arm_wait(timeout_ms);
        } else {
            let residual = active.byte_count.saturating_sub(active.bytes_done);
            active.ccb.borrow_mut().residual = residual;
            self.finish_active(active, CcbStatus::Ok, None);
        }
    }

    fn continue_pio_out(&mut self, mut active: Active, status: u8, remaining: usize) {
        if status & STATUS_ERR != 0 {
            return self.ata_error(active, status);
        }
        if remaining == 0 {
            active.ccb.borrow_mut().residual = 0;
            return self.finish_active(active, CcbStatus::Ok, None);
        }
        if status & STATUS_DRQ == 0 {
            return self.finish_active(active, CcbStatus::SequenceFailure, None);
        }
        let block = remaining.min(SECTOR_SIZE);
        {
            let ccb = active.ccb.clone();
            let c = ccb.borrow();
            active
                .cursor
                .write_block(self.chan.hw.as_mut(), &c.data, &active.sg, block);
        }
        active.bytes_done += block;
        let timeout_ms = active.ccb.borrow().timeout_ms;
        active.kind = AccessKind::PioOut {
            remaining: remaining - block,
        };
        self.active = Some(active);
        self.chan.arm_wait(timeout_ms);
    }

    fn complete_dma(&mut self, active: Active, status: u8, queued_tag: Option<u8>) {
        let engine = dma::complete(self.chan.hw.as_mut(), &mut active.ccb.borrow_mut());
        if let Err(e) = engine {
            let target = active.drive;
            warn!(error = %e, "DMA transfer failed");
            let crc_retries = active.crc_retries;
            let ccb = active.ccb;
            if let Some(tag) = queued_tag {
                if let Some(drive) = self.drives[usize::from(target)].as_mut() {
                    drive.queue.slots.take(tag);
                }
            }
            self.chan.set_idle();
            return self.dma_fallback(ccb, target, crc_retries);
        }
        if status & STATUS_ERR != 0 {
            return self.ata_error(active, status);
        }
        let target = active.drive;
        if let Some(drive) = self.drives[usize::from(target)].as_mut() {
            drive.dma.record_success();
            if queued_tag.is_some() {
                drive.queue.record_success();
            }
        }
        active.ccb.borrow_mut().residual = 0;
        self.finish_active(active, CcbStatus::Ok, None);
    }

    fn continue_packet(&mut self, mut active: Active, status: u8) {
        let ireason = self.chan.hw.read_reg(TfReg::SectorCount);
        let phase = atapi::classify_phase(ireason, status);
        let (sent, autosense, dma) = match &active.kind {
            AccessKind::Packet {
                sent,
                autosense,
                cmd,
            } => (*sent, *autosense, cmd.dma),
            _ => return,
        };

        if !sent {
            return match phase {
                PacketPhase::AwaitPacket => {
                    // Slow-DRQ drive: the packet goes out from the DPC.
                    self.send_packet(&mut active);
                    self.rearm(active);
                }
                PacketPhase::Complete if status & STATUS_ERR != 0 => {
                    self.packet_error(active, autosense)
                }
                _ => self.finish_active(active, CcbStatus::SequenceFailure, None),
            };
        }

        match phase {
            PacketPhase::DataIn => {
                let n = self.packet_byte_count();
                self.packet_data_in(&mut active, n);
                self.rearm(active);
            }
            PacketPhase::DataOut => {
                let n = self.packet_byte_count();
                self.packet_data_out(&mut active, n);
                self.rearm(active);
            }
            PacketPhase::Release => {
                // Non-overlapped packet devices still signal bus release
                // around long media operations; keep waiting.
                self.rearm(active);
            }
            PacketPhase::AwaitPacket => {
                self.finish_active(active, CcbStatus::SequenceFailure, None);
            }
            PacketPhase::Complete => {
                if dma {
                    let engine =
                        dma::complete(self.chan.hw.as_mut(), &mut active.ccb.borrow_mut());
                    if let Err(e) = engine {
                        warn!(error = %e, "packet DMA transfer failed");
                        let target = active.drive;
                        self.note_dma_failure(target);
                        // Let the transport rerun it; a downgraded drive
                        // will take the PIO path.
                        return self.finish_active(active, CcbStatus::Resubmit, None);
                    }
                    if let Some(drive) = self.drives[usize::from(active.drive)].as_mut() {
                        drive.dma.record_success();
                    }
                    // The engine either moves the whole run or errors.
                    active.bytes_done = active.byte_count;
                }
                if status & STATUS_ERR != 0 {
                    return self.packet_error(active, autosense);
                }
                self.packet_success(active);
            }
        }
    }

    /// Put the access back and wait for the next interrupt.
    fn rearm(&mut self, active: Active) {
        let timeout_ms = active.ccb.borrow().timeout_ms;
        self.active = Some(active);
        self.chan.arm_wait(timeout_ms);
    }

    fn packet_byte_count(&mut self) -> usize {
        let lo = self.chan.hw.read_reg(TfReg::LbaMid);
        let hi = self.chan.hw.read_reg(TfReg::LbaHigh);
        usize::from(u16::from_le_bytes([lo, hi]))
    }

    fn packet_data_in(&mut self, active: &mut Active, n: usize) {
        if let Some(scratch) = active.scratch.as_mut() {
            let pos = active.scratch_pos.min(scratch.len());
            let window = [keel_xpt::SgEntry {
                base: 0,
                len: scratch.len() - pos,
            }];
            let mut cursor = PioCursor::new();
            let out = cursor.read_block(self.chan.hw.as_mut(), &mut scratch[pos..], &window, n);
            active.scratch_pos = pos + out.transferred;
            active.bytes_done += out.transferred;
        } else {
            let ccb = active.ccb.clone();
            let mut c = ccb.borrow_mut();
            let out = active
                .cursor
                .read_block(self.chan.hw.as_mut(), &mut c.data, &active.sg, n);
            active.bytes_done += out.transferred;
        }
    }

    fn packet_data_out(&mut self, active: &mut Active, n: usize) {
        if let Some(scratch) = active.scratch.as_ref() {
            let pos = active.scratch_pos.min(scratch.len());
            let window = [keel_xpt::SgEntry {
                base: 0,
                len: scratch.len() - pos,
            }];
            let mut cursor = PioCursor::new();
            let out = cursor.write_block(self.chan.hw.as_mut(), &scratch[pos..], &window, n);
            active.scratch_pos = pos + out.transferred;
            active.bytes_done += out.transferred;
        } else {
            let ccb = active.ccb.clone();
            let c = ccb.borrow();
            let out = active
                .cursor
                .write_block(self.chan.hw.as_mut(), &c.data, &active.sg, n);
            active.bytes_done += out.transferred;
        }
    }

    fn packet_error(&mut self, active: Active, was_autosense: bool) {
        let error_reg = self.chan.hw.read_reg(TfReg::Features);
        let key = atapi::quick_sense_key(error_reg);
        let target = active.drive;
        if was_autosense {
            // Autosense itself failed; report what the error register gave.
            let sense = SenseData::new(key, asc::INTERNAL_TARGET_FAILURE);
            return self.finish_active(active, CcbStatus::CheckCondition, Some(sense));
        }
        debug!(key = ?key, "packet command failed, fetching sense");
        let ccb = active.ccb;
        self.chan.set_idle();
        let cmd = PacketCmd {
            packet: atapi::request_sense_packet(18),
            dma: false,
            byte_count_limit: 18,
            rewrite: None,
        };
        let slow_drq = self.drives[usize::from(target)]
            .as_ref()
            .is_some_and(|d| d.identify.slow_drq);
        self.issue_packet(
            ccb,
            target,
            cmd,
            Some(vec![0u8; 18]),
            18,
            false,
            slow_drq,
            true,
        );
    }

    fn packet_success(&mut self, mut active: Active) {
        let autosense = matches!(active.kind, AccessKind::Packet { autosense: true, .. });
        if autosense {
            let sense = active
                .scratch
                .as_deref()
                .and_then(SenseData::decode_fixed)
                .unwrap_or_else(|| {
                    SenseData::new(SenseKey::HardwareError, asc::INTERNAL_TARGET_FAILURE)
                });
            if let Some(drive) = self.drives[usize::from(active.drive)].as_mut() {
                drive.pending_sense = Some(sense);
            }
            return self.finish_active(active, CcbStatus::CheckCondition, Some(sense));
        }

        let rewrite = match &active.kind {
            AccessKind::Packet { cmd, .. } => cmd.rewrite,
            _ => None,
        };
        if rewrite == Some(ModeRewrite::Sense6To10) {
            let scratch = active.scratch.take().unwrap_or_default();
            let mut c = active.ccb.borrow_mut();
            let filled = &scratch[..active.scratch_pos.min(scratch.len())];
            let n = atapi::repack_mode_sense(filled, &mut c.data);
            let len = c.data.len();
            c.residual = len.saturating_sub(n);
            drop(c);
        } else if rewrite == Some(ModeRewrite::Select6To10) {
            active.ccb.borrow_mut().residual = 0;
        } else {
            let residual = active.byte_count.saturating_sub(active.bytes_done);
            active.ccb.borrow_mut().residual = residual;
        }
        self.finish_active(active, CcbStatus::Ok, None);
    }

    // ---- overlapped service ----

    fn try_service(&mut self) {
        self.try_service_from(0);
    }

    /// Look for a drive asserting SERV and start its released command,
    /// checking `first` before the other drive.
    fn try_service_from(&mut self, first: u8) {
        if self.active.is_some() || self.chan.state() != BusState::Idle {
            return;
        }
        for drive in [first, first ^ 1] {
            let idx = usize::from(drive);
            let outstanding = self.drives[idx]
                .as_ref()
                .is_some_and(|d| !d.queue.slots.is_empty());
            if !outstanding {
                continue;
            }
            self.chan.select(drive, 0);
            let status = self.chan.hw.alt_status();
            if status & STATUS_SERV == 0 {
                continue;
            }
            self.chan.issue(&TaskFile::NonData {
                command: CMD_SERVICE,
                features: 0,
                count: 0,
            });
            if self.chan.wait_not_busy(REGISTER_WAIT_MS).is_err() {
                self.handle_queue_failure(drive);
                return;
            }
            let tag = service_tag(self.chan.hw.read_reg(TfReg::SectorCount));
            let ccb = self.drives[idx]
                .as_ref()
                .and_then(|d| d.queue.slots.get(tag).cloned());
            let Some(ccb) = ccb else {
                warn!(tag, "drive requested service for an unknown tag");
                self.handle_queue_failure(drive);
                return;
            };
            debug!(drive, tag, "servicing released command");
            let begun = {
                let mut c = ccb.borrow_mut();
                dma::begin(self.chan.hw.as_mut(), &mut c)
            };
            if let Err(e) = begun {
                warn!(error = %e, "service DMA setup failed");
                self.note_dma_failure(drive);
                self.handle_queue_failure(drive);
                return;
            }
            let timeout_ms = ccb.borrow().timeout_ms;
            let sg = dma::effective_sg(&ccb.borrow());
            let is_write = ccb.borrow().direction == DataDirection::Out;
            self.active = Some(Active {
                ccb,
                drive,
                kind: AccessKind::Dma {
                    queued_tag: Some(tag),
                },
                cursor: PioCursor::new(),
                sg,
                byte_count: 0,
                bytes_done: 0,
                is_write,
                crc_retries: 0,
                scratch: None,
                scratch_pos: 0,
            });
            self.chan.set_accessing();
            self.chan.arm_wait(timeout_ms);
            return;
        }
    }

    /// Throw away the drive's command queue with NOP(discard) and hand the
    /// parked commands back for resubmission. If the drive will not even
    /// take the NOP, escalate to a channel reset.
    fn handle_queue_failure(&mut self, target: u8) {
        let idx = usize::from(target);
        if let Some(drive) = self.drives[idx].as_mut() {
            drive.queue.record_failure();
        }
        self.chan.select(target, 0);
        self.chan.issue(&TaskFile::NonData {
            command: CMD_NOP,
            features: NOP_DISCARD_QUEUE,
            count: 0,
        });
        // NOP always aborts; not-busy with only ABRT set is the success
        // shape here.
        let alive = self.chan.wait_not_busy(REGISTER_WAIT_MS).is_ok();
        if !alive {
            warn!(target, "drive unresponsive during queue abort, resetting channel");
            return self.reset_channel();
        }
        let parked = self.drives[idx]
            .as_mut()
            .map(|d| d.queue.slots.drain())
            .unwrap_or_default();
        info!(target, count = parked.len(), "discarded command queue");
        for ccb in parked {
            self.finish(ccb, CcbStatus::Resubmit, None);
        }
        self.chan.set_idle();
    }

    fn on_timeout(&mut self) {
        if let Some(active) = self.active.take() {
            warn!(drive = active.drive, "command timed out");
            if let AccessKind::Dma { .. } | AccessKind::Packet { .. } = active.kind {
                // Recover the buffer if the engine holds it.
                let _ = dma::complete(self.chan.hw.as_mut(), &mut active.ccb.borrow_mut());
            }
            if let AccessKind::Dma {
                queued_tag: Some(tag),
            } = active.kind
            {
                if let Some(drive) = self.drives[usize::from(active.drive)].as_mut() {
                    drive.queue.slots.take(tag);
                }
            }
            self.finish(active.ccb, CcbStatus::Timeout, None);
        }
        self.reset_channel();
    }

    /// Reset the channel and fail everything outstanding on it.
    fn reset_channel(&mut self) {
        let mut victims: Vec<CcbRef> = Vec::new();
        if let Some(active) = self.active.take() {
            victims.push(active.ccb);
        }
        for drive in self.drives.iter_mut().flatten() {
            victims.extend(drive.queue.slots.drain());
            // The next REQUEST SENSE reports the reset as a unit attention.
            drive.pending_sense = Some(SenseData::new(
                SenseKey::UnitAttention,
                asc::BUS_RESET_OCCURRED,
            ));
        }
        victims.extend(self.pending.drain(..));
        self.synced.clear();

        if let Err(e) = self.chan.soft_reset() {
            warn!(error = %e, "channel did not come back from reset");
        }
        for ccb in victims {
            self.finish(ccb, CcbStatus::BusReset, None);
        }
        self.sim_q.push(SimEvent::Async(AsyncEvent::BusReset {
            path_id: self.path_id.0,
        }));
    }

    /// Issue work that queued up while the channel was busy. Pending
    /// service requests from released commands go first; fresh commands
    /// only start once no drive is asking for the channel back.
    fn kick(&mut self) {
        loop {
            self.try_service();
            if self.active.is_some() || self.chan.state() != BusState::Idle {
                return;
            }
            let Some(ccb) = self.pending.pop_front() else {
                return;
            };
            self.start_io(ccb);
        }
    }
}

impl SimDriver for IdeBus {
    fn action(&mut self, ccb: CcbRef) {
        let function = ccb.borrow().function;
        match function {
            CcbFunction::ResetBus => {
                self.reset_channel();
                self.finish(ccb, CcbStatus::Ok, None);
            }
            CcbFunction::AbortCommand => {
                // Queued aborts are resolved by the transport before
                // dispatch; an abort reaching the hardware layer has
                // nothing left to catch.
                self.finish(ccb, CcbStatus::SequenceFailure, None);
            }
            CcbFunction::ScsiIo => {
                if self.active.is_some() || self.chan.state() != BusState::Idle {
                    self.pending.push_back(ccb);
                } else {
                    self.start_io(ccb);
                }
            }
        }
    }

    fn pump(&mut self) {
        self.chan.check_timeout();
        self.chan.poll_intrq();
        while let Some(dpc) = self.chan.take_dpc() {
            match dpc {
                Dpc::Completion { status } => self.on_completion(status),
                Dpc::ServiceRequest => self.try_service(),
                Dpc::Timeout => self.on_timeout(),
            }
            self.chan.check_timeout();
            self.chan.poll_intrq();
        }
        self.kick();
    }

    fn tagged_queueing(&self) -> bool {
        self.drives
            .iter()
            .flatten()
            .any(|d| d.queue.enabled())
    }

    fn target_count(&self) -> u8 {
        2
    }
}

/// Copy synthesized response bytes out through the request's windows.
fn copy_to_buffer(ccb: &mut Ccb, src: &[u8]) -> usize {
    let sg = dma::effective_sg(ccb);
    let mut copied = 0;
    for entry in sg {
        if copied == src.len() || entry.base >= ccb.data.len() {
            break;
        }
        let n = entry
            .len
            .min(src.len() - copied)
            .min(ccb.data.len() - entry.base);
        ccb.data[entry.base..entry.base + n].copy_from_slice(&src[copied..copied + n]);
        copied += n;
    }
    copied
}

