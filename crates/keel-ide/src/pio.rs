//! PIO data engine: streams 16-bit data-port words through the request's
//! scatter/gather list.
//!
//! Scatter entries may start or end on odd byte addresses, so one byte can
//! be left over when a word straddles an entry boundary; the cursor carries
//! it into the next entry. A device offering more data than the buffer
//! holds is drained (reads) or padded (writes) so the excess never lands
//! outside the request's windows; that is an overrun outcome, distinct
//! from a hard failure.

use keel_xpt::SgEntry;

use crate::hw::HwChannel;

/// Streaming position inside a request's scatter/gather list. Persists
/// across blocks of a multi-block transfer.
#[derive(Debug, Default)]
pub struct PioCursor {
    sg_index: usize,
    entry_offset: usize,
    carry: Option<u8>,
}

/// Result of transferring one device-announced block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PioOutcome {
    /// Bytes that landed in (or came from) the request buffer.
    pub transferred: usize,
    /// Bytes the device offered/demanded beyond the buffer; drained or
    /// zero-padded.
    pub excess: usize,
}

impl PioOutcome {
    pub fn overrun(&self) -> bool {
        self.excess > 0
    }
}

impl PioCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn window_left(&self, sg: &[SgEntry]) -> usize {
        sg.get(self.sg_index)
            .map_or(0, |e| e.len.saturating_sub(self.entry_offset))
    }

    fn advance(&mut self, sg: &[SgEntry], n: usize) {
        self.entry_offset += n;
        while sg
            .get(self.sg_index)
            .is_some_and(|e| self.entry_offset >= e.len)
        {
            self.entry_offset -= sg[self.sg_index].len;
            self.sg_index += 1;
        }
    }

    fn window_base(&self, sg: &[SgEntry]) -> usize {
        sg[self.sg_index].base + self.entry_offset
    }

    /// Device-to-host transfer of `byte_count` bytes.
    pub fn read_block(
        &mut self,
        hw: &mut dyn HwChannel,
        data: &mut [u8],
        sg: &[SgEntry],
        byte_count: usize,
    ) -> PioOutcome {
        let mut remaining = byte_count;
        let mut transferred = 0usize;

        while (remaining > 0 || self.carry.is_some()) && self.window_left(sg) > 0 {
            // A carried byte was pulled off the wire (and counted) during a
            // previous iteration or block; it only needs placing.
            if let Some(b) = self.carry.take() {
                let pos = self.window_base(sg);
                data[pos] = b;
                self.advance(sg, 1);
                continue;
            }

            let take = self.window_left(sg).min(remaining);
            let word_count = take / 2;
            if word_count > 0 {
                let mut words = vec![0u16; word_count];
                hw.read_pio(&mut words);
                let pos = self.window_base(sg);
                for (i, w) in words.iter().enumerate() {
                    let b = w.to_le_bytes();
                    data[pos + i * 2] = b[0];
                    data[pos + i * 2 + 1] = b[1];
                }
                self.advance(sg, word_count * 2);
                remaining -= word_count * 2;
                transferred += word_count * 2;
                continue;
            }

            // One byte of window or one byte of device data left: pull a
            // word, keep the low byte, carry or drop the high byte.
            let mut word = [0u16; 1];
            hw.read_pio(&mut word);
            let [lo, hi] = word[0].to_le_bytes();
            let pos = self.window_base(sg);
            data[pos] = lo;
            self.advance(sg, 1);
            transferred += 1;
            if remaining >= 2 {
                self.carry = Some(hi);
                remaining -= 2;
                transferred += 1;
            } else {
                remaining -= 1;
            }
        }

        // Buffer exhausted but the device still offers data: drain it.
        let excess = remaining;
        let mut drain = remaining.div_ceil(2);
        while drain > 0 {
            let chunk = drain.min(64);
            let mut sink = vec![0u16; chunk];
            hw.read_pio(&mut sink);
            drain -= chunk;
        }
        PioOutcome {
            transferred: transferred.min(byte_count),
            excess,
        }
    }

    /// Host-to-device transfer of `byte_count` bytes.
    pub fn write_block(
        &mut self,
        hw: &mut dyn HwChannel,
        data: &[u8],
        sg: &[SgEntry],
        byte_count: usize,
    ) -> PioOutcome {
        let mut remaining = byte_count;
        let mut transferred = 0usize;

        while remaining > 0 && self.window_left(sg) > 0 {
            if let Some(lo) = self.carry.take() {
                let pos = self.window_base(sg);
                let hi = data[pos];
                hw.write_pio(&[u16::from_le_bytes([lo, hi])]);
                self.advance(sg, 1);
                remaining = remaining.saturating_sub(2);
                transferred += 1;
                continue;
            }

            let take = self.window_left(sg).min(remaining);
            let word_count = take / 2;
            if word_count > 0 {
                let pos = self.window_base(sg);
                let words: Vec<u16> = (0..word_count)
                    .map(|i| u16::from_le_bytes([data[pos + i * 2], data[pos + i * 2 + 1]]))
                    .collect();
                hw.write_pio(&words);
                self.advance(sg, word_count * 2);
                remaining -= word_count * 2;
                transferred += word_count * 2;
                continue;
            }

            // Last byte of this window: pair it with the first byte of the
            // next window (or pad) on the following iteration.
            let pos = self.window_base(sg);
            let lo = data[pos];
            self.advance(sg, 1);
            transferred += 1;
            if self.window_left(sg) > 0 && remaining >= 2 {
                self.carry = Some(lo);
            } else {
                hw.write_pio(&[u16::from_le_bytes([lo, 0])]);
                remaining = remaining.saturating_sub(2);
            }
        }

        if let Some(lo) = self.carry.take() {
            hw.write_pio(&[u16::from_le_bytes([lo, 0])]);
            remaining = remaining.saturating_sub(2);
            transferred += 1;
        }

        // Device expects more than the buffer holds: pad with zero words.
        let excess = remaining;
        let mut pad = remaining.div_ceil(2);
        while pad > 0 {
            let chunk = pad.min(64);
            hw.write_pio(&vec![0u16; chunk]);
            pad -= chunk;
        }
        PioOutcome {
            transferred,
            excess,
        }
    }
}
