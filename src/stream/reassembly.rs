//! Payload reassembly.
//!
//! Every payload (a whole bulk transfer or one isochronous packet) starts
//! with a small header carrying the frame-ID toggle, end-of-frame marker and
//! optional timestamps. The reassembler accumulates image bytes into a
//! working buffer and swaps it with the held buffer when a frame ends, either
//! explicitly through EOF or implicitly when FID or PTS change.

use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, trace};

use crate::types::IncompleteFramePolicy;

pub(crate) const HEADER_FID: u8 = 0x01;
pub(crate) const HEADER_EOF: u8 = 0x02;
pub(crate) const HEADER_PTS: u8 = 0x04;
pub(crate) const HEADER_SCR: u8 = 0x08;
pub(crate) const HEADER_ERR: u8 = 0x40;

/// Apple iSight cameras tag header-bearing chunks with this marker at
/// offset 2 or 3. Untagged chunks are pure image data.
const ISIGHT_TAG: [u8; 12] = [
    0x11, 0x22, 0x33, 0x44, 0xde, 0xad, 0xbe, 0xef, 0xde, 0xad, 0xfa, 0xce,
];

/// How the stream's payloads arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransportMode {
    Isochronous,
    Bulk,
}

/// What a single payload caused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PayloadOutcome {
    /// A frame was swapped into the held slot; consumers should be woken.
    pub published: bool,
    /// The header carried the error bit.
    pub device_error: bool,
}

/// The last published frame.
#[derive(Debug, Default)]
pub(crate) struct HeldFrame {
    pub data: Vec<u8>,
    pub bytes: usize,
    /// 0 until the first publication.
    pub sequence: u32,
    pub pts: u32,
    pub scr: u32,
    pub complete: bool,
    pub error: bool,
    pub captured: Option<Instant>,
}

impl HeldFrame {
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.bytes.min(self.data.len())]
    }
}

pub(crate) struct Reassembler {
    policy: IncompleteFramePolicy,
    isight: bool,
    out: Vec<u8>,
    got_bytes: usize,
    fid: u8,
    pts: u32,
    scr: u32,
    error: bool,
    /// Sequence number the next publication gets.
    seq: u32,
    held: HeldFrame,
}

impl Reassembler {
    /// Create a reassembler whose frames hold at most `capacity` bytes.
    pub fn new(capacity: usize, policy: IncompleteFramePolicy, isight: bool) -> Self {
        Self {
            policy,
            isight,
            out: vec![0; capacity],
            got_bytes: 0,
            fid: 0,
            pts: 0,
            scr: 0,
            error: false,
            seq: 1,
            held: HeldFrame {
                data: vec![0; capacity],
                ..Default::default()
            },
        }
    }

    pub fn held(&self) -> &HeldFrame {
        &self.held
    }

    fn has_isight_tag(payload: &[u8]) -> bool {
        let tagged_at = |offset: usize| {
            payload
                .get(offset..offset + ISIGHT_TAG.len())
                .is_some_and(|window| window == ISIGHT_TAG)
        };
        tagged_at(2) || tagged_at(3)
    }

    /// Feed one payload.
    pub fn process_payload(&mut self, payload: &[u8], mode: TransportMode) -> PayloadOutcome {
        let mut outcome = PayloadOutcome::default();
        if payload.is_empty() {
            return outcome;
        }

        let (header_len, data_len) = if payload.len() < 2
            || (self.isight && !Self::has_isight_tag(payload))
        {
            (0, payload.len())
        } else {
            let header_len = payload[0] as usize;
            if header_len > payload.len() {
                debug!(
                    "bogus payload: length {} header length {header_len}",
                    payload.len()
                );
                self.error = true;
                return outcome;
            }
            let data_len = if self.isight {
                0
            } else {
                payload.len() - header_len
            };
            (header_len, data_len)
        };

        let info = if header_len >= 2 { payload[1] } else { 0 };

        if header_len >= 2 {
            if data_len == 0 && info & HEADER_EOF == 0 {
                trace!("header-only payload skipped");
                return outcome;
            }

            if info & HEADER_ERR != 0 {
                debug!("payload header has the error bit set");
                outcome.device_error = true;
            }

            let mut offset = 2;
            let mut pts = 0;
            let mut scr = None;
            if info & HEADER_PTS != 0 {
                if offset + 4 <= header_len {
                    pts = LittleEndian::read_u32(&payload[offset..offset + 4]);
                } else {
                    debug!("PTS flagged but header is only {header_len} bytes");
                }
                offset += 4;
            }
            if info & HEADER_SCR != 0 {
                if offset + 6 <= header_len {
                    scr = Some(LittleEndian::read_u32(&payload[offset..offset + 4]));
                } else {
                    debug!("SCR flagged but header is only {header_len} bytes");
                }
            }

            let fid = info & HEADER_FID;
            if self.got_bytes > 0 && (fid != self.fid || pts != self.pts) {
                debug!("frame ended without EOF ({} bytes)", self.got_bytes);
                outcome.published |= self.finish_incomplete();
            }
            self.fid = fid;
            self.pts = pts;
            if let Some(scr) = scr {
                self.scr = scr;
            }
        }

        if data_len > 0 {
            let data = &payload[header_len..header_len + data_len];
            let room = self.out.len() - self.got_bytes;
            let n = if data.len() > room {
                debug!(
                    "frame overflow: {} bytes do not fit in {room}",
                    data.len()
                );
                self.error = true;
                room
            } else {
                data.len()
            };
            self.out[self.got_bytes..self.got_bytes + n].copy_from_slice(&data[..n]);
            self.got_bytes += n;
        }

        if info & HEADER_EOF != 0 && (mode == TransportMode::Bulk || data_len > 0) {
            self.swap(true);
            outcome.published = true;
        }

        outcome
    }

    /// End the in-progress frame at an implicit boundary. Returns whether it
    /// was published.
    fn finish_incomplete(&mut self) -> bool {
        match self.policy {
            IncompleteFramePolicy::Deliver => {
                self.swap(false);
                true
            }
            IncompleteFramePolicy::Drop => {
                self.seq = self.seq.wrapping_add(1);
                self.reset_in_progress();
                false
            }
        }
    }

    fn swap(&mut self, complete: bool) {
        std::mem::swap(&mut self.out, &mut self.held.data);
        self.held.bytes = if self.error { 0 } else { self.got_bytes };
        self.held.sequence = self.seq;
        self.held.pts = self.pts;
        self.held.scr = self.scr;
        self.held.complete = complete;
        self.held.error = self.error;
        self.held.captured = Some(Instant::now());

        self.seq = self.seq.wrapping_add(1);
        self.reset_in_progress();
    }

    fn reset_in_progress(&mut self) {
        self.got_bytes = 0;
        self.pts = 0;
        self.scr = 0;
        self.error = false;
    }
}
