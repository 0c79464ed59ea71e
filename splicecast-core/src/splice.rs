//! MPEG-TS timestamp continuity across a placeholder to live handover.
//!
//! Packets are inspected one at a time. Only PES headers of audio and video
//! streams that begin in a packet are touched; everything else, including
//! malformed packets, passes through byte-identical.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::delivery::{ChunkSink, SinkError};
use crate::switch::{HandoverSink, Source};

pub const TS_PACKET_SIZE: usize = 188;
pub const SYNC_BYTE: u8 = 0x47;
/// PTS/DTS values live in a 33-bit, 90 kHz clock.
pub const PTS_MODULUS: u64 = 1 << 33;
const PTS_MASK: u64 = PTS_MODULUS - 1;

const PTS_FLAG: u8 = 0x80;
const DTS_FLAG: u8 = 0x40;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("invalid packet size: {0} bytes")]
    InvalidPacketSize(usize),
    #[error("invalid sync byte: {0:#04x}")]
    InvalidSyncByte(u8),
    #[error("adaptation field overruns the packet")]
    InvalidAdaptationField,
    #[error("PES header truncated")]
    TruncatedPesHeader,
}

/// Decodes a 5-byte PTS/DTS field, ignoring prefix and marker bits.
pub fn decode_timestamp(field: &[u8; 5]) -> u64 {
    (((field[0] as u64 >> 1) & 0x07) << 30)
        | ((field[1] as u64) << 22)
        | (((field[2] as u64 >> 1) & 0x7F) << 15)
        | ((field[3] as u64) << 7)
        | ((field[4] as u64 >> 1) & 0x7F)
}

/// Encodes `value` (mod 2^33) keeping the 4-bit prefix of `prefix_byte` and
/// setting all marker bits.
pub fn encode_timestamp(value: u64, prefix_byte: u8) -> [u8; 5] {
    let value = value & PTS_MASK;
    [
        (prefix_byte & 0xF0) | (((value >> 30) as u8 & 0x07) << 1) | 0x01,
        (value >> 22) as u8,
        (((value >> 15) as u8 & 0x7F) << 1) | 0x01,
        (value >> 7) as u8,
        (((value as u8) & 0x7F) << 1) | 0x01,
    ]
}

/// `(placeholder_last - live_first) mod 2^33`.
pub fn splice_offset(placeholder_last: u64, live_first: u64) -> u64 {
    placeholder_last.wrapping_sub(live_first) & PTS_MASK
}

/// Location and value of the timestamps in one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PesTimestamps {
    pub pts: u64,
    pub pts_at: usize,
    pub dts: Option<(u64, usize)>,
}

fn is_media_stream(stream_id: u8) -> bool {
    matches!(stream_id, 0xC0..=0xDF | 0xE0..=0xEF)
}

/// Finds the PTS (and DTS) of an audio/video PES header starting in `packet`.
///
/// `Ok(None)` means the packet carries nothing to rewrite.
pub fn locate_timestamps(packet: &[u8]) -> Result<Option<PesTimestamps>, ProtocolError> {
    if packet.len() != TS_PACKET_SIZE {
        return Err(ProtocolError::InvalidPacketSize(packet.len()));
    }
    if packet[0] != SYNC_BYTE {
        return Err(ProtocolError::InvalidSyncByte(packet[0]));
    }
    let payload_unit_start = packet[1] & 0x40 != 0;
    if !payload_unit_start {
        return Ok(None);
    }
    let adaptation_control = (packet[3] >> 4) & 0x03;
    let mut idx = 4;
    match adaptation_control {
        // reserved, or adaptation field only
        0 | 2 => return Ok(None),
        3 => {
            let length = packet[4] as usize;
            idx += 1 + length;
            if idx > TS_PACKET_SIZE {
                return Err(ProtocolError::InvalidAdaptationField);
            }
        }
        _ => {}
    }

    let pes = &packet[idx..];
    if pes.len() < 6 || pes[..3] != [0x00, 0x00, 0x01] {
        return Ok(None);
    }
    if !is_media_stream(pes[3]) {
        return Ok(None);
    }
    if pes.len() < 9 {
        return Err(ProtocolError::TruncatedPesHeader);
    }
    let flags = pes[7];
    let header_len = pes[8] as usize;
    if flags & PTS_FLAG == 0 {
        return Ok(None);
    }
    let pts_at = idx + 9;
    if header_len < 5 || pts_at + 5 > TS_PACKET_SIZE {
        return Err(ProtocolError::TruncatedPesHeader);
    }
    let pts = decode_timestamp(&field(packet, pts_at));

    let dts = if flags & DTS_FLAG != 0 {
        let dts_at = pts_at + 5;
        if header_len < 10 || dts_at + 5 > TS_PACKET_SIZE {
            return Err(ProtocolError::TruncatedPesHeader);
        }
        Some((decode_timestamp(&field(packet, dts_at)), dts_at))
    } else {
        None
    };
    Ok(Some(PesTimestamps { pts, pts_at, dts }))
}

fn field(packet: &[u8], at: usize) -> [u8; 5] {
    let mut out = [0u8; 5];
    out.copy_from_slice(&packet[at..at + 5]);
    out
}

fn rewrite(packet: &mut [u8], at: usize, value: u64) {
    let encoded = encode_timestamp(value, packet[at]);
    packet[at..at + 5].copy_from_slice(&encoded);
}

/// Timestamps observed around the handover. The offset is fixed once, on
/// the first live timestamp.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpliceState {
    pub placeholder_last_pts: Option<u64>,
    pub first_live_pts: Option<u64>,
    pub pts_offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SpliceStats {
    pub packets: u64,
    pub rewritten: u64,
    pub passthrough_malformed: u64,
}

#[derive(Debug, Clone, Default)]
pub struct ContinuitySplicer {
    state: SpliceState,
    stats: SpliceStats,
}

impl ContinuitySplicer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SpliceState {
        &self.state
    }

    pub fn stats(&self) -> &SpliceStats {
        &self.stats
    }

    /// Inspects one packet in place. Placeholder packets only feed the
    /// high-water mark; live packets get the splice offset added.
    pub fn process_packet(&mut self, source: Source, packet: &mut [u8]) {
        self.stats.packets += 1;
        let timestamps = match locate_timestamps(packet) {
            Ok(Some(timestamps)) => timestamps,
            Ok(None) => return,
            Err(err) => {
                self.stats.passthrough_malformed += 1;
                debug!(error = %err, "passing malformed packet through");
                return;
            }
        };

        match source {
            Source::Placeholder => {
                let last = self.state.placeholder_last_pts.unwrap_or(0);
                if self.state.placeholder_last_pts.is_none() || timestamps.pts > last {
                    self.state.placeholder_last_pts = Some(timestamps.pts);
                }
            }
            Source::Live => {
                let offset = match self.state.pts_offset {
                    Some(offset) => offset,
                    None => self.fix_offset(timestamps.pts),
                };
                rewrite(packet, timestamps.pts_at, timestamps.pts.wrapping_add(offset));
                if let Some((dts, dts_at)) = timestamps.dts {
                    rewrite(packet, dts_at, dts.wrapping_add(offset));
                }
                self.stats.rewritten += 1;
            }
        }
    }

    fn fix_offset(&mut self, first_live: u64) -> u64 {
        let placeholder_last = *self.state.placeholder_last_pts.get_or_insert(first_live);
        let offset = splice_offset(placeholder_last, first_live);
        self.state.first_live_pts = Some(first_live);
        self.state.pts_offset = Some(offset);
        info!(
            placeholder_last_pts = placeholder_last,
            first_live_pts = first_live,
            pts_offset = offset,
            "splice offset fixed"
        );
        offset
    }
}

/// Re-frames a byte stream into 188-byte packets and runs each through a
/// [`ContinuitySplicer`] before forwarding.
///
/// At most one partial packet is held back. A partial packet cut off by a
/// source change is discarded so the output stays packet aligned; one left
/// over at the end of the stream is forwarded unmodified.
#[derive(Debug)]
pub struct SplicingSink<S> {
    inner: S,
    splicer: ContinuitySplicer,
    pending: Vec<u8>,
    pending_source: Source,
    discarded: u64,
}

impl<S: ChunkSink> SplicingSink<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            splicer: ContinuitySplicer::new(),
            pending: Vec::with_capacity(TS_PACKET_SIZE),
            pending_source: Source::Placeholder,
            discarded: 0,
        }
    }

    pub fn splicer(&self) -> &ContinuitySplicer {
        &self.splicer
    }

    /// Bytes of partial packets dropped at source changes.
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    async fn flush_pending(&mut self) -> Result<(), SinkError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let partial = std::mem::take(&mut self.pending);
        self.inner.write_chunk(&partial).await
    }
}

#[async_trait]
impl<S: ChunkSink> HandoverSink for SplicingSink<S> {
    async fn write(&mut self, source: Source, chunk: &[u8]) -> Result<(), SinkError> {
        if source != self.pending_source {
            if !self.pending.is_empty() {
                debug!(
                    from = %self.pending_source,
                    bytes = self.pending.len(),
                    "dropping partial packet at source change"
                );
                self.discarded += self.pending.len() as u64;
                self.pending.clear();
            }
            self.pending_source = source;
        }

        let mut out = Vec::with_capacity(self.pending.len() + chunk.len());
        let mut data = chunk;
        if !self.pending.is_empty() {
            let take = (TS_PACKET_SIZE - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() < TS_PACKET_SIZE {
                return Ok(());
            }
            out.append(&mut self.pending);
            self.splicer.process_packet(source, &mut out[..TS_PACKET_SIZE]);
        }
        while data.len() >= TS_PACKET_SIZE {
            let start = out.len();
            out.extend_from_slice(&data[..TS_PACKET_SIZE]);
            self.splicer
                .process_packet(source, &mut out[start..start + TS_PACKET_SIZE]);
            data = &data[TS_PACKET_SIZE..];
        }
        self.pending.extend_from_slice(data);

        if out.is_empty() {
            return Ok(());
        }
        self.inner.write_chunk(&out).await
    }

    async fn finish(&mut self) -> Result<(), SinkError> {
        self.flush_pending().await?;
        self.inner.flush().await
    }
}
