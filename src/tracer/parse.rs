//! Event parsing for raw probe samples.
//!
//! Decodes byte slices written by the probe loader into typed
//! [`ProbeEvent`] values. Length checks happen once per sample, then
//! fixed-width little-endian reads go through bounds-checked helpers.

use thiserror::Error;

use super::event::{OpKind, ProbeEvent, ProbeKind};

/// Sample header size in bytes.
pub const HEADER_SIZE: usize = 24;

/// Payload size shared by every probe kind.
pub const PAYLOAD_SIZE: usize = 24;

/// Total size of one sample.
pub const SAMPLE_SIZE: usize = HEADER_SIZE + PAYLOAD_SIZE;

/// Errors that can occur during event parsing.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("event too short: {size} bytes")]
    Truncated { size: usize },

    #[error("unknown probe kind: {raw}")]
    UnknownProbe { raw: u8 },

    #[error("invalid op byte: {raw}")]
    InvalidOp { raw: u8 },

    #[error("reading {probe}: unexpected end of data")]
    PayloadTruncated { probe: &'static str },
}

impl ParseError {
    /// Short label used for the parse error metric.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Truncated { .. } => "truncated",
            Self::UnknownProbe { .. } => "unknown_probe",
            Self::InvalidOp { .. } => "invalid_op",
            Self::PayloadTruncated { .. } => "payload_truncated",
        }
    }
}

/// Parse a raw sample into a [`ProbeEvent`].
///
/// Layout: header `{ts u64, pid u32, tid u32, probe u8, op u8, pad[6]}`
/// followed by payload `{handle u64, bytes u64, cgroup_id u64}`, all
/// little-endian. Trailing bytes are ignored.
pub fn parse_event(data: &[u8]) -> Result<ProbeEvent, ParseError> {
    if data.len() < HEADER_SIZE {
        return Err(ParseError::Truncated { size: data.len() });
    }

    let probe_raw = read_u8(data, 16);
    let op_raw = read_u8(data, 17);

    let probe = ProbeKind::from_u8(probe_raw).ok_or(ParseError::UnknownProbe { raw: probe_raw })?;
    let op = OpKind::from_u8(op_raw).ok_or(ParseError::InvalidOp { raw: op_raw })?;

    if data.len() < SAMPLE_SIZE {
        return Err(ParseError::PayloadTruncated {
            probe: probe.as_str(),
        });
    }

    Ok(ProbeEvent {
        timestamp_ns: read_u64_le(data, 0),
        pid: read_u32_le(data, 8),
        tid: read_u32_le(data, 12),
        cgroup_id: read_u64_le(data, HEADER_SIZE + 16),
        probe,
        // VFS probes carry their direction in the attach point.
        op: probe.implied_op().unwrap_or(op),
        handle: read_u64_le(data, HEADER_SIZE),
        bytes: read_u64_le(data, HEADER_SIZE + 8),
        entity: None,
    })
}

/// Encode a [`ProbeEvent`] into the wire layout read by [`parse_event`].
/// The resolved entity is not part of the wire format.
pub fn encode_event(event: &ProbeEvent) -> [u8; SAMPLE_SIZE] {
    let mut out = [0u8; SAMPLE_SIZE];
    write_fixed(&mut out, 0, &event.timestamp_ns.to_le_bytes());
    write_fixed(&mut out, 8, &event.pid.to_le_bytes());
    write_fixed(&mut out, 12, &event.tid.to_le_bytes());
    write_fixed(&mut out, 16, &[event.probe as u8, event.op as u8]);
    write_fixed(&mut out, HEADER_SIZE, &event.handle.to_le_bytes());
    write_fixed(&mut out, HEADER_SIZE + 8, &event.bytes.to_le_bytes());
    write_fixed(&mut out, HEADER_SIZE + 16, &event.cgroup_id.to_le_bytes());
    out
}

fn write_fixed(out: &mut [u8], offset: usize, src: &[u8]) {
    if let Some(dst) = out.get_mut(offset..offset + src.len()) {
        dst.copy_from_slice(src);
    }
}

// ---------------------------------------------------------------------------
// Safe byte-reading helpers (no indexing, no panics)
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u8(data: &[u8], offset: usize) -> u8 {
    data.get(offset).copied().unwrap_or(0)
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    if let Some(src) = data.get(offset..offset + N) {
        out.copy_from_slice(src);
    }
    out
}
