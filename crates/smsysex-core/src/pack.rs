//! 7-bit packing codec for MIDI-safe binary payloads.
//!
//! SysEx data bytes must keep their high bit clear, so arbitrary 8-bit
//! payloads are carried in groups of up to seven bytes, each group preceded
//! by one header byte whose bit *i* stores the stripped high bit of payload
//! byte *i*.
//!
//! Both directions are pure functions with no shared state and are safe to
//! call from any number of tasks concurrently.

/// Pack arbitrary 8-bit data into a MIDI-safe 7-bit byte stream.
///
/// Input is grouped into chunks of up to 7 bytes; each chunk is emitted as
/// one header byte followed by the chunk's bytes with their high bits
/// cleared. A final partial chunk packs only the bytes present, so the
/// output length is `len + ceil(len / 7)`.
#[must_use]
pub fn pack(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len().div_ceil(7));
    for group in data.chunks(7) {
        let mut header = 0u8;
        for (i, byte) in group.iter().enumerate() {
            if byte & 0x80 != 0 {
                header |= 1 << i;
            }
        }
        out.push(header);
        out.extend(group.iter().map(|byte| byte & 0x7F));
    }
    out
}

/// Unpack a 7-bit byte stream produced by [`pack`] back into 8-bit data.
///
/// Consumes one header byte followed by up to 7 payload bytes per group.
/// A trailing partial group yields only the bytes present. When
/// `expected_len` is given the result is truncated to it, which trims
/// padding some firmware revisions append to the final group.
#[must_use]
pub fn unpack(data: &[u8], expected_len: Option<usize>) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len().saturating_sub(data.len().div_ceil(8)));
    for group in data.chunks(8) {
        let header = group[0];
        for (i, byte) in group[1..].iter().enumerate() {
            let mut value = byte & 0x7F;
            if header & (1 << i) != 0 {
                value |= 0x80;
            }
            out.push(value);
        }
    }
    if let Some(len) = expected_len {
        out.truncate(len);
    }
    out
}
