//! Binary encoding for checkpoints and journal entry frames
//!
//! Bodies are self-describing JSON: decoding constructs no code and skips
//! unknown fields, so untrusted input can be rejected without side effects.
//! Entry frames are length-prefixed so a log file can be decoded by walking
//! `<u32-be size><body>` records to EOF. Checkpoints may be gzip-compressed;
//! the reader sniffs the gzip magic bytes instead of trusting a flag.

use std::io::{Read, Write};

use bytes::{Buf, BufMut, BytesMut};

use crate::types::{AgentState, Entry, StoreError};

/// Magic bytes at the start of a gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Size of a frame length prefix.
const FRAME_HEADER_LEN: usize = 4;

/// Encode one entry as a length-prefixed frame.
pub fn encode_entry_frame(entry: &Entry) -> Result<Vec<u8>, StoreError> {
    let body = serde_json::to_vec(entry)?;
    if body.len() > u32::MAX as usize {
        return Err(StoreError::InvalidData(format!(
            "entry {} exceeds maximum frame size",
            entry.id
        )));
    }
    let mut frame = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.put_u32(body.len() as u32);
    frame.put_slice(&body);
    Ok(frame.to_vec())
}

/// Decode a concatenation of entry frames, walking to EOF. A partial
/// trailing frame is an error here; log readers that must tolerate torn
/// writes use [`decode_entry_frames_prefix`].
pub fn decode_entry_frames(data: &[u8]) -> Result<Vec<Entry>, StoreError> {
    let (entries, consumed) = decode_entry_frames_prefix(data)?;
    if consumed != data.len() {
        return Err(StoreError::InvalidData(format!(
            "truncated frame at offset {}: {} trailing bytes",
            consumed,
            data.len() - consumed
        )));
    }
    Ok(entries)
}

/// Decode complete frames from the front of `data`, stopping at a partial
/// trailing frame (a short header, or a header whose body runs past EOF).
/// Returns the decoded entries and the number of bytes consumed, so a
/// caller can treat the remainder as an uncommitted torn write. A frame
/// that is fully present but holds malformed bytes is still an error.
pub fn decode_entry_frames_prefix(data: &[u8]) -> Result<(Vec<Entry>, usize), StoreError> {
    let mut entries = Vec::new();
    let mut cursor = data;
    let mut offset = 0usize;

    while !cursor.is_empty() {
        if cursor.len() < FRAME_HEADER_LEN {
            break;
        }
        let mut header = &cursor[..FRAME_HEADER_LEN];
        let size = header.get_u32() as usize;
        if cursor.len() < FRAME_HEADER_LEN + size {
            break;
        }
        cursor.advance(FRAME_HEADER_LEN);
        let entry: Entry = serde_json::from_slice(&cursor[..size]).map_err(|e| {
            StoreError::InvalidData(format!("malformed entry at offset {}: {}", offset, e))
        })?;
        entries.push(entry);
        cursor.advance(size);
        offset += FRAME_HEADER_LEN + size;
    }

    Ok((entries, offset))
}

/// Serialize an agent state into a checkpoint blob.
pub fn encode_checkpoint(state: &AgentState, compress: bool) -> Result<Vec<u8>, StoreError> {
    let body = serde_json::to_vec(state)?;
    if !compress {
        return Ok(body);
    }
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&body)?;
    Ok(encoder.finish()?)
}

/// Deserialize a checkpoint blob, transparently inflating gzip bodies.
pub fn decode_checkpoint(data: &[u8]) -> Result<AgentState, StoreError> {
    let body;
    let bytes = if data.starts_with(&GZIP_MAGIC) {
        let mut decoder = flate2::read::GzDecoder::new(data);
        let mut inflated = Vec::new();
        decoder
            .read_to_end(&mut inflated)
            .map_err(|e| StoreError::InvalidData(format!("corrupt gzip checkpoint: {}", e)))?;
        body = inflated;
        body.as_slice()
    } else {
        data
    };
    serde_json::from_slice(bytes)
        .map_err(|e| StoreError::InvalidData(format!("malformed checkpoint: {}", e)))
}
