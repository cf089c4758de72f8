//! Record encoding and decoding
//!
//! Records are stored as CRC-checked frames so a torn or corrupted write is
//! detected on recovery.
//!
//! ## File Format
//!
//! ```text
//! [magic: 8 bytes "MSGSTORE"][version: u32]
//! [frame][frame]...
//! ```
//!
//! ## Frame Format
//!
//! ```text
//! [length: u32][type: u8][payload: bytes][crc32: u32]
//! ```
//!
//! - **length**: Total size of type + payload + crc (NOT including length itself)
//! - **type**: Frame type tag (1=Commit, 2=Snapshot)
//! - **payload**: bincode-serialized LogFrame
//! - **crc32**: CRC32 checksum over \[type\]\[payload\]

use crate::record::LogFrame;
use crc32fast::Hasher;
use msgstore_core::{StoreError, StoreResult};
use std::io::{Cursor, Read};

const TYPE_COMMIT: u8 = 1;
const TYPE_SNAPSHOT: u8 = 2;

/// Magic bytes at the start of every store file
pub const FILE_MAGIC: &[u8; 8] = b"MSGSTORE";

/// Current file format version
pub const FILE_VERSION: u32 = 1;

/// Size of the file header in bytes
pub const FILE_HEADER_SIZE: usize = 12;

fn type_tag(frame: &LogFrame) -> u8 {
    match frame {
        LogFrame::Commit { .. } => TYPE_COMMIT,
        LogFrame::Snapshot(_) => TYPE_SNAPSHOT,
    }
}

/// File header bytes
pub fn file_header() -> [u8; FILE_HEADER_SIZE] {
    let mut header = [0u8; FILE_HEADER_SIZE];
    header[..8].copy_from_slice(FILE_MAGIC);
    header[8..].copy_from_slice(&FILE_VERSION.to_le_bytes());
    header
}

/// Validate a file header
///
/// # Errors
///
/// `StoreError::Corruption` on a bad magic or an unsupported version.
pub fn check_file_header(buf: &[u8]) -> StoreResult<()> {
    if buf.len() < FILE_HEADER_SIZE {
        return Err(StoreError::Corruption(format!(
            "file header truncated: {} bytes",
            buf.len()
        )));
    }
    if &buf[..8] != FILE_MAGIC {
        return Err(StoreError::Corruption("bad file magic".to_string()));
    }
    let version = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
    if version != FILE_VERSION {
        return Err(StoreError::Corruption(format!(
            "unsupported file version {} (expected {})",
            version, FILE_VERSION
        )));
    }
    Ok(())
}

/// Encode one frame
///
/// Format: `[length: u32][type: u8][payload: bytes][crc32: u32]`
pub fn encode_frame(frame: &LogFrame) -> StoreResult<Vec<u8>> {
    let tag = type_tag(frame);
    let payload = bincode::serialize(frame)?;

    // type(1) + payload + crc(4)
    let total_len = 1 + payload.len() + 4;
    let mut buf = Vec::with_capacity(4 + total_len);
    buf.extend_from_slice(&(total_len as u32).to_le_bytes());
    buf.push(tag);
    buf.extend_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&[tag]);
    hasher.update(&payload);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    Ok(buf)
}

/// Decode one frame starting at the beginning of `buf`
///
/// Returns `Ok(None)` when `buf` ends before the frame does (a torn tail),
/// otherwise the frame and the number of bytes consumed. `offset` is the
/// file offset of `buf`, used only in error messages.
///
/// # Errors
///
/// `StoreError::Corruption` on a CRC mismatch, a bad length, a type tag
/// that disagrees with the payload, or an undecodable payload.
pub fn decode_frame(buf: &[u8], offset: u64) -> StoreResult<Option<(LogFrame, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }

    let mut cursor = Cursor::new(buf);
    let mut len_buf = [0u8; 4];
    cursor
        .read_exact(&mut len_buf)
        .map_err(|e| StoreError::Corruption(format!("offset {}: unreadable length: {}", offset, e)))?;
    let total_len = u32::from_le_bytes(len_buf) as usize;

    if total_len < 5 {
        return Err(StoreError::Corruption(format!(
            "offset {}: frame length {} below minimum",
            offset, total_len
        )));
    }
    if buf.len() < 4 + total_len {
        return Ok(None);
    }

    let tag = buf[4];
    let payload = &buf[5..4 + total_len - 4];
    let crc_bytes = &buf[4 + total_len - 4..4 + total_len];
    let expected_crc = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);

    let mut hasher = Hasher::new();
    hasher.update(&[tag]);
    hasher.update(payload);
    let actual_crc = hasher.finalize();

    if actual_crc != expected_crc {
        return Err(StoreError::Corruption(format!(
            "offset {}: CRC mismatch: expected {:08x}, got {:08x}",
            offset, expected_crc, actual_crc
        )));
    }

    let frame: LogFrame = bincode::deserialize(payload).map_err(|e| {
        StoreError::Corruption(format!("offset {}: undecodable frame: {}", offset, e))
    })?;

    let expected_tag = type_tag(&frame);
    if tag != expected_tag {
        return Err(StoreError::Corruption(format!(
            "offset {}: type tag mismatch: expected {}, got {}",
            offset, expected_tag, tag
        )));
    }

    Ok(Some((frame, 4 + total_len)))
}

/// Result of scanning a whole file body
#[derive(Debug, Default)]
pub struct DecodedFrames {
    /// Frames in file order
    pub frames: Vec<LogFrame>,
    /// Bytes of valid frames (from the start of the body)
    pub valid_len: usize,
    /// Whether a partial frame followed the last valid one
    pub torn_tail: bool,
}

/// Decode every frame in a file body (the bytes after the header)
pub fn decode_frames(body: &[u8], base_offset: u64) -> StoreResult<DecodedFrames> {
    let mut decoded = DecodedFrames::default();
    let mut pos = 0usize;
    while pos < body.len() {
        match decode_frame(&body[pos..], base_offset + pos as u64)? {
            Some((frame, consumed)) => {
                decoded.frames.push(frame);
                pos += consumed;
            }
            None => {
                decoded.torn_tail = true;
                break;
            }
        }
    }
    decoded.valid_len = pos;
    Ok(decoded)
}
