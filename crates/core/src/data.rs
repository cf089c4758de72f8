//! Persistable data codec
//!
//! An item's durable representation is a list of opaque byte slices. This
//! module defines the slice type and the framing used when a slice list is
//! stored as one buffer.
//!
//! ## Frame Format
//!
//! ```text
//! [count: u32][len: u32][bytes]...[len: u32][bytes][crc32: u32]
//! ```
//!
//! - **count**: number of slices that follow
//! - **len/bytes**: one entry per slice
//! - **crc32**: CRC32 over everything before it
//!
//! All integers are little-endian.

use crate::error::{StoreError, StoreResult};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read};

/// One opaque slice of an item's persistent data
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct DataSlice(Vec<u8>);

impl DataSlice {
    /// Wrap an owned buffer
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Borrow the bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Take the bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the slice is empty
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for DataSlice {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for DataSlice {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl From<&str> for DataSlice {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

/// Persistent data of one item
pub type PersistentData = Vec<DataSlice>;

/// Total payload size of a slice list (excluding framing)
pub fn data_size(slices: &[DataSlice]) -> usize {
    slices.iter().map(DataSlice::len).sum()
}

/// Encode a slice list into one framed buffer
pub fn encode_slices(slices: &[DataSlice]) -> Vec<u8> {
    let body_len: usize = slices.iter().map(|s| 4 + s.len()).sum();
    let mut buf = Vec::with_capacity(4 + body_len + 4);

    // Writes into a Vec cannot fail
    let _ = buf.write_u32::<LittleEndian>(slices.len() as u32);
    for slice in slices {
        let _ = buf.write_u32::<LittleEndian>(slice.len() as u32);
        buf.extend_from_slice(slice.as_bytes());
    }

    let mut hasher = Hasher::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    let _ = buf.write_u32::<LittleEndian>(crc);
    buf
}

/// Decode a framed buffer produced by [`encode_slices`]
///
/// # Errors
///
/// Returns `StoreError::Corruption` if the buffer is truncated, has
/// trailing bytes, or fails its CRC check.
pub fn decode_slices(buf: &[u8]) -> StoreResult<PersistentData> {
    if buf.len() < 8 {
        return Err(StoreError::Corruption(format!(
            "data frame too short: {} bytes (minimum 8)",
            buf.len()
        )));
    }

    let (body, crc_bytes) = buf.split_at(buf.len() - 4);
    let mut crc_cursor = Cursor::new(crc_bytes);
    let expected_crc = crc_cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| StoreError::Corruption(format!("unreadable data frame CRC: {}", e)))?;

    let mut hasher = Hasher::new();
    hasher.update(body);
    let actual_crc = hasher.finalize();
    if expected_crc != actual_crc {
        return Err(StoreError::Corruption(format!(
            "data frame CRC mismatch: expected {:08x}, got {:08x}",
            expected_crc, actual_crc
        )));
    }

    let mut cursor = Cursor::new(body);
    let count = cursor
        .read_u32::<LittleEndian>()
        .map_err(|e| StoreError::Corruption(format!("unreadable slice count: {}", e)))?;

    let mut slices = Vec::with_capacity(count.min(1024) as usize);
    for index in 0..count {
        let len = cursor.read_u32::<LittleEndian>().map_err(|e| {
            StoreError::Corruption(format!("unreadable length of slice {}: {}", index, e))
        })? as usize;
        let remaining = body.len() - cursor.position() as usize;
        if len > remaining {
            return Err(StoreError::Corruption(format!(
                "slice {} declares {} bytes but only {} remain",
                index, len, remaining
            )));
        }
        let mut bytes = vec![0u8; len];
        cursor
            .read_exact(&mut bytes)
            .map_err(|e| StoreError::Corruption(format!("truncated slice {}: {}", index, e)))?;
        slices.push(DataSlice::new(bytes));
    }

    if cursor.position() as usize != body.len() {
        return Err(StoreError::Corruption(format!(
            "{} trailing bytes after {} slices",
            body.len() - cursor.position() as usize,
            count
        )));
    }

    Ok(slices)
}
