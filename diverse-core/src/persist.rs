//! Snapshot persistence for save/load.
//!
//! All identity→preset assignments are written into the host's save file as
//! one framed record:
//!
//! ```text
//! ┌────────────┬─────────────┬────────────┬────────────────────────┐
//! │ tag "DBRD" │ version u32 │ length u32 │ payload (length bytes) │
//! └────────────┴─────────────┴────────────┴────────────────────────┘
//! payload = zlib(JSON records) ++ uncompressed length (u32 LE)
//! ```
//!
//! Integers are little-endian. The JSON is an array of
//! `{"formID": <u32>, "preset": ["id", ...]}`.

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::path::Path;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Record tag identifying snapshot data.
pub const RECORD_TAG: [u8; 4] = *b"DBRD";

/// Current snapshot format version.
pub const SNAPSHOT_VERSION: u32 = 1;

const HEADER_BYTES: usize = 4 + 4 + 4;
const TRAILER_BYTES: usize = 4;

/// Refuse to inflate snapshots claiming more than this.
pub const MAX_SNAPSHOT_BYTES: u32 = 64 * 1024 * 1024;

/// Errors from snapshot encoding and decoding.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unexpected record tag {found:?}")]
    TagMismatch { found: [u8; 4] },

    #[error("Version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    #[error("snapshot truncated: {0}")]
    Truncated(&'static str),

    #[error("decompressed size mismatch: expected {expected}, found {found}")]
    LengthMismatch { expected: usize, found: usize },

    #[error("snapshot too large: {0} bytes")]
    TooLarge(u64),

    #[error("corrupt compressed stream: {0}")]
    Compression(std::io::Error),
}

/// One character's persisted assignment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SnapshotRecord {
    #[serde(rename = "formID")]
    pub form_id: u32,
    #[serde(rename = "preset")]
    pub presets: Vec<String>,
}

impl SnapshotRecord {
    pub fn new(form_id: u32, presets: Vec<String>) -> Self {
        Self { form_id, presets }
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode records into a framed, compressed snapshot.
pub fn encode(records: &[SnapshotRecord]) -> Result<Vec<u8>, PersistError> {
    let json = serde_json::to_vec(records)?;
    let raw_len = u32::try_from(json.len()).map_err(|_| PersistError::TooLarge(json.len() as u64))?;

    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let mut payload = encoder.finish()?;
    payload.extend_from_slice(&raw_len.to_le_bytes());

    let payload_len =
        u32::try_from(payload.len()).map_err(|_| PersistError::TooLarge(payload.len() as u64))?;
    let mut bytes = Vec::with_capacity(HEADER_BYTES + payload.len());
    bytes.extend_from_slice(&RECORD_TAG);
    bytes.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&payload_len.to_le_bytes());
    bytes.extend_from_slice(&payload);
    Ok(bytes)
}

// ============================================================================
// Decoding
// ============================================================================

/// Decode a snapshot, logging and returning no records on any failure.
pub fn decode(bytes: &[u8]) -> Vec<SnapshotRecord> {
    match try_decode(bytes) {
        Ok(records) => records,
        Err(err) => {
            warn!(error = %err, "discarding unreadable snapshot");
            Vec::new()
        }
    }
}

/// Decode a snapshot, reporting why it could not be read.
///
/// A record or payload no longer than the size trailer means "no data" and
/// decodes to an empty list.
pub fn try_decode(bytes: &[u8]) -> Result<Vec<SnapshotRecord>, PersistError> {
    if bytes.len() <= TRAILER_BYTES {
        debug!(len = bytes.len(), "snapshot record holds no data");
        return Ok(Vec::new());
    }
    let tag = read_tag(bytes, 0)?;
    if tag != RECORD_TAG {
        return Err(PersistError::TagMismatch { found: tag });
    }
    let version = read_u32_le(bytes, 4)?;
    if version != SNAPSHOT_VERSION {
        return Err(PersistError::VersionMismatch {
            expected: SNAPSHOT_VERSION,
            found: version,
        });
    }
    let length = read_u32_le(bytes, 8)? as usize;
    let payload = bytes
        .get(HEADER_BYTES..HEADER_BYTES + length)
        .ok_or(PersistError::Truncated("payload shorter than declared length"))?;

    if payload.len() <= TRAILER_BYTES {
        debug!("snapshot holds no data");
        return Ok(Vec::new());
    }

    let split = payload.len() - TRAILER_BYTES;
    let expected = read_u32_le(payload, split)?;
    if expected > MAX_SNAPSHOT_BYTES {
        return Err(PersistError::TooLarge(u64::from(expected)));
    }
    let expected = expected as usize;

    let mut json = Vec::with_capacity(expected);
    ZlibDecoder::new(&payload[..split])
        // One extra byte detects streams longer than the trailer claims.
        .take(expected as u64 + 1)
        .read_to_end(&mut json)
        .map_err(PersistError::Compression)?;
    if json.len() != expected {
        return Err(PersistError::LengthMismatch {
            expected,
            found: json.len(),
        });
    }

    Ok(serde_json::from_slice(&json)?)
}

fn read_tag(bytes: &[u8], offset: usize) -> Result<[u8; 4], PersistError> {
    let slice = bytes
        .get(offset..offset + 4)
        .ok_or(PersistError::Truncated("record header"))?;
    let mut out = [0_u8; 4];
    out.copy_from_slice(slice);
    Ok(out)
}

fn read_u32_le(bytes: &[u8], offset: usize) -> Result<u32, PersistError> {
    Ok(u32::from_le_bytes(read_tag(bytes, offset)?))
}

// ============================================================================
// Files
// ============================================================================

/// Write an encoded snapshot to a file.
pub async fn save_snapshot(
    path: impl AsRef<Path>,
    records: &[SnapshotRecord],
) -> Result<(), PersistError> {
    let bytes = encode(records)?;
    fs::write(path, bytes).await?;
    Ok(())
}

/// Read and strictly decode a snapshot file.
pub async fn load_snapshot(path: impl AsRef<Path>) -> Result<Vec<SnapshotRecord>, PersistError> {
    let bytes = fs::read(path).await?;
    try_decode(&bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> Vec<SnapshotRecord> {
        vec![
            SnapshotRecord::new(0x0001_A4D7, vec!["curvy".into(), "hairy".into()]),
            SnapshotRecord::new(0xFF00_0C12, vec!["slim".into()]),
        ]
    }

    #[test]
    fn test_round_trip() {
        let bytes = encode(&sample()).unwrap();
        assert_eq!(&bytes[..4], b"DBRD");
        assert_eq!(decode(&bytes), sample());
    }

    #[test]
    fn test_empty_list_round_trips() {
        let bytes = encode(&[]).unwrap();
        assert!(decode(&bytes).is_empty());
    }

    #[test]
    fn test_payload_within_trailer_width_is_no_data() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&RECORD_TAG);
        bytes.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&4u32.to_le_bytes());
        bytes.extend_from_slice(&[0xAA; 4]);
        assert!(try_decode(&bytes).unwrap().is_empty());
    }

    #[test]
    fn test_record_within_trailer_width_is_no_data() {
        assert!(try_decode(&[]).unwrap().is_empty());
        assert!(try_decode(b"DBR").unwrap().is_empty());
        assert!(decode(&[]).is_empty());
    }

    #[test]
    fn test_trailer_mismatch_discards() {
        let mut bytes = encode(&sample()).unwrap();
        let len = bytes.len();
        let claimed = u32::from_le_bytes(bytes[len - 4..].try_into().unwrap());
        bytes[len - 4..].copy_from_slice(&(claimed + 1).to_le_bytes());
        assert!(matches!(try_decode(&bytes), Err(PersistError::LengthMismatch { .. })));
        assert!(decode(&bytes).is_empty());

        bytes[len - 4..].copy_from_slice(&(claimed - 1).to_le_bytes());
        assert!(matches!(try_decode(&bytes), Err(PersistError::LengthMismatch { .. })));
    }

    #[test]
    fn test_corrupt_stream_discards() {
        let mut bytes = encode(&sample()).unwrap();
        for b in &mut bytes[HEADER_BYTES..HEADER_BYTES + 6] {
            *b ^= 0x5A;
        }
        assert!(try_decode(&bytes).is_err());
        assert!(decode(&bytes).is_empty());
    }

    #[test]
    fn test_wrong_tag_and_version() {
        let mut bytes = encode(&sample()).unwrap();
        bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
        assert!(matches!(
            try_decode(&bytes),
            Err(PersistError::VersionMismatch { expected: 1, found: 2 })
        ));

        let mut bytes = encode(&sample()).unwrap();
        bytes[..4].copy_from_slice(b"XXXX");
        assert!(matches!(try_decode(&bytes), Err(PersistError::TagMismatch { .. })));
    }

    #[test]
    fn test_truncated() {
        let bytes = encode(&sample()).unwrap();
        assert!(matches!(try_decode(&bytes[..6]), Err(PersistError::Truncated(_))));
        assert!(matches!(
            try_decode(&bytes[..bytes.len() - 1]),
            Err(PersistError::Truncated(_))
        ));
    }

    #[test]
    fn test_absurd_trailer_rejected() {
        let mut bytes = encode(&sample()).unwrap();
        let len = bytes.len();
        bytes[len - 4..].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(try_decode(&bytes), Err(PersistError::TooLarge(_))));
    }

    #[test]
    fn test_json_field_names() {
        let json = serde_json::to_string(&sample()[1]).unwrap();
        assert_eq!(json, r#"{"formID":4278193170,"preset":["slim"]}"#);
    }

    #[tokio::test]
    async fn test_file_round_trip() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("snapshot.bin");
        save_snapshot(&path, &sample()).await.unwrap();
        assert_eq!(load_snapshot(&path).await.unwrap(), sample());
    }
}
