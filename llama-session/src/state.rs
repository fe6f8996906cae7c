//! Persisted session state.
//!
//! Layout (little-endian):
//!
//! ```text
//! "LSST" | u16 version | u32 count | count x i32 token | u32 n_past
//!        | u32 span_count | span_count x (u32 start, u32 len)
//!        | u8 has_pending | i32 pending
//!        | u32 snapshot_len | snapshot bytes | u64 xxh3(all preceding bytes)
//! ```
//!
//! Spans are the image positions between history tokens. `pending` is the last
//! token shown to the caller that the engine has not evaluated yet; it is `0`
//! when `has_pending` is `0`.
//!
//! Files are written to a uniquely named temporary file next to the target,
//! synced, then renamed over it, so a crash mid-save leaves the previous state.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tracing::{debug, info};
use xxhash_rust::xxh3::xxh3_64;

use crate::context::ImageSpan;
use crate::engine::TokenId;
use crate::error::SessionError;

pub const STATE_MAGIC: &[u8; 4] = b"LSST";
pub const STATE_VERSION: u16 = 2;

const HEADER_LEN: usize = 4 + 2 + 4;
const CHECKSUM_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionState {
    pub tokens: Vec<TokenId>,
    pub n_past: usize,
    pub image_spans: Vec<ImageSpan>,
    pub pending: Option<TokenId>,
    /// Opaque engine KV state; empty when the engine has none to offer.
    pub engine_snapshot: Vec<u8>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateFormatError {
    #[error("file is truncated")]
    Truncated,
    #[error("not a session state file")]
    BadMagic,
    #[error("unsupported state version {0}")]
    UnsupportedVersion(u16),
    #[error("checksum mismatch")]
    Checksum,
    #[error("{0} unexpected trailing bytes")]
    Trailing(usize),
    #[error("value {0} does not fit the state format")]
    Overflow(usize),
    #[error("invalid pending-token flag {0}")]
    PendingFlag(u8),
}

impl SessionState {
    pub fn encode(&self) -> Result<Bytes, StateFormatError> {
        let count = to_u32(self.tokens.len())?;
        let n_past = to_u32(self.n_past)?;
        let span_count = to_u32(self.image_spans.len())?;
        let snapshot_len = to_u32(self.engine_snapshot.len())?;

        let mut buf = BytesMut::with_capacity(
            HEADER_LEN
                + self.tokens.len() * 4
                + 8
                + self.image_spans.len() * 8
                + 5
                + 4
                + self.engine_snapshot.len()
                + CHECKSUM_LEN,
        );
        buf.put_slice(STATE_MAGIC);
        buf.put_u16_le(STATE_VERSION);
        buf.put_u32_le(count);
        for token in &self.tokens {
            buf.put_i32_le(*token);
        }
        buf.put_u32_le(n_past);
        buf.put_u32_le(span_count);
        for span in &self.image_spans {
            buf.put_u32_le(to_u32(span.start)?);
            buf.put_u32_le(to_u32(span.len)?);
        }
        buf.put_u8(u8::from(self.pending.is_some()));
        buf.put_i32_le(self.pending.unwrap_or(0));
        buf.put_u32_le(snapshot_len);
        buf.put_slice(&self.engine_snapshot);

        let checksum = xxh3_64(&buf);
        buf.put_u64_le(checksum);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, StateFormatError> {
        if data.len() < HEADER_LEN + CHECKSUM_LEN {
            return Err(StateFormatError::Truncated);
        }
        let (body, mut trailer) = data.split_at(data.len() - CHECKSUM_LEN);

        let mut buf = body;
        if &buf[..4] != STATE_MAGIC {
            return Err(StateFormatError::BadMagic);
        }
        buf.advance(4);
        let version = buf.get_u16_le();
        if version != STATE_VERSION {
            return Err(StateFormatError::UnsupportedVersion(version));
        }
        if trailer.get_u64_le() != xxh3_64(body) {
            return Err(StateFormatError::Checksum);
        }

        let count = buf.get_u32_le() as usize;
        need(&buf, count.saturating_mul(4).saturating_add(8))?;
        let tokens = (0..count).map(|_| buf.get_i32_le()).collect();
        let n_past = buf.get_u32_le() as usize;

        let span_count = buf.get_u32_le() as usize;
        need(&buf, span_count.saturating_mul(8).saturating_add(5 + 4))?;
        let image_spans = (0..span_count)
            .map(|_| ImageSpan {
                start: buf.get_u32_le() as usize,
                len: buf.get_u32_le() as usize,
            })
            .collect();
        let pending = match (buf.get_u8(), buf.get_i32_le()) {
            (0, _) => None,
            (1, token) => Some(token),
            (flag, _) => return Err(StateFormatError::PendingFlag(flag)),
        };

        let snapshot_len = buf.get_u32_le() as usize;
        if buf.remaining() < snapshot_len {
            return Err(StateFormatError::Truncated);
        }
        let engine_snapshot = buf[..snapshot_len].to_vec();
        buf.advance(snapshot_len);
        if buf.has_remaining() {
            return Err(StateFormatError::Trailing(buf.remaining()));
        }

        Ok(Self {
            tokens,
            n_past,
            image_spans,
            pending,
            engine_snapshot,
        })
    }
}

fn to_u32(value: usize) -> Result<u32, StateFormatError> {
    u32::try_from(value).map_err(|_| StateFormatError::Overflow(value))
}

fn need(buf: &[u8], len: usize) -> Result<(), StateFormatError> {
    if buf.remaining() < len {
        return Err(StateFormatError::Truncated);
    }
    Ok(())
}

/// Reads and writes one state file.
#[derive(Debug, Clone)]
pub struct SessionStateStore {
    path: PathBuf,
}

impl SessionStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// `Ok(None)` when no file exists. Unreadable or corrupt files are errors.
    pub fn load(&self) -> Result<Option<SessionState>, SessionError> {
        if !self.path.exists() {
            debug!("No session state at {}", self.path.display());
            return Ok(None);
        }
        let data = fs::read(&self.path).map_err(|e| SessionError::state_io(&self.path, e))?;
        let state = SessionState::decode(&data).map_err(|e| SessionError::state_io(&self.path, e))?;
        info!(
            "Loaded session state from {}: {} tokens, n_past {}",
            self.path.display(),
            state.tokens.len(),
            state.n_past
        );
        Ok(Some(state))
    }

    pub fn save(&self, state: &SessionState) -> Result<(), SessionError> {
        let encoded = state
            .encode()
            .map_err(|e| SessionError::state_io(&self.path, e))?;

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir).map_err(|e| SessionError::state_io(&dir, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "session".to_string());
        let temp_file = dir.join(format!("{}.tmp.{}", file_name, ulid::Ulid::new()));
        debug!("Writing session state to temp file {}", temp_file.display());

        let write = || -> std::io::Result<()> {
            let mut file = fs::File::create(&temp_file)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
            fs::rename(&temp_file, &self.path)
        };
        if let Err(e) = write() {
            let _ = fs::remove_file(&temp_file);
            return Err(SessionError::state_io(&self.path, e));
        }

        info!(
            "Saved session state to {}: {} tokens, n_past {}",
            self.path.display(),
            state.tokens.len(),
            state.n_past
        );
        Ok(())
    }

    pub fn remove(&self) -> Result<(), SessionError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SessionError::state_io(&self.path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample() -> SessionState {
        SessionState {
            tokens: vec![0, 17, 42, -1, 9],
            n_past: 7,
            image_spans: vec![ImageSpan { start: 1, len: 2 }],
            pending: Some(42),
            engine_snapshot: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_empty_history_is_valid() {
        let state = SessionState::default();
        let decoded = SessionState::decode(&state.encode().unwrap()).unwrap();
        assert!(decoded.tokens.is_empty());
        assert_eq!(decoded.n_past, 0);
    }

    #[test]
    fn test_layout_is_little_endian() {
        let state = SessionState {
            tokens: vec![258],
            n_past: 1,
            ..Default::default()
        };
        let bytes = state.encode().unwrap();
        assert_eq!(&bytes[..4], b"LSST");
        assert_eq!(&bytes[4..6], &[2, 0]);
        assert_eq!(&bytes[6..10], &[1, 0, 0, 0]);
        assert_eq!(&bytes[10..14], &[2, 1, 0, 0]);
        assert_eq!(&bytes[14..18], &[1, 0, 0, 0]);
        // no spans, no pending token
        assert_eq!(&bytes[18..22], &[0, 0, 0, 0]);
        assert_eq!(&bytes[22..27], &[0, 0, 0, 0, 0]);
        assert_eq!(bytes.len(), 4 + 2 + 4 + 4 + 4 + 4 + 1 + 4 + 4 + 8);
    }

    #[test]
    fn test_spans_and_pending_survive_encoding() {
        let decoded = SessionState::decode(&sample().encode().unwrap()).unwrap();
        assert_eq!(decoded.image_spans, vec![ImageSpan { start: 1, len: 2 }]);
        assert_eq!(decoded.pending, Some(42));
    }

    #[test]
    fn test_invalid_pending_flag_is_rejected() {
        let mut bytes = SessionState::default().encode().unwrap().to_vec();
        // header, n_past and span count precede the flag
        bytes[18] = 7;
        let body = bytes.len() - CHECKSUM_LEN;
        let checksum = xxh3_64(&bytes[..body]).to_le_bytes();
        bytes[body..].copy_from_slice(&checksum);
        assert_eq!(SessionState::decode(&bytes), Err(StateFormatError::PendingFlag(7)));
    }

    #[test]
    fn test_corruption_is_detected() {
        let bytes = sample().encode().unwrap().to_vec();

        let mut flipped = bytes.clone();
        flipped[12] ^= 0x40;
        assert_eq!(SessionState::decode(&flipped), Err(StateFormatError::Checksum));

        let mut magic = bytes.clone();
        magic[0] = b'X';
        assert_eq!(SessionState::decode(&magic), Err(StateFormatError::BadMagic));

        assert_eq!(SessionState::decode(&bytes[..6]), Err(StateFormatError::Truncated));
    }

    #[test]
    fn test_store_roundtrip_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let store = SessionStateStore::new(dir.path().join("nested").join("session.state"));
        assert!(store.load().unwrap().is_none());

        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));

        let leftovers: Vec<_> = fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());

        store.remove().unwrap();
        assert!(!store.exists());
        store.remove().unwrap();
    }

    #[test]
    fn test_store_reports_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("session.state");
        fs::write(&path, b"garbage that is long enough").unwrap();
        let err = SessionStateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, SessionError::StateIo { .. }));
    }
}
