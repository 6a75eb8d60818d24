//! Write-ahead log for change batches.
//!
//! A mutation is only acknowledged once its change batch is in this log;
//! the publisher commits the entry after the diffs went out. Entries still
//! pending when the process dies are replayed on the next open.

use crate::error::{LiveQueryError, Result};
use crate::types::ChangeEvent;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

/// Magic bytes for WAL file.
const WAL_MAGIC: &[u8; 4] = b"WAL\0";

/// Current WAL format version.
const WAL_VERSION: u8 = 2;

/// Length of magic plus version.
const HEADER_LEN: u64 = 5;

/// Changes committed together to one entity type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub entity_key: String,
    pub changes: Vec<ChangeEvent>,
}

impl ChangeBatch {
    pub fn new(entity_key: impl Into<String>, changes: Vec<ChangeEvent>) -> Self {
        Self {
            entity_key: entity_key.into(),
            changes,
        }
    }
}

/// A single WAL entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
enum WalEntry {
    Pending {
        seq: u64,
        batch: ChangeBatch,
        timestamp: u64,
    },
    Committed {
        seq: u64,
    },
}

struct WalState {
    next_seq: u64,
    writer: BufWriter<File>,
    /// Logged but not yet committed.
    outstanding: BTreeSet<u64>,
}

/// Write-ahead log of change batches.
pub struct WriteAheadLog {
    path: PathBuf,
    state: Mutex<WalState>,
}

impl WriteAheadLog {
    /// Create or open a WAL file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let (next_seq, outstanding) = if path.exists() {
            let pending = Self::read_pending(&path)?;
            let max_seq = pending.keys().next_back().copied().unwrap_or(0);
            (max_seq + 1, pending.into_keys().collect())
        } else {
            Self::write_header(&path)?;
            (1, BTreeSet::new())
        };

        if !outstanding.is_empty() {
            info!(path = %path.display(), pending = outstanding.len(), "wal has uncommitted change batches");
        }

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);
        Ok(Self {
            path,
            state: Mutex::new(WalState {
                next_seq,
                writer,
                outstanding,
            }),
        })
    }

    /// Durably log a batch. Returns its sequence number.
    pub fn log(&self, batch: &ChangeBatch) -> Result<u64> {
        let mut state = self.state.lock();
        let seq = state.next_seq;

        let entry = WalEntry::Pending {
            seq,
            batch: batch.clone(),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
        };
        Self::write_entry(&mut state.writer, &entry)?;
        state.writer.flush()?;
        state.writer.get_ref().sync_all()?;

        state.next_seq += 1;
        state.outstanding.insert(seq);
        Ok(seq)
    }

    /// Mark an entry as committed. Once nothing is outstanding the file is
    /// truncated back to its header.
    pub fn commit(&self, seq: u64) -> Result<()> {
        let mut state = self.state.lock();
        if !state.outstanding.remove(&seq) {
            return Ok(());
        }

        if state.outstanding.is_empty() {
            debug!(seq, "wal drained, truncating");
            return self.reset(&mut state);
        }

        Self::write_entry(&mut state.writer, &WalEntry::Committed { seq })?;
        state.writer.flush()?;
        state.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Batches logged but never committed, in sequence order.
    pub fn pending(&self) -> Result<Vec<(u64, ChangeBatch)>> {
        let _state = self.state.lock();
        Ok(Self::read_pending(&self.path)?.into_iter().collect())
    }

    pub fn has_pending(&self) -> bool {
        !self.state.lock().outstanding.is_empty()
    }

    /// Drop every entry, committed or not.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.outstanding.clear();
        self.reset(&mut state)
    }

    fn reset(&self, state: &mut WalState) -> Result<()> {
        state.writer.flush()?;
        Self::write_header(&self.path)?;
        state.writer = BufWriter::new(OpenOptions::new().append(true).open(&self.path)?);
        state.next_seq = 1;
        Ok(())
    }

    fn write_header(path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(WAL_MAGIC)?;
        file.write_all(&[WAL_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn read_pending(path: &Path) -> Result<BTreeMap<u64, ChangeBatch>> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != WAL_MAGIC {
            return Err(LiveQueryError::InvalidFormat("Invalid WAL magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != WAL_VERSION {
            return Err(LiveQueryError::InvalidFormat(format!(
                "Unsupported WAL version: {}",
                version[0]
            )));
        }

        file.seek(SeekFrom::Start(HEADER_LEN))?;
        let mut reader = BufReader::new(file);
        let mut pending = BTreeMap::new();

        // A torn write at the tail ends the scan.
        while let Ok(entry) = Self::read_entry(&mut reader) {
            match entry {
                WalEntry::Pending { seq, batch, .. } => {
                    pending.insert(seq, batch);
                }
                WalEntry::Committed { seq } => {
                    pending.remove(&seq);
                }
            }
        }

        Ok(pending)
    }

    fn write_entry(writer: &mut BufWriter<File>, entry: &WalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec_named(entry)?;

        let len = encoded.len() as u32;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;

        Ok(())
    }

    fn read_entry(reader: &mut BufReader<File>) -> Result<WalEntry> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > 100 * 1024 * 1024 {
            return Err(LiveQueryError::Corruption("WAL entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(LiveQueryError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}
