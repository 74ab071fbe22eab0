//! Write-ahead journal of change batches.
//!
//! Every batch is appended (and fsynced) before the file backend touches any
//! item file, then marked committed once all files are in place, or rolled
//! back once a failed apply has been undone. Batches still pending on open
//! are replayed by the backend.

use super::ChangeSet;
use crate::error::{Result, StateError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"JNL\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

/// Header size (magic + version).
const HEADER_SIZE: u64 = 5;

/// Upper bound on a single encoded entry.
const MAX_ENTRY_BYTES: usize = 256 * 1024 * 1024;

/// Journal entry status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalEntryStatus {
    /// Batch written, not yet fully applied.
    Pending,
    /// Batch fully applied.
    Committed,
    /// Batch failed and its files were restored.
    RolledBack,
}

/// A single journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    pub seq: u64,
    pub status: JournalEntryStatus,
    /// The batch; absent on commit markers.
    pub batch: Option<ChangeSet>,
    /// Seconds since Unix epoch.
    pub timestamp: u64,
}

/// Append-only journal of change batches.
pub struct ChangeJournal {
    path: PathBuf,
    next_seq: Mutex<u64>,
    writer: Mutex<Option<BufWriter<File>>>,
}

impl ChangeJournal {
    /// Create or open a journal file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let next_seq = if path.exists() {
            let file = File::open(&path)?;
            let mut reader = BufReader::new(file);
            Self::read_header(&mut reader)?;

            let mut max_seq = 0u64;
            while let Ok(entry) = Self::read_entry(&mut reader) {
                max_seq = max_seq.max(entry.seq);
            }
            max_seq + 1
        } else {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;
            1
        };

        let writer = BufWriter::new(OpenOptions::new().append(true).open(&path)?);

        Ok(Self {
            path,
            next_seq: Mutex::new(next_seq),
            writer: Mutex::new(Some(writer)),
        })
    }

    /// Append a pending batch; returns its sequence number.
    pub fn log(&self, batch: &ChangeSet) -> Result<u64> {
        let mut next_seq = self.next_seq.lock();
        let seq = *next_seq;
        *next_seq += 1;

        let entry = JournalEntry {
            seq,
            status: JournalEntryStatus::Pending,
            batch: Some(batch.clone()),
            timestamp: now_secs(),
        };
        self.append(&entry)?;
        Ok(seq)
    }

    /// Mark a batch as fully applied.
    pub fn commit(&self, seq: u64) -> Result<()> {
        self.mark(seq, JournalEntryStatus::Committed)
    }

    /// Mark a batch as undone; it will not be replayed.
    pub fn roll_back(&self, seq: u64) -> Result<()> {
        self.mark(seq, JournalEntryStatus::RolledBack)
    }

    fn mark(&self, seq: u64, status: JournalEntryStatus) -> Result<()> {
        let marker = JournalEntry {
            seq,
            status,
            batch: None,
            timestamp: now_secs(),
        };
        self.append(&marker)
    }

    /// Pending batches in sequence order.
    pub fn pending_entries(&self) -> Result<Vec<JournalEntry>> {
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(HEADER_SIZE))?;
        let mut reader = BufReader::new(file);

        let mut entries = HashMap::new();
        let mut resolved = HashSet::new();

        // A torn tail entry ends the scan.
        while let Ok(entry) = Self::read_entry(&mut reader) {
            match entry.status {
                JournalEntryStatus::Committed | JournalEntryStatus::RolledBack => {
                    resolved.insert(entry.seq);
                }
                JournalEntryStatus::Pending => {
                    entries.insert(entry.seq, entry);
                }
            }
        }

        let mut pending: Vec<_> = entries
            .into_iter()
            .filter(|(seq, _)| !resolved.contains(seq))
            .map(|(_, entry)| entry)
            .collect();
        pending.sort_by_key(|e| e.seq);
        Ok(pending)
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(!self.pending_entries()?.is_empty())
    }

    /// Truncate the journal once every batch in it is applied.
    pub fn clear(&self) -> Result<()> {
        let mut writer = self.writer.lock();
        *writer = None;

        let mut file = OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(JOURNAL_MAGIC)?;
        file.write_all(&[JOURNAL_VERSION])?;
        file.sync_all()?;

        *writer = Some(BufWriter::new(
            OpenOptions::new().append(true).open(&self.path)?,
        ));
        *self.next_seq.lock() = 1;
        Ok(())
    }

    fn append(&self, entry: &JournalEntry) -> Result<()> {
        let mut writer = self.writer.lock();
        let w = writer
            .as_mut()
            .ok_or_else(|| StateError::Persistence("journal is closed".into()))?;
        Self::write_entry(w, entry)?;
        w.flush()?;
        w.get_ref().sync_all()?;
        Ok(())
    }

    fn read_header(reader: &mut impl Read) -> Result<()> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != JOURNAL_MAGIC {
            return Err(StateError::InvalidFormat("Invalid journal magic".into()));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != JOURNAL_VERSION {
            return Err(StateError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn write_entry(writer: &mut impl Write, entry: &JournalEntry) -> Result<()> {
        let encoded = rmp_serde::to_vec(entry)?;
        writer.write_all(&(encoded.len() as u32).to_le_bytes())?;
        writer.write_all(&encoded)?;
        writer.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        Ok(())
    }

    fn read_entry(reader: &mut impl Read) -> Result<JournalEntry> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_ENTRY_BYTES {
            return Err(StateError::Corruption("journal entry too large".into()));
        }

        let mut encoded = vec![0u8; len];
        reader.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        reader.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(StateError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::ItemState;
    use crate::types::{ItemId, NodeId};
    use tempfile::TempDir;

    fn batch() -> ChangeSet {
        ChangeSet {
            added: vec![ItemState::new_node(NodeId::generate(), "nt:base".into(), None)],
            ..Default::default()
        }
    }

    #[test]
    fn test_log_and_commit() {
        let dir = TempDir::new().unwrap();
        let journal = ChangeJournal::open(dir.path().join("journal")).unwrap();

        let seq = journal.log(&batch()).unwrap();
        assert_eq!(seq, 1);
        assert_eq!(journal.pending_entries().unwrap().len(), 1);

        journal.commit(seq).unwrap();
        assert!(!journal.has_pending().unwrap());
    }

    #[test]
    fn test_pending_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");
        let node = NodeId::generate();

        {
            let journal = ChangeJournal::open(&path).unwrap();
            journal
                .log(&ChangeSet {
                    deleted: vec![ItemId::Node(node)],
                    ..Default::default()
                })
                .unwrap();
        }

        let journal = ChangeJournal::open(&path).unwrap();
        let pending = journal.pending_entries().unwrap();
        assert_eq!(pending.len(), 1);
        let batch = pending[0].batch.as_ref().unwrap();
        assert_eq!(batch.deleted, vec![ItemId::Node(node)]);

        // Sequence continues after the recovered entry.
        assert_eq!(journal.log(&batch.clone()).unwrap(), 2);
    }

    #[test]
    fn test_commit_out_of_order() {
        let dir = TempDir::new().unwrap();
        let journal = ChangeJournal::open(dir.path().join("journal")).unwrap();
        let one = journal.log(&batch()).unwrap();
        let two = journal.log(&batch()).unwrap();
        let three = journal.log(&batch()).unwrap();

        journal.commit(three).unwrap();
        journal.commit(one).unwrap();

        let pending = journal.pending_entries().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, two);
    }

    #[test]
    fn test_rolled_back_batch_not_pending() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");
        {
            let journal = ChangeJournal::open(&path).unwrap();
            let failed = journal.log(&batch()).unwrap();
            journal.log(&batch()).unwrap();
            journal.roll_back(failed).unwrap();
        }

        let journal = ChangeJournal::open(&path).unwrap();
        let pending = journal.pending_entries().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].seq, 2);
    }

    #[test]
    fn test_clear_resets_sequence() {
        let dir = TempDir::new().unwrap();
        let journal = ChangeJournal::open(dir.path().join("journal")).unwrap();
        journal.log(&batch()).unwrap();
        journal.clear().unwrap();

        assert!(!journal.has_pending().unwrap());
        assert_eq!(journal.log(&batch()).unwrap(), 1);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("journal");
        std::fs::write(&path, b"NOPE\x01").unwrap();
        assert!(matches!(
            ChangeJournal::open(&path),
            Err(StateError::InvalidFormat(_))
        ));
    }
}
