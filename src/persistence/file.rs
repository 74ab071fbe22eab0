//! Directory-backed persistence.
//!
//! Layout under the base path:
//! - `MANIFEST`: magic + format version
//! - `.lock`: held exclusively while open
//! - `journal`: write-ahead [`ChangeJournal`]
//! - `items/<shard>/<hash>` and `refs/<shard>/<hash>`: one file per record,
//!   named by the SHA-256 of its identity, sharded on the first byte

use super::{ChangeJournal, ChangeSet, PersistenceManager};
use crate::changelog::ChangeLog;
use crate::config::FilePersistenceConfig;
use crate::error::{Result, StateError};
use crate::state::{ItemState, ItemStatus, NodeReferences, SharedItem};
use crate::types::{ItemId, NodeReferencesId};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Magic bytes for the manifest.
const MANIFEST_MAGIC: &[u8; 4] = b"TST\0";

/// Current workspace format version.
const MANIFEST_VERSION: u8 = 1;

/// Magic bytes for item files.
const ITEM_MAGIC: &[u8; 4] = b"ITM\0";

/// Magic bytes for reference record files.
const REFS_MAGIC: &[u8; 4] = b"REF\0";

/// Current record file format version.
const RECORD_VERSION: u8 = 1;

/// Record header size (magic + version + payload length).
const RECORD_HEADER_SIZE: u64 = 4 + 1 + 8;

/// Record trailer size (CRC32 of the payload).
const RECORD_TRAILER_SIZE: u64 = 4;

/// File contents before a batch touched them; `None` if absent.
type BeforeImages = Vec<(PathBuf, Option<Vec<u8>>)>;

/// File-per-record backend with a write-ahead journal.
pub struct FilePersistenceManager {
    config: FilePersistenceConfig,
    _lock_file: File,
    journal: ChangeJournal,
    /// Serializes batch application.
    write_lock: Mutex<()>,
}

impl FilePersistenceManager {
    /// Open an existing workspace directory or create a new one.
    pub fn open_or_create(config: FilePersistenceConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StateError::Persistence(format!(
                "no workspace at {}",
                config.path.display()
            )))
        }
    }

    /// Create a new workspace directory.
    pub fn create(config: FilePersistenceConfig) -> Result<Self> {
        fs::create_dir_all(config.path.join("items"))?;
        fs::create_dir_all(config.path.join("refs"))?;
        Self::write_manifest(&config.path)?;
        Self::open(config)
    }

    /// Open an existing workspace, replaying any unfinished batches.
    pub fn open(config: FilePersistenceConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;
        let journal = ChangeJournal::open(config.path.join("journal"))?;

        let manager = Self {
            config,
            _lock_file: lock_file,
            journal,
            write_lock: Mutex::new(()),
        };
        manager.recover()?;
        Ok(manager)
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    fn recover(&self) -> Result<()> {
        let pending = self.journal.pending_entries()?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(batches = pending.len(), "replaying unfinished change batches");
        for entry in &pending {
            if let Some(batch) = &entry.batch {
                self.apply(batch)?;
            }
            self.journal.commit(entry.seq)?;
        }
        self.journal.clear()
    }

    fn apply(&self, batch: &ChangeSet) -> Result<()> {
        for state in batch.written() {
            let mut state = state.clone();
            state.set_status(ItemStatus::Existing);
            self.write_record(&self.item_path(state.id()), ITEM_MAGIC, &state)?;
        }
        for id in &batch.deleted {
            remove_if_exists(&self.item_path(id))?;
        }
        for refs in &batch.references {
            let path = self.refs_path(&refs.id());
            if refs.has_references() {
                self.write_record(&path, REFS_MAGIC, refs)?;
            } else {
                remove_if_exists(&path)?;
            }
        }
        Ok(())
    }

    /// Snapshot every file `batch` will write or remove.
    fn capture(&self, batch: &ChangeSet) -> Result<BeforeImages> {
        let paths = batch
            .written()
            .map(|state| self.item_path(state.id()))
            .chain(batch.deleted.iter().map(|id| self.item_path(id)))
            .chain(batch.references.iter().map(|refs| self.refs_path(&refs.id())));

        let mut images = Vec::new();
        for path in paths {
            let contents = match fs::read(&path) {
                Ok(bytes) => Some(bytes),
                Err(e) if e.kind() == ErrorKind::NotFound => None,
                Err(e) => return Err(e.into()),
            };
            images.push((path, contents));
        }
        Ok(images)
    }

    fn restore(&self, images: &BeforeImages) -> Result<()> {
        for (path, contents) in images.iter().rev() {
            match contents {
                Some(bytes) => self.write_file(path, bytes)?,
                None => remove_if_exists(path)?,
            }
        }
        Ok(())
    }

    /// Put back the files of a failed batch and mark it rolled back.
    /// If that fails the entry stays pending and is replayed on open.
    fn undo(&self, seq: u64, images: &BeforeImages) {
        match self.restore(images).and_then(|()| self.journal.roll_back(seq)) {
            Ok(()) => warn!(seq, "rolled back failed change batch"),
            Err(e) => error!(seq, error = %e, "could not roll back change batch, leaving it pending"),
        }
    }

    fn item_path(&self, id: &ItemId) -> PathBuf {
        let key = match id {
            ItemId::Node(node) => format!("n:{}", node),
            ItemId::Property(prop) => format!("p:{}/{}", prop.parent, prop.name),
        };
        self.record_path("items", &key)
    }

    fn refs_path(&self, id: &NodeReferencesId) -> PathBuf {
        self.record_path("refs", &format!("r:{}", id.target()))
    }

    fn record_path(&self, kind: &str, key: &str) -> PathBuf {
        let digest = Sha256::digest(key.as_bytes());
        let name = hex::encode(digest);
        self.config.path.join(kind).join(&name[..2]).join(name)
    }

    fn write_record<T: Serialize>(&self, path: &Path, magic: &[u8; 4], value: &T) -> Result<()> {
        let payload = rmp_serde::to_vec(value)?;
        let mut bytes = Vec::with_capacity(payload.len() + 17);
        bytes.extend_from_slice(magic);
        bytes.push(RECORD_VERSION);
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
        self.write_file(path, &bytes)
    }

    /// Write to a sibling temp file, then rename over `path`.
    fn write_file(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = path.with_extension("tmp");
        if let Err(e) = write_then_rename(&tmp, path, bytes, self.config.sync_writes) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Read a record file; `Ok(None)` if it doesn't exist.
    fn read_record<T: DeserializeOwned>(&self, path: &Path, magic: &[u8; 4]) -> Result<Option<T>> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut header = [0u8; 4];
        file.read_exact(&mut header)?;
        if &header != magic {
            return Err(StateError::InvalidFormat(format!(
                "Invalid record magic in {}",
                path.display()
            )));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != RECORD_VERSION {
            return Err(StateError::InvalidFormat(format!(
                "Unsupported record version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        let available = file
            .metadata()?
            .len()
            .saturating_sub(RECORD_HEADER_SIZE + RECORD_TRAILER_SIZE);
        if len > available {
            return Err(StateError::Corruption(format!(
                "record length {} exceeds file size in {}",
                len,
                path.display()
            )));
        }

        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&payload);
        if expected != got {
            return Err(StateError::ChecksumMismatch { expected, got });
        }

        Ok(Some(rmp_serde::from_slice(&payload)?))
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(MANIFEST_MAGIC)?;
        file.write_all(&[MANIFEST_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;
        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != MANIFEST_MAGIC {
            return Err(StateError::InvalidFormat("Invalid workspace magic".into()));
        }
        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != MANIFEST_VERSION {
            return Err(StateError::InvalidFormat(format!(
                "Unsupported workspace version: {}",
                version[0]
            )));
        }
        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(".lock"))?;
        lock_file.try_lock_exclusive().map_err(|_| StateError::Locked)?;
        Ok(lock_file)
    }
}

impl PersistenceManager for FilePersistenceManager {
    fn load(&self, id: &ItemId) -> Result<ItemState> {
        self.read_record(&self.item_path(id), ITEM_MAGIC)?
            .ok_or_else(|| StateError::NoSuchItem(id.clone()))
    }

    fn exists(&self, id: &ItemId) -> Result<bool> {
        Ok(self.item_path(id).exists())
    }

    fn store(&self, log: &ChangeLog<SharedItem>) -> Result<()> {
        let batch = ChangeSet::from_log(log);
        if batch.is_empty() {
            return Ok(());
        }

        let _lock = self.write_lock.lock();
        let before = self.capture(&batch)?;
        let seq = self.journal.log(&batch)?;
        if let Err(e) = self
            .apply(&batch)
            .and_then(|()| self.journal.commit(seq))
        {
            self.undo(seq, &before);
            return Err(e);
        }
        // An earlier batch that could not be undone must survive until replay.
        if !self.journal.has_pending()? {
            self.journal.clear()?;
        }
        debug!(seq, %log, "applied change batch");
        Ok(())
    }

    fn load_references(&self, id: &NodeReferencesId) -> Result<NodeReferences> {
        self.read_record(&self.refs_path(id), REFS_MAGIC)?
            .ok_or(StateError::NoSuchReferences(*id))
    }

    fn exists_references(&self, id: &NodeReferencesId) -> Result<bool> {
        Ok(self.refs_path(id).exists())
    }
}

fn write_then_rename(tmp: &Path, path: &Path, bytes: &[u8], sync: bool) -> std::io::Result<()> {
    {
        let mut file = File::create(tmp)?;
        file.write_all(bytes)?;
        if sync {
            file.sync_all()?;
        }
    }
    fs::rename(tmp, path)
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
