//! File-backed registration store shared by several server processes.
//!
//! Every operation takes an advisory lock on `LOCK` in the store directory,
//! reads `registrations.bin`, applies the change and atomically replaces the
//! file. Processes pointed at the same directory therefore see each other's
//! registrations.

use super::{Registration, RegistrationStore};
use crate::error::{LiveQueryError, Result};
use crate::types::Identity;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Magic bytes for the registrations file.
const REGISTRY_MAGIC: &[u8; 4] = b"LQR\0";

/// Current registrations file format version.
const REGISTRY_VERSION: u8 = 1;

const REGISTRY_FILE: &str = "registrations.bin";
/// Magic, version, length and checksum around the payload.
const FRAMING_LEN: u64 = 4 + 1 + 8 + 4;
const LOCK_FILE: &str = "LOCK";

/// File store configuration.
#[derive(Clone, Debug)]
pub struct FileStoreConfig {
    /// Directory holding the store.
    pub path: PathBuf,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./live-queries"),
            create_if_missing: true,
        }
    }
}

/// Registrations as stored on disk.
#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    registrations: BTreeMap<String, Registration>,
}

/// Holds the advisory lock until dropped.
struct LockGuard(File);

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.0);
    }
}

/// Durable registration store.
pub struct FileRegistrationStore {
    dir: PathBuf,
}

impl FileRegistrationStore {
    /// Open the store, creating it if allowed.
    pub fn open(config: FileStoreConfig) -> Result<Self> {
        if !config.path.exists() {
            if !config.create_if_missing {
                return Err(LiveQueryError::NotInitialized);
            }
            fs::create_dir_all(&config.path)?;
        }

        let store = Self { dir: config.path };
        let existing = {
            let _lock = store.lock(true)?;
            if store.data_path().exists() {
                store.read_file()?.registrations.len()
            } else {
                store.write_file(&RegistryFile::default())?;
                0
            }
        };

        info!(path = %store.dir.display(), registrations = existing, "opened registration store");
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn data_path(&self) -> PathBuf {
        self.dir.join(REGISTRY_FILE)
    }

    fn lock(&self, exclusive: bool) -> Result<LockGuard> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.dir.join(LOCK_FILE))?;

        if exclusive {
            FileExt::lock_exclusive(&file)?;
        } else {
            FileExt::lock_shared(&file)?;
        }
        Ok(LockGuard(file))
    }

    fn read_file(&self) -> Result<RegistryFile> {
        let mut file = File::open(self.data_path())?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != REGISTRY_MAGIC {
            return Err(LiveQueryError::InvalidFormat(
                "Invalid registrations magic".into(),
            ));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != REGISTRY_VERSION {
            return Err(LiveQueryError::InvalidFormat(format!(
                "Unsupported registrations version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);

        let available = file.metadata()?.len().saturating_sub(FRAMING_LEN);
        if len > available {
            return Err(LiveQueryError::Corruption(format!(
                "registrations length {} exceeds file ({} bytes available)",
                len, available
            )));
        }

        let mut encoded = vec![0u8; len as usize];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let expected = u32::from_le_bytes(checksum_bytes);
        let got = crc32fast::hash(&encoded);
        if expected != got {
            return Err(LiveQueryError::ChecksumMismatch { expected, got });
        }

        Ok(rmp_serde::from_slice(&encoded)?)
    }

    /// Write to a temporary file and rename over the old one.
    fn write_file(&self, contents: &RegistryFile) -> Result<()> {
        let encoded = rmp_serde::to_vec_named(contents)?;
        let tmp_path = self.dir.join(format!("{}.tmp", REGISTRY_FILE));

        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp_path)?;
            file.write_all(REGISTRY_MAGIC)?;
            file.write_all(&[REGISTRY_VERSION])?;
            file.write_all(&(encoded.len() as u64).to_le_bytes())?;
            file.write_all(&encoded)?;
            file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, self.data_path())?;
        Ok(())
    }

    fn read_locked(&self) -> Result<RegistryFile> {
        let _lock = self.lock(false)?;
        self.read_file()
    }

    /// Read-modify-write under the exclusive lock. The file is only
    /// rewritten when `f` reports a change.
    fn update<T>(&self, f: impl FnOnce(&mut RegistryFile) -> (bool, T)) -> Result<T> {
        let _lock = self.lock(true)?;
        let mut contents = self.read_file()?;
        let (changed, value) = f(&mut contents);
        if changed {
            self.write_file(&contents)?;
        }
        Ok(value)
    }
}

impl RegistrationStore for FileRegistrationStore {
    fn add(&self, registration: Registration) -> Result<()> {
        debug!(id = %registration.id, entity = %registration.entity_key, "persisting registration");
        self.update(|file| {
            file.registrations
                .insert(registration.id.clone(), registration);
            (true, ())
        })
    }

    fn remove(&self, id: &str) -> Result<bool> {
        self.update(|file| {
            let existed = file.registrations.remove(id).is_some();
            (existed, existed)
        })
    }

    fn get(&self, id: &str) -> Result<Option<Registration>> {
        Ok(self.read_locked()?.registrations.remove(id))
    }

    fn list(&self) -> Result<Vec<Registration>> {
        Ok(self.read_locked()?.registrations.into_values().collect())
    }

    fn set_identities(&self, id: &str, identities: Vec<Identity>) -> Result<bool> {
        self.update(|file| match file.registrations.get_mut(id) {
            Some(registration) => {
                registration.identities = identities;
                (true, true)
            }
            None => (false, false),
        })
    }
}
