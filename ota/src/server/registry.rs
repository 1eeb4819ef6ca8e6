// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// Published firmwares and their artifacts

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use super::JsonStore;
use crate::error::Error;
use crate::integrity;
use crate::lock;
use crate::protocol::{download_path, FirmwareInfo};
use crate::version::Version;

/// Default maximum upload size, 50 MiB.
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 50 * 1024 * 1024;

/// File name of the registry document in the firmware directory.
pub const REGISTRY_DOCUMENT: &str = "metadata.json";

/// A published firmware, as recorded by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    /// Firmware version
    pub version: Version,
    /// Artifact file name in the firmware directory
    pub filename: String,
    /// Artifact size in bytes, computed on upload
    pub size: u64,
    /// Hex SHA-256 digest, computed on upload
    pub checksum: String,
    /// Release notes
    #[serde(default)]
    pub description: String,
    /// First publication time of this version
    pub release_date: DateTime<Utc>,
}

impl RegistryEntry {
    /// Public description of the firmware.
    pub fn info(&self) -> FirmwareInfo {
        FirmwareInfo {
            version: self.version.to_string(),
            size: self.size,
            checksum: Some(self.checksum.clone()),
            description: self.description.clone(),
            download_url: format!("/{}", download_path(&self.version.to_string())),
            release_date: Some(self.release_date),
        }
    }
}

/// Storage of registry entries, keyed by version.
///
/// Versions equal under the version order are the same key: `1.0` and
/// `1.0.0` name a single entry.
pub trait RegistryStore: Send + Sync {
    /// Entry of `version`.
    fn get(&self, version: &Version) -> Option<RegistryEntry>;
    /// Store `entry`, returning the entry it replaced.
    fn put(&self, entry: RegistryEntry) -> Result<Option<RegistryEntry>, Error>;
    /// Remove the entry of `version`, returning it.
    fn delete(&self, version: &Version) -> Result<Option<RegistryEntry>, Error>;
    /// All entries, in no particular order.
    fn list(&self) -> Vec<RegistryEntry>;

    /// Entry with the greatest version.
    fn latest(&self) -> Option<RegistryEntry> {
        self.list().into_iter().max_by(|a, b| a.version.cmp(&b.version))
    }
}

impl RegistryStore for JsonStore<RegistryEntry> {
    fn get(&self, version: &Version) -> Option<RegistryEntry> {
        self.entries()
            .into_iter()
            .map(|(_, entry)| entry)
            .find(|entry| &entry.version == version)
    }

    fn put(&self, entry: RegistryEntry) -> Result<Option<RegistryEntry>, Error> {
        self.modify(|entries| {
            let old = take_version(entries, &entry.version);
            entries.insert(entry.version.to_string(), entry);
            old
        })
    }

    fn delete(&self, version: &Version) -> Result<Option<RegistryEntry>, Error> {
        self.modify(|entries| take_version(entries, version))
    }

    fn list(&self) -> Vec<RegistryEntry> {
        self.entries().into_iter().map(|(_, entry)| entry).collect()
    }
}

fn take_version(
    entries: &mut std::collections::BTreeMap<String, RegistryEntry>,
    version: &Version,
) -> Option<RegistryEntry> {
    let key = entries
        .iter()
        .find(|(_, entry)| &entry.version == version)
        .map(|(key, _)| key.clone())?;
    entries.remove(&key)
}

/// A firmware file submitted by a publisher.
#[derive(Debug, Clone)]
pub struct Upload {
    /// Version, as typed by the publisher
    pub version: String,
    /// Original file name
    pub filename: String,
    /// File content
    pub content: Vec<u8>,
    /// Release notes; the previous ones are kept when replacing a version
    pub description: Option<String>,
}

/// The set of published firmwares and the directory holding their artifacts.
#[derive(Debug)]
pub struct Registry<S = JsonStore<RegistryEntry>> {
    store: S,
    dir: PathBuf,
    max_upload_size: u64,
    // Serializes changes to the artifact directory
    publishing: Mutex<()>,
}

impl Registry {
    /// Open the registry stored in `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, Error> {
        let dir = dir.into();
        let store = JsonStore::open(dir.join(REGISTRY_DOCUMENT))?;
        Ok(Self::new(store, dir))
    }
}

impl<S: RegistryStore> Registry<S> {
    /// Create a registry over `store`, keeping artifacts in `dir`.
    pub fn new(store: S, dir: impl Into<PathBuf>) -> Self {
        Self {
            store,
            dir: dir.into(),
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
            publishing: Mutex::new(()),
        }
    }

    /// Reject uploads larger than `max` bytes.
    pub fn with_max_upload_size(mut self, max: u64) -> Self {
        self.max_upload_size = max;
        self
    }

    /// The artifact directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Firmware with the greatest version.
    pub fn latest(&self) -> Option<RegistryEntry> {
        self.store.latest()
    }

    /// Firmware of `version`.
    pub fn get(&self, version: &Version) -> Result<RegistryEntry, Error> {
        self.store
            .get(version)
            .ok_or_else(|| Error::NotFound(version.to_string()))
    }

    /// All firmwares, oldest version first.
    pub fn list(&self) -> Vec<RegistryEntry> {
        let mut entries = self.store.list();
        entries.sort_by(|a, b| a.version.cmp(&b.version));
        entries
    }

    /// Path of the artifact of `entry`.
    pub fn artifact_path(&self, entry: &RegistryEntry) -> PathBuf {
        self.dir.join(&entry.filename)
    }

    /// Publish an upload, replacing any firmware with the same version.
    ///
    /// Size and digest are computed here. The new artifact is staged, then
    /// moved into place once its entry is recorded; if recording fails the
    /// previous firmware stays published untouched.
    pub fn publish(&self, upload: Upload) -> Result<RegistryEntry, Error> {
        let raw_version = upload.version.trim();
        if raw_version.is_empty() {
            return Err(Error::InvalidUpload("missing version".to_string()));
        }
        let version: Version = raw_version.parse()?;
        check_filename(&upload.filename)?;

        let size = upload.content.len() as u64;
        if size > self.max_upload_size {
            return Err(Error::PayloadTooLarge {
                size,
                max: self.max_upload_size,
            });
        }
        if size == 0 {
            return Err(Error::InvalidUpload("empty firmware".to_string()));
        }

        let _publishing = lock(&self.publishing);

        if let Some(other) = self
            .store
            .list()
            .into_iter()
            .find(|e| e.filename == upload.filename && e.version != version)
        {
            return Err(Error::InvalidUpload(format!(
                "{} already holds firmware {}",
                upload.filename, other.version
            )));
        }

        fs::create_dir_all(&self.dir)?;
        let staged = self.dir.join(format!(".{}.upload", upload.filename));
        let dest = self.dir.join(&upload.filename);
        fs::write(&staged, &upload.content)?;

        let existing = self.store.get(&version);
        let description = upload
            .description
            .filter(|d| !d.trim().is_empty())
            .or_else(|| existing.as_ref().map(|e| e.description.clone()))
            .unwrap_or_default();
        let entry = RegistryEntry {
            release_date: existing
                .as_ref()
                .map_or_else(Utc::now, |e| e.release_date),
            version,
            filename: upload.filename,
            size,
            checksum: integrity::digest_of(&upload.content),
            description,
        };

        // The live artifact is only touched once the new entry is recorded
        let replaced = match self.store.put(entry.clone()) {
            Ok(replaced) => replaced,
            Err(e) => {
                remove_artifact(&staged);
                return Err(e);
            }
        };
        if let Err(e) = fs::rename(&staged, &dest) {
            remove_artifact(&staged);
            let restored = match &replaced {
                Some(old) => self.store.put(old.clone()).map(|_| ()),
                None => self.store.delete(&entry.version).map(|_| ()),
            };
            if let Err(restore) = restored {
                warn!(
                    "failed to restore registry entry of {}: {}",
                    entry.version, restore
                );
            }
            return Err(e.into());
        }

        match replaced {
            Some(old) if old.filename != entry.filename => {
                info!(
                    "firmware {} replaced, removing {}",
                    entry.version, old.filename
                );
                remove_artifact(&self.artifact_path(&old));
            }
            Some(_) => info!("firmware {} replaced", entry.version),
            None => info!("firmware {} published as {}", entry.version, entry.filename),
        }

        Ok(entry)
    }

    /// Delete the firmware of `version` and its artifact.
    pub fn remove(&self, version: &Version) -> Result<RegistryEntry, Error> {
        let _publishing = lock(&self.publishing);

        let entry = self
            .store
            .delete(version)?
            .ok_or_else(|| Error::NotFound(version.to_string()))?;
        remove_artifact(&self.artifact_path(&entry));
        info!("firmware {} deleted", entry.version);

        Ok(entry)
    }
}

fn check_filename(name: &str) -> Result<(), Error> {
    let invalid = name.is_empty()
        || name.starts_with('.')
        || name.contains(|c: char| c == '/' || c == '\\' || c.is_control())
        || name == REGISTRY_DOCUMENT;
    if invalid {
        Err(Error::InvalidUpload(format!("invalid file name '{}'", name)))
    } else {
        Ok(())
    }
}

fn remove_artifact(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove {}: {}", path.display(), e),
    }
}
