// Copyright 2021, Collabora Ltd.
// SPDX-License-Identifier: MIT OR Apache-2.0

// Key/value documents persisted as JSON

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{de::DeserializeOwned, Serialize};

use crate::error::Error;
use crate::lock;

/// A string-keyed mapping, either kept in memory or mirrored to a JSON document.
///
/// Every mutation rewrites the document atomically (write then rename).
#[derive(Debug)]
pub struct JsonStore<V> {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, V>>,
}

impl<V> JsonStore<V>
where
    V: Serialize + DeserializeOwned + Clone,
{
    /// A store which is never written to disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Open the document at `path`, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let entries = if path.exists() {
            let content = fs::read(&path)?;
            serde_json::from_slice(&content)?
        } else {
            BTreeMap::new()
        };

        Ok(Self {
            path: Some(path),
            entries: Mutex::new(entries),
        })
    }

    /// Path of the backing document, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Value stored under `key`.
    pub fn get(&self, key: &str) -> Option<V> {
        lock(&self.entries).get(key).cloned()
    }

    /// All entries, ordered by key.
    pub fn entries(&self) -> Vec<(String, V)> {
        lock(&self.entries)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    /// Whether the store has no entry.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Store `value` under `key`, returning the replaced value.
    pub fn insert(&self, key: impl Into<String>, value: V) -> Result<Option<V>, Error> {
        let key = key.into();
        self.modify(|entries| entries.insert(key, value))
    }

    /// Remove `key`, returning its value.
    pub fn remove(&self, key: &str) -> Result<Option<V>, Error> {
        self.modify(|entries| entries.remove(key))
    }

    /// Run `f` on the entries under the store lock, then persist the result.
    ///
    /// If persisting fails the in-memory entries are rolled back.
    pub fn modify<R>(&self, f: impl FnOnce(&mut BTreeMap<String, V>) -> R) -> Result<R, Error> {
        let mut entries = lock(&self.entries);
        let backup = entries.clone();
        let result = f(&mut entries);

        if let Err(e) = self.persist(&entries) {
            *entries = backup;
            return Err(e);
        }
        Ok(result)
    }

    /// Like [`JsonStore::modify`], but `f` may fail: its changes are then
    /// discarded and nothing is written.
    pub fn try_modify<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<String, V>) -> Result<R, Error>,
    ) -> Result<R, Error> {
        let mut entries = lock(&self.entries);
        let backup = entries.clone();

        let result = match f(&mut entries) {
            Ok(result) => result,
            Err(e) => {
                *entries = backup;
                return Err(e);
            }
        };
        if let Err(e) = self.persist(&entries) {
            *entries = backup;
            return Err(e);
        }
        Ok(result)
    }

    fn persist(&self, entries: &BTreeMap<String, V>) -> Result<(), Error> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(entries)?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}
