// Netpilot - Profile Storage
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Key/value persistence for profiles.
//!
//! Every profile owns one [`Store`]: a set of named groups (one per service,
//! keyed by the service storage identifier) holding typed values. Two
//! backings exist:
//! - TOML documents on disk (`<dir>/<name>.profile`), written with 0600
//!   permissions
//! - an in-memory map, used for the ephemeral profile, tests, and
//!   `in_memory_storage` deployments
//!
//! Crypted strings are obfuscated, not encrypted.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::{debug, info, warn};

use crate::models::{Error, Result};
use crate::services::profile::ProfileIdentifier;

/// Current on-disk storage format.
pub const STORAGE_FORMAT_VERSION: &str = "1.0.0";

/// File extension for profile documents.
const PROFILE_EXTENSION: &str = "profile";

/// Marker prefix for obfuscated strings.
const CRYPTED_PREFIX: &str = "b64:";

/// A single stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Bool(bool),
    Int(i64),
    String(String),
}

type Group = BTreeMap<String, StoredValue>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StorageMeta {
    #[serde(default = "default_format_version")]
    version: String,
    /// Name of the profile the document belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    profile: Option<String>,
}

impl Default for StorageMeta {
    fn default() -> Self {
        Self {
            version: default_format_version(),
            profile: None,
        }
    }
}

fn default_format_version() -> String {
    STORAGE_FORMAT_VERSION.to_string()
}

/// Serialized form of a whole store.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    meta: StorageMeta,
    #[serde(default)]
    groups: BTreeMap<String, Group>,
}

impl Document {
    /// Reject documents written by an incompatible format major version.
    fn check_version(&self) -> Result<()> {
        let current = Version::parse(STORAGE_FORMAT_VERSION)
            .map_err(|e| Error::Internal(e.to_string()))?;
        match Version::parse(&self.meta.version) {
            Ok(found) if found.major == current.major => Ok(()),
            _ => Err(Error::SchemaMismatch {
                expected: STORAGE_FORMAT_VERSION.to_string(),
                found: self.meta.version.clone(),
            }),
        }
    }
}

/// Typed key/value persistence interface.
pub trait Store {
    /// Check whether a group exists.
    fn contains_group(&self, group: &str) -> bool;

    /// All group names.
    fn groups(&self) -> Vec<String>;

    /// Groups holding `key = value`.
    fn groups_with_string(&self, key: &str, value: &str) -> Vec<String>;

    fn get_bool(&self, group: &str, key: &str) -> Option<bool>;
    fn set_bool(&mut self, group: &str, key: &str, value: bool);

    fn get_int(&self, group: &str, key: &str) -> Option<i64>;
    fn set_int(&mut self, group: &str, key: &str, value: i64);

    fn get_string(&self, group: &str, key: &str) -> Option<String>;
    fn set_string(&mut self, group: &str, key: &str, value: &str);

    /// Read a string stored with [`Store::set_crypted_string`].
    ///
    /// Values without the obfuscation marker are returned as-is.
    fn get_crypted_string(&self, group: &str, key: &str) -> Option<String>;
    fn set_crypted_string(&mut self, group: &str, key: &str, value: &str);

    /// Delete a key; returns whether it existed.
    fn delete_key(&mut self, group: &str, key: &str) -> bool;

    /// Delete a group; returns whether it existed.
    fn delete_group(&mut self, group: &str) -> bool;

    /// Write pending changes to the backing.
    fn flush(&mut self) -> Result<()>;
}

/// Where a [`KeyValueStore`] persists on flush.
#[derive(Debug)]
enum Backing {
    /// TOML document on disk.
    File(PathBuf),
    /// Slot in a shared in-memory map.
    Memory {
        key: String,
        documents: Rc<RefCell<HashMap<String, Document>>>,
    },
    /// Not persisted at all.
    Volatile,
}

/// The [`Store`] implementation used by all profiles.
#[derive(Debug)]
pub struct KeyValueStore {
    document: Document,
    backing: Backing,
    dirty: bool,
}

impl KeyValueStore {
    /// A store that is never persisted (the ephemeral profile).
    pub fn volatile() -> Self {
        Self {
            document: Document::default(),
            backing: Backing::Volatile,
            dirty: false,
        }
    }

    /// Open a TOML document on disk; a missing file yields an empty store.
    pub fn open_file(path: &Path) -> Result<Self> {
        let document = if path.exists() {
            let content = fs::read_to_string(path)?;
            let document: Document = toml::from_str(&content)?;
            document.check_version()?;
            debug!("Loaded {} storage groups from {:?}", document.groups.len(), path);
            document
        } else {
            Document::default()
        };
        Ok(Self {
            document,
            backing: Backing::File(path.to_path_buf()),
            dirty: false,
        })
    }

    fn group(&self, group: &str) -> Option<&Group> {
        self.document.groups.get(group)
    }

    fn value(&self, group: &str, key: &str) -> Option<&StoredValue> {
        self.group(group)?.get(key)
    }

    fn set(&mut self, group: &str, key: &str, value: StoredValue) {
        self.document
            .groups
            .entry(group.to_string())
            .or_default()
            .insert(key.to_string(), value);
        self.dirty = true;
    }

    /// Whether there are unflushed changes.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Profile name recorded in the document metadata.
    pub fn profile_name(&self) -> Option<&str> {
        self.document.meta.profile.as_deref()
    }

    /// Record the owning profile's name. Kept outside the group namespace.
    pub fn set_profile_name(&mut self, name: &str) {
        if self.document.meta.profile.as_deref() != Some(name) {
            self.document.meta.profile = Some(name.to_string());
            self.dirty = true;
        }
    }
}

impl Store for KeyValueStore {
    fn contains_group(&self, group: &str) -> bool {
        self.document.groups.contains_key(group)
    }

    fn groups(&self) -> Vec<String> {
        self.document.groups.keys().cloned().collect()
    }

    fn groups_with_string(&self, key: &str, value: &str) -> Vec<String> {
        self.document
            .groups
            .iter()
            .filter(|(_, entries)| {
                matches!(entries.get(key), Some(StoredValue::String(s)) if s == value)
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn get_bool(&self, group: &str, key: &str) -> Option<bool> {
        match self.value(group, key)? {
            StoredValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    fn set_bool(&mut self, group: &str, key: &str, value: bool) {
        self.set(group, key, StoredValue::Bool(value));
    }

    fn get_int(&self, group: &str, key: &str) -> Option<i64> {
        match self.value(group, key)? {
            StoredValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    fn set_int(&mut self, group: &str, key: &str, value: i64) {
        self.set(group, key, StoredValue::Int(value));
    }

    fn get_string(&self, group: &str, key: &str) -> Option<String> {
        match self.value(group, key)? {
            StoredValue::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    fn set_string(&mut self, group: &str, key: &str, value: &str) {
        self.set(group, key, StoredValue::String(value.to_string()));
    }

    fn get_crypted_string(&self, group: &str, key: &str) -> Option<String> {
        let raw = self.get_string(group, key)?;
        let Some(encoded) = raw.strip_prefix(CRYPTED_PREFIX) else {
            return Some(raw);
        };
        match BASE64.decode(encoded) {
            Ok(bytes) => String::from_utf8(bytes).ok(),
            Err(e) => {
                warn!("Undecodable crypted value {}/{}: {}", group, key, e);
                None
            }
        }
    }

    fn set_crypted_string(&mut self, group: &str, key: &str, value: &str) {
        let encoded = format!("{}{}", CRYPTED_PREFIX, BASE64.encode(value.as_bytes()));
        self.set(group, key, StoredValue::String(encoded));
    }

    fn delete_key(&mut self, group: &str, key: &str) -> bool {
        let removed = self
            .document
            .groups
            .get_mut(group)
            .map(|entries| entries.remove(key).is_some())
            .unwrap_or(false);
        self.dirty |= removed;
        removed
    }

    fn delete_group(&mut self, group: &str) -> bool {
        let removed = self.document.groups.remove(group).is_some();
        self.dirty |= removed;
        removed
    }

    fn flush(&mut self) -> Result<()> {
        match &self.backing {
            Backing::Volatile => {}
            Backing::Memory { key, documents } => {
                documents
                    .borrow_mut()
                    .insert(key.clone(), self.document.clone());
            }
            Backing::File(path) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent)?;
                }
                let content = toml::to_string_pretty(&self.document)?;
                // Stage next to the target, then rename into place
                let staging = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
                fs::write(&staging, content)?;
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = fs::set_permissions(&staging, fs::Permissions::from_mode(0o600));
                }
                fs::rename(&staging, path)?;
                debug!("Flushed storage to {:?}", path);
            }
        }
        self.dirty = false;
        Ok(())
    }
}

/// How a profile's storage is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Fail if the storage already exists.
    CreateNew,
    /// Fail if the storage does not exist.
    OpenExisting,
    /// Open, creating if missing.
    CreateOrOpen,
}

/// Opens and removes profile storage.
pub trait StorageProvider {
    fn exists(&self, ident: &ProfileIdentifier) -> bool;
    fn open(&self, ident: &ProfileIdentifier, mode: OpenMode) -> Result<KeyValueStore>;
    fn remove(&self, ident: &ProfileIdentifier) -> Result<()>;
}

fn check_open_mode(exists: bool, ident: &ProfileIdentifier, mode: OpenMode) -> Result<()> {
    match mode {
        OpenMode::CreateNew if exists => Err(Error::StorageAlreadyExists(ident.to_string())),
        OpenMode::OpenExisting if !exists => Err(Error::StorageNotFound(ident.to_string())),
        _ => Ok(()),
    }
}

/// Profile storage on disk.
#[derive(Debug, Clone)]
pub struct FileStorageProvider {
    storage_dir: PathBuf,
    user_storage_dir: PathBuf,
}

impl FileStorageProvider {
    pub fn new(storage_dir: PathBuf, user_storage_dir: PathBuf) -> Self {
        Self {
            storage_dir,
            user_storage_dir,
        }
    }

    /// Path of the document backing a profile.
    pub fn path_for(&self, ident: &ProfileIdentifier) -> PathBuf {
        let file = format!("{}.{}", ident.name, PROFILE_EXTENSION);
        match &ident.user {
            Some(user) => self.user_storage_dir.join(user).join(file),
            None => self.storage_dir.join(file),
        }
    }
}

impl StorageProvider for FileStorageProvider {
    fn exists(&self, ident: &ProfileIdentifier) -> bool {
        self.path_for(ident).exists()
    }

    fn open(&self, ident: &ProfileIdentifier, mode: OpenMode) -> Result<KeyValueStore> {
        let path = self.path_for(ident);
        check_open_mode(path.exists(), ident, mode)?;
        let mut store = KeyValueStore::open_file(&path)?;
        if !path.exists() {
            store.flush()?;
            info!("Created profile storage {:?}", path);
        }
        Ok(store)
    }

    fn remove(&self, ident: &ProfileIdentifier) -> Result<()> {
        let path = self.path_for(ident);
        if !path.exists() {
            return Err(Error::StorageNotFound(ident.to_string()));
        }
        fs::remove_file(&path)?;
        info!("Removed profile storage {:?}", path);
        Ok(())
    }
}

/// Profile storage kept in memory for the life of the provider.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorageProvider {
    documents: Rc<RefCell<HashMap<String, Document>>>,
}

impl MemoryStorageProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a profile document, creating it if needed, and return a
    /// writable store for it. Callers flush to publish their changes.
    pub fn seed(&self, ident: &ProfileIdentifier) -> KeyValueStore {
        let key = ident.to_string();
        let document = self
            .documents
            .borrow_mut()
            .entry(key.clone())
            .or_default()
            .clone();
        KeyValueStore {
            document,
            backing: Backing::Memory {
                key,
                documents: Rc::clone(&self.documents),
            },
            dirty: false,
        }
    }
}

impl StorageProvider for MemoryStorageProvider {
    fn exists(&self, ident: &ProfileIdentifier) -> bool {
        self.documents.borrow().contains_key(&ident.to_string())
    }

    fn open(&self, ident: &ProfileIdentifier, mode: OpenMode) -> Result<KeyValueStore> {
        check_open_mode(self.exists(ident), ident, mode)?;
        Ok(self.seed(ident))
    }

    fn remove(&self, ident: &ProfileIdentifier) -> Result<()> {
        self.documents
            .borrow_mut()
            .remove(&ident.to_string())
            .map(|_| ())
            .ok_or_else(|| Error::StorageNotFound(ident.to_string()))
    }
}
