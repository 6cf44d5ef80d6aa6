//! Embedded key-value store with a versioned change log.
//!
//! Buckets are sled trees; values are JSON. Every mutation appends a
//! `Change` with a monotonic version and broadcasts it to subscribers in
//! commit order. Subscribers get their own bounded channel; a subscriber
//! that cannot keep up is dropped rather than allowed to stall the
//! committer. Snapshots capture all buckets at a point-in-time version for
//! HA seeding and the upgrade handoff.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;

const CHANGELOG_TREE: &str = "__changes";
const META_TREE: &str = "__meta";
const VERSION_KEY: &str = "version";
const BUCKET_PREFIX: &str = "b:";

/// Queue depth per subscriber before it is considered too slow.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum Error {
    #[error("store backend error: {0}")]
    Backend(#[from] sled::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub bucket: String,
    pub key: String,
    pub value: Option<Value>,
    pub version: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u64,
    pub buckets: BTreeMap<String, BTreeMap<String, Value>>,
}

/// Stored envelope carrying the optional per-key TTL.
#[derive(Debug, Serialize, Deserialize)]
struct Entry {
    value: Value,
    expires_at: Option<u64>,
}

impl Entry {
    fn expired(&self) -> bool {
        match self.expires_at {
            Some(deadline) => now_epoch() >= deadline,
            None => false,
        }
    }
}

pub struct Store {
    db: sled::Db,
    /// Serializes mutations so versions are assigned in commit order and
    /// broadcasts happen in that same order.
    commit: Mutex<()>,
    subscribers: Mutex<Vec<mpsc::Sender<Change>>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let db = sled::open(path)?;
        Ok(Store {
            db,
            commit: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// In-memory store for tests and ephemeral use.
    pub fn open_temporary() -> Result<Self, Error> {
        let db = sled::Config::new().temporary(true).open()?;
        Ok(Store {
            db,
            commit: Mutex::new(()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    pub fn current_version(&self) -> u64 {
        self.read_version().unwrap_or(0)
    }

    pub fn set<T: Serialize>(&self, bucket: &str, key: &str, value: &T) -> Result<u64, Error> {
        self.set_with_ttl_opt(bucket, key, value, None)
    }

    pub fn set_with_ttl<T: Serialize>(
        &self,
        bucket: &str,
        key: &str,
        value: &T,
        ttl: Duration,
    ) -> Result<u64, Error> {
        self.set_with_ttl_opt(bucket, key, value, Some(ttl))
    }

    fn set_with_ttl_opt<T: Serialize>(
        &self,
        bucket: &str,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<u64, Error> {
        let value = serde_json::to_value(value)?;
        let entry = Entry {
            value: value.clone(),
            expires_at: ttl.map(|ttl| now_epoch() + ttl.as_secs()),
        };
        let raw = serde_json::to_vec(&entry)?;

        let _guard = self.commit.lock().unwrap();
        let tree = self.bucket_tree(bucket)?;
        let previous = tree.insert(key.as_bytes(), raw)?;
        let kind = if previous.is_some() {
            ChangeKind::Update
        } else {
            ChangeKind::Insert
        };
        let version = self.bump_version()?;
        let change = Change {
            kind,
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: Some(value),
            version,
        };
        self.log_and_broadcast(&change)?;
        Ok(version)
    }

    pub fn get<T: DeserializeOwned>(&self, bucket: &str, key: &str) -> Result<Option<T>, Error> {
        let tree = self.bucket_tree(bucket)?;
        let Some(raw) = tree.get(key.as_bytes())? else {
            return Ok(None);
        };
        let entry: Entry = serde_json::from_slice(&raw)?;
        if entry.expired() {
            // lazy expiry; the delete is logged like any other
            drop(tree);
            let _ = self.delete(bucket, key);
            return Ok(None);
        }
        Ok(Some(serde_json::from_value(entry.value)?))
    }

    pub fn delete(&self, bucket: &str, key: &str) -> Result<Option<u64>, Error> {
        let _guard = self.commit.lock().unwrap();
        let tree = self.bucket_tree(bucket)?;
        let previous = tree.remove(key.as_bytes())?;
        if previous.is_none() {
            return Ok(None);
        }
        let version = self.bump_version()?;
        let change = Change {
            kind: ChangeKind::Delete,
            bucket: bucket.to_string(),
            key: key.to_string(),
            value: None,
            version,
        };
        self.log_and_broadcast(&change)?;
        Ok(Some(version))
    }

    pub fn keys(&self, bucket: &str) -> Result<Vec<String>, Error> {
        let tree = self.bucket_tree(bucket)?;
        let mut keys = Vec::new();
        for item in tree.iter() {
            let (key, raw) = item?;
            let entry: Entry = serde_json::from_slice(&raw)?;
            if !entry.expired() {
                keys.push(String::from_utf8_lossy(&key).into_owned());
            }
        }
        Ok(keys)
    }

    /// Commit-ordered change stream. No backfill: only changes committed
    /// after the subscription are delivered.
    pub fn subscribe(&self) -> mpsc::Receiver<Change> {
        let (sender, receiver) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.subscribers.lock().unwrap().push(sender);
        receiver
    }

    pub fn get_changes_since(&self, version: u64) -> Result<Vec<Change>, Error> {
        let tree = self.db.open_tree(CHANGELOG_TREE)?;
        let mut changes = Vec::new();
        for item in tree.range(version_key(version + 1)..) {
            let (_, raw) = item?;
            changes.push(serde_json::from_slice(&raw)?);
        }
        Ok(changes)
    }

    pub fn create_snapshot(&self) -> Result<Snapshot, Error> {
        let _guard = self.commit.lock().unwrap();
        let mut snapshot = Snapshot {
            version: self.read_version()?,
            buckets: BTreeMap::new(),
        };
        for name in self.db.tree_names() {
            let name = String::from_utf8_lossy(&name).into_owned();
            let Some(bucket) = name.strip_prefix(BUCKET_PREFIX) else {
                continue;
            };
            let tree = self.db.open_tree(name.as_bytes())?;
            let mut entries = BTreeMap::new();
            for item in tree.iter() {
                let (key, raw) = item?;
                let entry: Entry = serde_json::from_slice(&raw)?;
                if !entry.expired() {
                    entries.insert(String::from_utf8_lossy(&key).into_owned(), entry.value);
                }
            }
            snapshot.buckets.insert(bucket.to_string(), entries);
        }
        Ok(snapshot)
    }

    /// Replace all bucket contents with the snapshot's.
    pub fn restore_snapshot(&self, snapshot: &Snapshot) -> Result<(), Error> {
        let _guard = self.commit.lock().unwrap();
        for name in self.db.tree_names() {
            if name.starts_with(BUCKET_PREFIX.as_bytes()) {
                self.db.drop_tree(&name)?;
            }
        }
        for (bucket, entries) in &snapshot.buckets {
            let tree = self.bucket_tree(bucket)?;
            for (key, value) in entries {
                let entry = Entry {
                    value: value.clone(),
                    expires_at: None,
                };
                tree.insert(key.as_bytes(), serde_json::to_vec(&entry)?)?;
            }
        }
        self.write_version(snapshot.version)?;
        Ok(())
    }

    /// Apply one replicated change (handoff/HA path). The change's version
    /// becomes the store's version.
    pub fn apply_change(&self, change: &Change) -> Result<(), Error> {
        let _guard = self.commit.lock().unwrap();
        let tree = self.bucket_tree(&change.bucket)?;
        match change.kind {
            ChangeKind::Insert | ChangeKind::Update => {
                let entry = Entry {
                    value: change.value.clone().unwrap_or(Value::Null),
                    expires_at: None,
                };
                tree.insert(change.key.as_bytes(), serde_json::to_vec(&entry)?)?;
            }
            ChangeKind::Delete => {
                tree.remove(change.key.as_bytes())?;
            }
        }
        self.write_version(change.version)?;
        Ok(())
    }

    fn bucket_tree(&self, bucket: &str) -> Result<sled::Tree, Error> {
        Ok(self.db.open_tree(format!("{BUCKET_PREFIX}{bucket}").as_bytes())?)
    }

    fn read_version(&self) -> Result<u64, Error> {
        let tree = self.db.open_tree(META_TREE)?;
        Ok(tree
            .get(VERSION_KEY)?
            .map(|raw| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&raw[..8]);
                u64::from_be_bytes(buf)
            })
            .unwrap_or(0))
    }

    fn write_version(&self, version: u64) -> Result<(), Error> {
        let tree = self.db.open_tree(META_TREE)?;
        tree.insert(VERSION_KEY, version.to_be_bytes().to_vec())?;
        Ok(())
    }

    fn bump_version(&self) -> Result<u64, Error> {
        let version = self.read_version()? + 1;
        self.write_version(version)?;
        Ok(version)
    }

    fn log_and_broadcast(&self, change: &Change) -> Result<(), Error> {
        let tree = self.db.open_tree(CHANGELOG_TREE)?;
        tree.insert(version_key(change.version), serde_json::to_vec(change)?)?;

        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|sender| match sender.try_send(change.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(bucket = %change.bucket, "dropping slow store subscriber");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        Ok(())
    }
}

fn version_key(version: u64) -> [u8; 8] {
    version.to_be_bytes()
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
