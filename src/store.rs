//! Lease records and their on-disk table.
//!
//! The store is the source of truth for every assignment. Each [`put`]
//! writes the complete table to disk before touching memory, so the two
//! views never diverge: a failed write leaves the previous state intact on
//! both sides.
//!
//! Writes go to a sibling temporary file which is synced and then renamed
//! over the live file, so a crash mid-write leaves either the old table or
//! the new one, never a torn file.
//!
//! [`put`]: LeaseRecordStore::put

use std::collections::{BTreeMap, HashMap};
use std::ffi::OsString;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::address::router_for;
use crate::error::{Error, Result};

/// One client's four-address block.
///
/// Only the host address is stored; the router address is always derived
/// from it so the two cannot disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// Opaque client identifier (hardware address or abstract name).
    pub client_key: String,

    /// Assignable host address, block offset +2.
    pub host_address: Ipv4Addr,

    /// When this lease expires (UTC). Informational: expired records are
    /// still handed back to their owner and renewed.
    pub expires_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn new(client_key: String, host_address: Ipv4Addr, expires_at: DateTime<Utc>) -> Self {
        Self {
            client_key,
            host_address,
            expires_at,
        }
    }

    /// Router address of the block, block offset +1.
    pub fn router_address(&self) -> Ipv4Addr {
        router_for(self.host_address)
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        let remaining: TimeDelta = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Per-client entry of the lease file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredLease {
    ip_address: Ipv4Addr,
    expires_at: DateTime<Utc>,
}

/// Lease file format. Keys are sorted so rewrites diff cleanly.
#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseFile {
    leases: BTreeMap<String, StoredLease>,
}

impl LeaseFile {
    fn snapshot<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a LeaseRecord>,
    {
        let leases = records
            .into_iter()
            .map(|record| {
                (
                    record.client_key.clone(),
                    StoredLease {
                        ip_address: record.host_address,
                        expires_at: record.expires_at,
                    },
                )
            })
            .collect();
        Self { leases }
    }
}

/// In-memory lease table mirrored to a JSON file.
#[derive(Debug)]
pub struct LeaseRecordStore {
    path: PathBuf,
    records: HashMap<String, LeaseRecord>,
}

impl LeaseRecordStore {
    /// Loads the whole table from `path`.
    ///
    /// A missing file yields an empty table.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub async fn load_all<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = if tokio::fs::try_exists(&path).await? {
            let content = tokio::fs::read_to_string(&path).await?;
            serde_json::from_str::<LeaseFile>(&content)?
        } else {
            LeaseFile::default()
        };

        let records = file
            .leases
            .into_iter()
            .map(|(client_key, stored)| {
                let record =
                    LeaseRecord::new(client_key.clone(), stored.ip_address, stored.expires_at);
                (client_key, record)
            })
            .collect();

        Ok(Self { path, records })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, client_key: &str) -> Option<&LeaseRecord> {
        self.records.get(client_key)
    }

    pub fn records(&self) -> impl Iterator<Item = &LeaseRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Inserts or replaces the record for `record.client_key`.
    ///
    /// The full table including the new record is written and synced first;
    /// memory is updated only once that succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Persistence`] if the table could not be written. The
    /// store is unchanged in that case.
    pub async fn put(&mut self, record: LeaseRecord) -> Result<()> {
        let others = self
            .records
            .values()
            .filter(|existing| existing.client_key != record.client_key);
        let snapshot = LeaseFile::snapshot(others.chain(std::iter::once(&record)));
        let content = serde_json::to_vec_pretty(&snapshot)?;

        write_atomic(&self.path, &content)
            .await
            .map_err(|source| Error::Persistence {
                key: record.client_key.clone(),
                source,
            })?;

        self.records.insert(record.client_key.clone(), record);
        Ok(())
    }
}

async fn write_atomic(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut temporary = OsString::from(path.as_os_str());
    temporary.push(".tmp");
    let temporary = PathBuf::from(temporary);

    let mut file = tokio::fs::File::create(&temporary).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temporary, path).await?;

    // The new table is live once the rename succeeds.
    if let Err(error) = sync_parent(path).await {
        warn!(
            "Lease table {} replaced but its directory could not be synced: {}",
            path.display(),
            error
        );
    }
    Ok(())
}

async fn sync_parent(path: &Path) -> std::io::Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    tokio::fs::File::open(directory).await?.sync_all().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, host: [u8; 4]) -> LeaseRecord {
        LeaseRecord::new(
            key.to_string(),
            Ipv4Addr::from(host),
            Utc::now() + TimeDelta::seconds(3600),
        )
    }

    #[test]
    fn test_router_is_derived() {
        let lease = record("aa", [10, 0, 0, 6]);
        assert_eq!(lease.router_address(), Ipv4Addr::new(10, 0, 0, 5));
        assert!(!lease.is_expired());
        assert!(lease.remaining_seconds() > 3500);
    }

    #[tokio::test]
    async fn test_missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = LeaseRecordStore::load_all(dir.path().join("leases.json"))
            .await
            .unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_put_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.json");

        let mut store = LeaseRecordStore::load_all(&path).await.unwrap();
        let first = record("aa:bb:cc:dd:ee:01", [10, 0, 0, 2]);
        let second = record("printer", [10, 0, 0, 6]);
        store.put(first.clone()).await.unwrap();
        store.put(second.clone()).await.unwrap();

        let reloaded = LeaseRecordStore::load_all(&path).await.unwrap();
        assert_eq!(reloaded.len(), 2);
        assert_eq!(reloaded.get("aa:bb:cc:dd:ee:01"), Some(&first));
        assert_eq!(reloaded.get("printer"), Some(&second));
        assert!(!dir.path().join("leases.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_put_replaces_existing_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.json");

        let mut store = LeaseRecordStore::load_all(&path).await.unwrap();
        let mut lease = record("aa", [10, 0, 0, 2]);
        store.put(lease.clone()).await.unwrap();

        lease.expires_at += TimeDelta::seconds(60);
        store.put(lease.clone()).await.unwrap();

        let reloaded = LeaseRecordStore::load_all(&path).await.unwrap();
        assert_eq!(reloaded.len(), 1);
        assert_eq!(reloaded.get("aa").unwrap().expires_at, lease.expires_at);
    }

    #[tokio::test]
    async fn test_failed_put_leaves_memory_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("leases.json");

        let mut store = LeaseRecordStore::load_all(&path).await.unwrap();
        let result = store.put(record("aa", [10, 0, 0, 2])).await;

        assert!(matches!(result, Err(Error::Persistence { .. })));
        assert!(store.get("aa").is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_directory_sync_failure_does_not_undo_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.json");

        write_atomic(&path, b"{\"leases\": {}}").await.unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"{\"leases\": {}}");

        let orphan = dir.path().join("gone").join("leases.json");
        assert!(sync_parent(&orphan).await.is_err());
    }

    #[tokio::test]
    async fn test_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leases.json");
        std::fs::write(&path, b"{\"leases\": {\"aa\": ").unwrap();

        assert!(matches!(
            LeaseRecordStore::load_all(&path).await,
            Err(Error::Json(_))
        ));
    }
}
