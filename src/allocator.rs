//! Four-address block allocation.
//!
//! The [`Allocator`] owns the lease table and its derived index and is not
//! synchronized itself; [`Leases`](crate::Leases) wraps it in the single
//! lock every request goes through.
//!
//! # Allocation order
//!
//! 1. A known client gets its existing block back, with the expiry pushed
//!    out to `now + lease_duration` whenever it falls short of that.
//! 2. A new client gets the lowest free block in the pool. The scan is
//!    deterministic so the same request sequence always yields the same
//!    assignments.
//!
//! Nothing is ever reclaimed: an expired lease still belongs to its client.

use std::net::Ipv4Addr;

use chrono::{SubsecRound, TimeDelta, Utc};
use tracing::{debug, error, info, warn};

use crate::address::{BLOCK_MASK, HOST_OFFSET};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::pool::{AddressPoolIndex, PoolRange};
use crate::store::{LeaseRecord, LeaseRecordStore};

#[derive(Debug)]
pub struct Allocator {
    range: PoolRange,
    lease_duration: TimeDelta,
    store: LeaseRecordStore,
    index: AddressPoolIndex,
}

impl Allocator {
    /// Loads the lease file named by `config` and rebuilds the pool index.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid, the lease file
    /// cannot be parsed, or the file holds overlapping or misaligned blocks.
    pub async fn open(config: &Config) -> Result<Self> {
        config.validate()?;
        let range = PoolRange::from_config(config)?;
        let lease_duration = config.lease_duration.as_time_delta()?;
        let store = LeaseRecordStore::load_all(&config.leases_file).await?;

        let allocator = Self::from_parts(range, lease_duration, store)?;
        info!(
            "Loaded {} lease(s) from {}",
            allocator.store.len(),
            allocator.store.path().display()
        );
        Ok(allocator)
    }

    /// Builds an allocator over an already loaded store.
    pub fn from_parts(
        range: PoolRange,
        lease_duration: TimeDelta,
        store: LeaseRecordStore,
    ) -> Result<Self> {
        for record in store.records() {
            if range.holds_host(record.host_address) {
                continue;
            }
            let host = u32::from(record.host_address);
            let inside = range
                .host_offsets()
                .any(|offset| (offset - HOST_OFFSET..=offset + 1).contains(&host));
            if inside {
                return Err(Error::InvalidConfig(format!(
                    "lease for {} at {} is not aligned to a block boundary",
                    record.client_key, record.host_address
                )));
            }
            warn!(
                "Lease for {} at {} lies outside the pool, keeping it",
                record.client_key, record.host_address
            );
        }

        let index = AddressPoolIndex::rebuild(
            store
                .records()
                .map(|record| (record.client_key.as_str(), record.host_address)),
        )?;

        Ok(Self {
            range,
            lease_duration,
            store,
            index,
        })
    }

    /// Returns the lease for `client_key`, allocating one if needed.
    ///
    /// `block_mask` is the netmask the caller intends to hand out with the
    /// lease, if it has one. It only matters when a new block is carved out:
    /// existing leases are renewed whatever the hint, and a new client is
    /// refused unless the hint is absent or `255.255.255.252`.
    ///
    /// # Errors
    ///
    /// - [`Error::UnsupportedBlockSize`] for a new client with any other mask
    /// - [`Error::PoolExhausted`] if the client is new and no block is free
    /// - [`Error::Persistence`] if the new or renewed lease cannot be written;
    ///   nothing changes in memory in that case
    pub async fn request_lease(
        &mut self,
        client_key: &str,
        block_mask: Option<Ipv4Addr>,
    ) -> Result<LeaseRecord> {
        match self.store.get(client_key).cloned() {
            Some(existing) => self.renew(existing).await,
            None => {
                if let Some(mask) = block_mask
                    && mask != BLOCK_MASK
                {
                    error!("Only /30 ({}) is currently supported, got {}", BLOCK_MASK, mask);
                    return Err(Error::UnsupportedBlockSize(mask));
                }
                self.allocate(client_key).await
            }
        }
    }

    async fn renew(&mut self, existing: LeaseRecord) -> Result<LeaseRecord> {
        let wanted = Utc::now() + self.lease_duration;
        if existing.expires_at >= wanted {
            return Ok(existing);
        }

        let mut renewed = existing.clone();
        renewed.expires_at = wanted.round_subsecs(0).max(existing.expires_at);

        if let Err(error) = self.store.put(renewed.clone()).await {
            error!("Could not persist renewal for {}: {}", existing.client_key, error);
            return Err(error);
        }

        debug!(
            "Renewed {} for {} until {}",
            renewed.host_address, renewed.client_key, renewed.expires_at
        );
        Ok(renewed)
    }

    async fn allocate(&mut self, client_key: &str) -> Result<LeaseRecord> {
        info!("Client {} is new, leasing a new block", client_key);

        let Some(host) = self.find_free_block() else {
            warn!("Could not allocate a block for {}: pool exhausted", client_key);
            return Err(Error::PoolExhausted);
        };

        let expires_at = (Utc::now() + self.lease_duration).round_subsecs(0);
        let record = LeaseRecord::new(client_key.to_string(), host, expires_at);

        if let Err(error) = self.store.put(record.clone()).await {
            error!("Could not persist lease for {}: {}", client_key, error);
            return Err(error);
        }
        self.index.mark_taken(u32::from(host));

        info!(
            "Leased {} (router {}) to {}",
            record.host_address,
            record.router_address(),
            client_key
        );
        Ok(record)
    }

    fn find_free_block(&self) -> Option<Ipv4Addr> {
        self.range
            .host_offsets()
            .find(|offset| !self.index.is_taken(*offset))
            .map(Ipv4Addr::from)
    }

    pub fn get(&self, client_key: &str) -> Option<&LeaseRecord> {
        self.store.get(client_key)
    }

    pub fn records(&self) -> impl Iterator<Item = &LeaseRecord> {
        self.store.records()
    }

    /// Number of blocks in the pool not yet assigned to anyone.
    pub fn free_block_count(&self) -> usize {
        self.range
            .host_offsets()
            .filter(|offset| !self.index.is_taken(*offset))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::LeaseDuration;
    use std::path::Path;

    fn test_config(dir: &Path, end: [u8; 4]) -> Config {
        Config {
            pool_start: Ipv4Addr::new(10, 0, 0, 0),
            pool_end: Ipv4Addr::from(end),
            lease_duration: LeaseDuration::from_secs(3600),
            leases_file: dir.join("leases.json"),
            socket_path: dir.join("broker.sock"),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sample_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), [10, 0, 0, 16]);
        let mut allocator = Allocator::open(&config).await.unwrap();

        let aa = allocator.request_lease("AA", None).await.unwrap();
        assert_eq!(aa.host_address, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(aa.router_address(), Ipv4Addr::new(10, 0, 0, 1));

        let bb = allocator.request_lease("BB", None).await.unwrap();
        assert_eq!(bb.host_address, Ipv4Addr::new(10, 0, 0, 6));
        assert_eq!(bb.router_address(), Ipv4Addr::new(10, 0, 0, 5));

        let again = allocator.request_lease("AA", None).await.unwrap();
        assert_eq!(again.host_address, aa.host_address);
        assert_eq!(again.router_address(), aa.router_address());
        assert!(again.expires_at >= aa.expires_at);

        assert_eq!(allocator.free_block_count(), 2);
    }

    #[tokio::test]
    async fn test_single_block_exhaustion() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), [10, 0, 0, 4]);
        let mut allocator = Allocator::open(&config).await.unwrap();

        let first = allocator.request_lease("first", None).await.unwrap();
        assert_eq!(first.host_address, Ipv4Addr::new(10, 0, 0, 2));

        let second = allocator.request_lease("second", None).await;
        assert!(matches!(second, Err(Error::PoolExhausted)));
        assert!(allocator.get("second").is_none());

        // The owner keeps getting its block back.
        let first_again = allocator.request_lease("first", None).await.unwrap();
        assert_eq!(first_again.host_address, first.host_address);
    }

    #[tokio::test]
    async fn test_block_mask_hint() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), [10, 0, 0, 16]);
        let mut allocator = Allocator::open(&config).await.unwrap();

        let lease = allocator.request_lease("AA", Some(BLOCK_MASK)).await;
        assert!(lease.is_ok());

        let wide = allocator
            .request_lease("BB", Some(Ipv4Addr::new(255, 255, 255, 0)))
            .await;
        assert!(matches!(wide, Err(Error::UnsupportedBlockSize(_))));
        assert!(allocator.get("BB").is_none());
    }

    #[tokio::test]
    async fn test_existing_lease_ignores_mask_hint() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), [10, 0, 0, 16]);
        let mut allocator = Allocator::open(&config).await.unwrap();

        let first = allocator.request_lease("AA", None).await.unwrap();
        let again = allocator
            .request_lease("AA", Some(Ipv4Addr::new(255, 255, 255, 0)))
            .await
            .unwrap();
        assert_eq!(again.host_address, first.host_address);
        assert_eq!(allocator.free_block_count(), 3);
    }

    #[tokio::test]
    async fn test_restart_reproduces_assignments() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), [10, 0, 0, 32]);

        let mut assigned = Vec::new();
        {
            let mut allocator = Allocator::open(&config).await.unwrap();
            for key in ["one", "two", "three"] {
                let lease = allocator.request_lease(key, None).await.unwrap();
                assigned.push((key, lease.host_address));
            }
        }

        let mut allocator = Allocator::open(&config).await.unwrap();
        for (key, host) in &assigned {
            assert_eq!(allocator.get(key).unwrap().host_address, *host);
        }

        let newcomer = allocator.request_lease("four", None).await.unwrap();
        assert!(assigned.iter().all(|(_, host)| *host != newcomer.host_address));
        assert_eq!(newcomer.host_address, Ipv4Addr::new(10, 0, 0, 14));
    }

    #[tokio::test]
    async fn test_failed_write_marks_nothing_taken() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir(&state_dir).unwrap();
        let config = test_config(&state_dir, [10, 0, 0, 16]);
        let mut allocator = Allocator::open(&config).await.unwrap();

        std::fs::remove_dir_all(&state_dir).unwrap();
        let result = allocator.request_lease("AA", None).await;
        assert!(matches!(result, Err(Error::Persistence { .. })));
        assert!(allocator.get("AA").is_none());
        assert_eq!(allocator.free_block_count(), 4);

        std::fs::create_dir(&state_dir).unwrap();
        let lease = allocator.request_lease("BB", None).await.unwrap();
        assert_eq!(lease.host_address, Ipv4Addr::new(10, 0, 0, 2));
    }

    #[tokio::test]
    async fn test_failed_renewal_keeps_cached_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("state");
        std::fs::create_dir(&state_dir).unwrap();
        let config = test_config(&state_dir, [10, 0, 0, 16]);
        std::fs::write(
            &config.leases_file,
            r#"{"leases": {"AA": {"ip_address": "10.0.0.2", "expires_at": "2020-01-01T00:00:00Z"}}}"#,
        )
        .unwrap();

        let mut allocator = Allocator::open(&config).await.unwrap();
        let before = allocator.get("AA").unwrap().expires_at;

        std::fs::remove_dir_all(&state_dir).unwrap();
        let result = allocator.request_lease("AA", None).await;
        assert!(matches!(result, Err(Error::Persistence { .. })));
        assert_eq!(allocator.get("AA").unwrap().expires_at, before);
    }

    #[tokio::test]
    async fn test_expired_lease_is_renewed_not_reassigned() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), [10, 0, 0, 16]);
        std::fs::write(
            &config.leases_file,
            r#"{"leases": {"AA": {"ip_address": "10.0.0.6", "expires_at": "2020-01-01T00:00:00Z"}}}"#,
        )
        .unwrap();

        let mut allocator = Allocator::open(&config).await.unwrap();
        let lease = allocator.request_lease("AA", None).await.unwrap();
        assert_eq!(lease.host_address, Ipv4Addr::new(10, 0, 0, 6));
        assert!(!lease.is_expired());
        assert!(lease.remaining_seconds() > 3500);

        // The expired block still counts as taken.
        let other = allocator.request_lease("BB", None).await.unwrap();
        assert_eq!(other.host_address, Ipv4Addr::new(10, 0, 0, 2));
        let third = allocator.request_lease("CC", None).await.unwrap();
        assert_eq!(third.host_address, Ipv4Addr::new(10, 0, 0, 10));
    }

    #[tokio::test]
    async fn test_misaligned_lease_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), [10, 0, 0, 16]);
        std::fs::write(
            &config.leases_file,
            r#"{"leases": {"AA": {"ip_address": "10.0.0.3", "expires_at": "2030-01-01T00:00:00Z"}}}"#,
        )
        .unwrap();

        assert!(matches!(
            Allocator::open(&config).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_lease_outside_pool_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path(), [10, 0, 0, 16]);
        std::fs::write(
            &config.leases_file,
            r#"{"leases": {"old": {"ip_address": "172.16.0.2", "expires_at": "2030-01-01T00:00:00Z"}}}"#,
        )
        .unwrap();

        let mut allocator = Allocator::open(&config).await.unwrap();
        let old = allocator.request_lease("old", None).await.unwrap();
        assert_eq!(old.host_address, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(allocator.free_block_count(), 4);
    }
}
