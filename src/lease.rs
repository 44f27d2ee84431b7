//! Thread-safe lease engine handle.
//!
//! [`Leases`] is constructed once at startup and shared (behind an [`Arc`])
//! by the broker and any in-process caller.
//!
//! # Thread Safety
//!
//! Every operation goes through one [`Mutex`] around the [`Allocator`], so
//! lookup, renewal decision, block scan and commit run as a single atomic
//! step relative to all other requests. The lock is held across the lease
//! file write and released before anything touches the network.

use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::allocator::Allocator;
use crate::config::Config;
use crate::error::Result;
use crate::store::LeaseRecord;

/// Lease engine shared across requests.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use tinysubnets::{Config, Leases};
///
/// # async fn example() -> tinysubnets::Result<()> {
/// let config = Arc::new(Config::default());
/// let leases = Leases::new(config).await?;
///
/// let lease = leases.request_lease("aa:bb:cc:dd:ee:ff", None).await?;
/// println!("{} via {}", lease.host_address, lease.router_address());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Leases {
    allocator: Mutex<Allocator>,
    config: Arc<Config>,
}

impl Leases {
    /// Creates the engine, loading existing leases from `config.leases_file`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the lease file
    /// exists but cannot be read, parsed or reconciled with the pool.
    pub async fn new(config: Arc<Config>) -> Result<Self> {
        let allocator = Allocator::open(&config).await?;
        Ok(Self {
            allocator: Mutex::new(allocator),
            config,
        })
    }

    /// Returns the client's lease, renewing it or allocating a fresh block.
    ///
    /// See [`Allocator::request_lease`] for the error cases.
    pub async fn request_lease(
        &self,
        client_key: &str,
        block_mask: Option<Ipv4Addr>,
    ) -> Result<LeaseRecord> {
        let mut allocator = self.allocator.lock().await;
        allocator.request_lease(client_key, block_mask).await
    }

    /// Returns the lease for a client, if one exists.
    pub async fn get_lease(&self, client_key: &str) -> Option<LeaseRecord> {
        let allocator = self.allocator.lock().await;
        allocator.get(client_key).cloned()
    }

    /// Returns all leases (including expired ones), ordered by host address.
    pub async fn list_leases(&self) -> Vec<LeaseRecord> {
        let allocator = self.allocator.lock().await;
        let mut leases: Vec<LeaseRecord> = allocator.records().cloned().collect();
        leases.sort_by_key(|lease| lease.host_address);
        leases
    }

    /// Returns the count of blocks still available in the pool.
    pub async fn free_block_count(&self) -> usize {
        let allocator = self.allocator.lock().await;
        allocator.free_block_count()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::LeaseDuration;
    use crate::error::Error;
    use std::collections::HashSet;
    use std::path::Path;

    fn test_config(dir: &Path, end: Ipv4Addr) -> Arc<Config> {
        Arc::new(Config {
            pool_start: Ipv4Addr::new(10, 0, 0, 0),
            pool_end: end,
            lease_duration: LeaseDuration::from_secs(3600),
            leases_file: dir.join("leases.json"),
            socket_path: dir.join("broker.sock"),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_lease_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let leases = Leases::new(test_config(dir.path(), Ipv4Addr::new(10, 0, 0, 16)))
            .await
            .unwrap();

        assert_eq!(leases.free_block_count().await, 4);
        assert!(leases.get_lease("AA").await.is_none());

        let lease = leases.request_lease("AA", None).await.unwrap();
        assert_eq!(leases.get_lease("AA").await, Some(lease.clone()));
        assert_eq!(leases.free_block_count().await, 3);

        let renewed = leases.request_lease("AA", None).await.unwrap();
        assert_eq!(renewed.host_address, lease.host_address);
        assert!(renewed.expires_at >= lease.expires_at);
        assert_eq!(leases.free_block_count().await, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_allocations() {
        let dir = tempfile::tempdir().unwrap();
        // 100 blocks: 10.0.0.0 .. 10.0.1.144
        let end = Ipv4Addr::from(u32::from(Ipv4Addr::new(10, 0, 0, 0)) + 400);
        let leases = Arc::new(Leases::new(test_config(dir.path(), end)).await.unwrap());

        let mut handles = vec![];
        for index in 0..100 {
            let leases_clone = Arc::clone(&leases);
            handles.push(tokio::spawn(async move {
                let key = format!("client-{}", index);
                leases_clone.request_lease(&key, None).await
            }));
        }

        let mut allocated = HashSet::new();
        for handle in handles {
            let lease = handle.await.unwrap().unwrap();
            let block = u32::from(lease.host_address) / 4;
            assert!(allocated.insert(block), "Duplicate block: {}", lease.host_address);
        }
        assert_eq!(allocated.len(), 100);
        assert_eq!(leases.free_block_count().await, 0);

        let result = leases.request_lease("client-100", None).await;
        assert!(matches!(result, Err(Error::PoolExhausted)));

        drop(leases);
        let reloaded = Leases::new(test_config(dir.path(), end)).await.unwrap();
        assert_eq!(reloaded.list_leases().await.len(), 100);
    }

    #[tokio::test]
    async fn test_list_leases_sorted() {
        let dir = tempfile::tempdir().unwrap();
        let leases = Leases::new(test_config(dir.path(), Ipv4Addr::new(10, 0, 0, 16)))
            .await
            .unwrap();

        for key in ["zz", "yy", "xx"] {
            leases.request_lease(key, None).await.unwrap();
        }

        let listed = leases.list_leases().await;
        let keys: Vec<&str> = listed.iter().map(|lease| lease.client_key.as_str()).collect();
        assert_eq!(keys, vec!["zz", "yy", "xx"]);
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_at_setup() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(Config {
            pool_start: Ipv4Addr::new(10, 0, 0, 16),
            pool_end: Ipv4Addr::new(10, 0, 0, 0),
            leases_file: dir.path().join("leases.json"),
            ..Default::default()
        });
        assert!(matches!(
            Leases::new(config).await,
            Err(Error::InvalidConfig(_))
        ));
    }
}
