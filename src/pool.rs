//! Address pool geometry and the derived taken-block index.
//!
//! The index is never persisted. It is rebuilt from the lease table at
//! startup and updated only after the table has been written successfully.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::address::{BLOCK_SIZE, HOST_OFFSET};
use crate::config::Config;
use crate::error::{Error, Result};

/// The configured range, carved into four-address blocks from `start`.
///
/// A block starting at `b` is usable only if its broadcast address `b + 3`
/// lies strictly below `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolRange {
    start: u32,
    end: u32,
}

impl PoolRange {
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        let start = u32::from(start);
        let end = u32::from(end);
        if start >= end {
            return Err(Error::InvalidConfig(
                "start of the address range must be lower than its end".to_string(),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        Self::new(config.pool_start, config.pool_end)
    }

    /// Host-address offsets of every block, in ascending order.
    pub fn host_offsets(&self) -> impl Iterator<Item = u32> + use<> {
        let end = self.end;
        (self.start..end)
            .step_by(BLOCK_SIZE as usize)
            .take_while(move |block| {
                block
                    .checked_add(BLOCK_SIZE - 1)
                    .is_some_and(|broadcast| broadcast < end)
            })
            .map(|block| block + HOST_OFFSET)
    }

    /// True if `host` is the host address of one of this range's blocks.
    pub fn holds_host(&self, host: Ipv4Addr) -> bool {
        let host = u64::from(u32::from(host));
        let start = u64::from(self.start);
        let broadcast_gap = u64::from(BLOCK_SIZE - 1 - HOST_OFFSET);
        host >= start + u64::from(HOST_OFFSET)
            && (host - start) % u64::from(BLOCK_SIZE) == u64::from(HOST_OFFSET)
            && host + broadcast_gap < u64::from(self.end)
    }

    pub fn block_count(&self) -> usize {
        self.host_offsets().count()
    }
}

/// Set of host-address offsets currently assigned.
#[derive(Debug, Default, Clone)]
pub struct AddressPoolIndex {
    taken: BTreeSet<u32>,
}

impl AddressPoolIndex {
    /// Builds the index in one pass over the stored host addresses.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if two records share a host address.
    pub fn rebuild<'a, I>(hosts: I) -> Result<Self>
    where
        I: IntoIterator<Item = (&'a str, Ipv4Addr)>,
    {
        let mut index = Self::default();
        for (key, host) in hosts {
            if index.is_taken(u32::from(host)) {
                return Err(Error::InvalidConfig(format!(
                    "lease file assigns {} more than once (again to {})",
                    host, key
                )));
            }
            index.mark_taken(u32::from(host));
        }
        Ok(index)
    }

    pub fn is_taken(&self, offset: u32) -> bool {
        self.taken.contains(&offset)
    }

    pub fn mark_taken(&mut self, offset: u32) {
        self.taken.insert(offset);
    }

    pub fn len(&self) -> usize {
        self.taken.len()
    }

    pub fn is_empty(&self) -> bool {
        self.taken.is_empty()
    }
}
