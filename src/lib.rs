//! # tinysubnets
//!
//! A lease engine that hands every client its own four-address block (a
//! `/30`: network, router, host, broadcast) and keeps the assignments across
//! restarts.
//!
//! ## Features
//!
//! - Deterministic lowest-free-block allocation
//! - Renewal of existing leases on every request
//! - Crash-safe JSON lease file, written before any state changes in memory
//! - Local IPC broker (HTTP over a Unix socket) for the DHCP packet layer
//! - Optional notification script after each brokered lease
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tinysubnets::{Broker, Config, Leases};
//!
//! #[tokio::main]
//! async fn main() -> tinysubnets::Result<()> {
//!     let config = Arc::new(Config::load_or_create("config.json")?);
//!     let leases = Arc::new(Leases::new(config).await?);
//!     Broker::new(leases).run().await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Pool range, lease duration, file and socket paths
//! - [`LeaseRecordStore`] - Lease table and its on-disk copy
//! - [`AddressPoolIndex`] - Blocks in use, derived from the store
//! - [`Allocator`] - Renewal and block scan
//! - [`Leases`] - The allocator behind one lock, shared by all callers
//! - [`Broker`] - IPC server in front of [`Leases`]
//! - [`BrokerClient`] - Counterpart used by the packet-handling layer
//! - [`LeaseOffer`] - DHCP options built from a brokered lease

pub mod address;
pub mod allocator;
pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod lease;
pub mod notify;
pub mod options;
pub mod pool;
pub mod protocol;
pub mod store;

pub use address::{HardwareAddress, LeaseDuration};
pub use allocator::Allocator;
pub use broker::Broker;
pub use client::BrokerClient;
pub use config::Config;
pub use error::{Error, Result};
pub use lease::Leases;
pub use notify::{BoundedNotifier, LeaseEvent, LeaseNotifier};
pub use options::{DhcpOption, LeaseOffer};
pub use pool::{AddressPoolIndex, PoolRange};
pub use protocol::{LeaseGrant, LeaseRequest, LeaseResponse};
pub use store::{LeaseRecord, LeaseRecordStore};
