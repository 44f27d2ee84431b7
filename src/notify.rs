//! Post-allocation notification hook.
//!
//! After the broker hands out a lease it tells a [`LeaseNotifier`] about it,
//! typically to let an external script set up routes or firewall rules for
//! the new block. Notification runs after the engine lock is released, under
//! a timeout, and its outcome never affects the lease already granted.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::NotifyConfig;
use crate::error::{Error, Result};

/// A lease that was just handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseEvent {
    pub host_address: Ipv4Addr,
    pub client_key: String,
    pub host_name: String,
    pub interface_name: String,
    pub router_address: Ipv4Addr,
}

#[async_trait]
pub trait LeaseNotifier: Send + Sync {
    async fn lease_granted(&self, event: &LeaseEvent) -> Result<()>;
}

/// Runs an executable as `script <ip> <client> <name> <iface> <router>`.
#[derive(Debug, Clone)]
pub struct ScriptNotifier {
    script: PathBuf,
}

impl ScriptNotifier {
    pub fn new(script: PathBuf) -> Self {
        Self { script }
    }
}

#[async_trait]
impl LeaseNotifier for ScriptNotifier {
    async fn lease_granted(&self, event: &LeaseEvent) -> Result<()> {
        let status = Command::new(&self.script)
            .arg(event.host_address.to_string())
            .arg(&event.client_key)
            .arg(&event.host_name)
            .arg(&event.interface_name)
            .arg(event.router_address.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await?;

        if !status.success() {
            return Err(Error::Io(std::io::Error::other(format!(
                "{} exited with {}",
                self.script.display(),
                status
            ))));
        }
        Ok(())
    }
}

/// A notifier plus the time it is allowed to take.
#[derive(Clone)]
pub struct BoundedNotifier {
    notifier: std::sync::Arc<dyn LeaseNotifier>,
    timeout: Duration,
}

impl BoundedNotifier {
    pub fn new(notifier: std::sync::Arc<dyn LeaseNotifier>, timeout: Duration) -> Self {
        Self { notifier, timeout }
    }

    pub fn from_config(config: &NotifyConfig) -> Self {
        Self::new(
            std::sync::Arc::new(ScriptNotifier::new(config.script.clone())),
            config.timeout.as_duration(),
        )
    }

    /// Delivers `event`, logging and swallowing failures and timeouts.
    ///
    /// Returns `true` if the notifier completed successfully in time.
    pub async fn deliver(&self, event: &LeaseEvent) -> bool {
        match tokio::time::timeout(self.timeout, self.notifier.lease_granted(event)).await {
            Ok(Ok(())) => {
                debug!("Notified lease {} for {}", event.host_address, event.client_key);
                true
            }
            Ok(Err(error)) => {
                warn!(
                    "Lease notification for {} failed: {}",
                    event.client_key, error
                );
                false
            }
            Err(_) => {
                warn!(
                    "Lease notification for {} timed out after {:?}",
                    event.client_key, self.timeout
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for BoundedNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoundedNotifier")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
