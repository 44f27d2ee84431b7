use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use crate::address::{BLOCK_SIZE, LeaseDuration};
use crate::error::{Error, Result};

/// Well-known filesystem path of the broker socket.
pub const DEFAULT_SOCKET_PATH: &str = "/state/dhcp/tinysubnets_plugin";

const DEFAULT_NOTIFY_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pool_start: Ipv4Addr,
    pub pool_end: Ipv4Addr,
    pub lease_duration: LeaseDuration,
    pub leases_file: PathBuf,
    pub socket_path: PathBuf,
    #[serde(default)]
    pub dns_override: Option<Ipv4Addr>,
    #[serde(default)]
    pub upstream_interface: Option<String>,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
}

/// External script run after each successful lease handed out over the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub script: PathBuf,
    #[serde(default = "default_notify_timeout")]
    pub timeout: LeaseDuration,
}

fn default_notify_timeout() -> LeaseDuration {
    LeaseDuration::from_secs(DEFAULT_NOTIFY_TIMEOUT_SECS)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool_start: Ipv4Addr::new(192, 168, 2, 0),
            pool_end: Ipv4Addr::new(192, 168, 3, 255),
            lease_duration: LeaseDuration::from_secs(3600),
            leases_file: PathBuf::from("leases.json"),
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            dns_override: None,
            upstream_interface: None,
            notify: None,
        }
    }
}

impl Config {
    pub fn load_or_create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&content)?;
            config.validate()?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let start = u32::from(self.pool_start);
        let end = u32::from(self.pool_end);

        if start >= end {
            return Err(Error::InvalidConfig(
                "pool_start must be lower than pool_end".to_string(),
            ));
        }

        if end - start < BLOCK_SIZE {
            return Err(Error::InvalidConfig(format!(
                "pool {} - {} is too small for a single {}-address block",
                self.pool_start, self.pool_end, BLOCK_SIZE
            )));
        }

        if self.lease_duration.is_zero() {
            return Err(Error::InvalidConfig(
                "lease_duration must be greater than 0".to_string(),
            ));
        }
        self.lease_duration.as_time_delta()?;

        if self.leases_file.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "leases_file cannot be empty".to_string(),
            ));
        }

        if self.socket_path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig(
                "socket_path cannot be empty".to_string(),
            ));
        }

        if let Some(ref upstream) = self.upstream_interface
            && upstream.trim().is_empty()
        {
            return Err(Error::InvalidConfig(
                "upstream_interface cannot be blank".to_string(),
            ));
        }

        if let Some(ref notify) = self.notify
            && notify.timeout.is_zero()
        {
            return Err(Error::InvalidConfig(
                "notify.timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Number of complete four-address blocks in the pool.
    pub fn block_count(&self) -> u32 {
        (u32::from(self.pool_end) - u32::from(self.pool_start)) / BLOCK_SIZE
    }
}
