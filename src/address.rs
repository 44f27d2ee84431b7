//! Value types used at the engine boundary.
//!
//! Wire payloads carry addresses and durations as free-form strings. They are
//! parsed into these types on entry so the engine only ever sees validated
//! integers and spans.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Error, Result};

/// Number of addresses in one block: network, router, host, broadcast.
pub const BLOCK_SIZE: u32 = 4;

/// Offset of the router address inside a block.
pub const ROUTER_OFFSET: u32 = 1;

/// Offset of the assignable host address inside a block.
pub const HOST_OFFSET: u32 = 2;

/// Netmask describing a four-address block.
pub const BLOCK_MASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 252);

/// Returns the router address paired with `host`.
///
/// Computed on the big-endian integer form so the carry crosses octets
/// correctly (10.0.1.0 - 1 is 10.0.0.255).
pub fn router_for(host: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(host).wrapping_sub(HOST_OFFSET - ROUTER_OFFSET))
}

/// An Ethernet hardware address, normalised to lowercase colon-separated hex.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl FromStr for HardwareAddress {
    type Err = Error;

    /// Accepts `aa:bb:cc:dd:ee:ff` and `aa-bb-cc-dd-ee-ff`, any case.
    fn from_str(text: &str) -> Result<Self> {
        let invalid = || Error::InvalidRequest(format!("invalid hardware address: {:?}", text));

        let normalized = text.trim().replace('-', ":");
        let mut octets = [0u8; 6];
        let mut parts = normalized.split(':');
        for octet in octets.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            a, b, c, d, e, g
        )
    }
}

/// A span of time written in human-readable form such as `1h` or `30m`.
///
/// Used for the lease duration and the notification timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct LeaseDuration(Duration);

impl LeaseDuration {
    pub fn from_secs(seconds: u64) -> Self {
        Self(Duration::from_secs(seconds))
    }

    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn as_secs(&self) -> u64 {
        self.0.as_secs()
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Lease time as a DHCP option value, saturating at `u32::MAX`.
    pub fn as_option_seconds(&self) -> u32 {
        u32::try_from(self.0.as_secs()).unwrap_or(u32::MAX)
    }

    /// The span as a chrono delta, for arithmetic against wall-clock time.
    pub fn as_time_delta(&self) -> Result<TimeDelta> {
        TimeDelta::from_std(self.0)
            .map_err(|error| Error::InvalidConfig(format!("lease duration out of range: {}", error)))
    }
}

impl FromStr for LeaseDuration {
    type Err = Error;

    fn from_str(text: &str) -> Result<Self> {
        humantime::parse_duration(text)
            .map(Self)
            .map_err(|error| Error::InvalidConfig(format!("invalid duration {:?}: {}", text, error)))
    }
}

impl fmt::Display for LeaseDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", humantime::format_duration(self.0))
    }
}

impl Serialize for LeaseDuration {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for LeaseDuration {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}
