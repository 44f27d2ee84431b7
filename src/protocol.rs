//! Broker wire contract.
//!
//! Requests and responses are JSON bodies carried over HTTP on a local Unix
//! socket. Field names follow the established wire format (`MAC`, `IP`,
//! `LeaseTime`, ...) and every value travels as a string; [`LeaseGrant`] is
//! the typed form callers work with.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::address::{HardwareAddress, LeaseDuration};
use crate::error::{Error, Result};
use crate::store::LeaseRecord;

/// Route for lease requests from the packet-handling layer.
pub const LEASE_REQUEST_PATH: &str = "/dhcpRequest";

/// Route for address requests from callers that do not speak DHCP.
pub const ABSTRACT_REQUEST_PATH: &str = "/DHCPRequest";

/// Substituted for a host name that sanitizes to nothing.
pub const MISSING_NAME_PLACEHOLDER: &str = "DefaultMissingName";

/// Lease request for a DHCP client.
///
/// `MAC` identifies the client; `Identifier` is used instead when `MAC` is
/// empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRequest {
    #[serde(rename = "MAC", default)]
    pub mac: String,
    #[serde(rename = "Identifier", default)]
    pub identifier: String,
    #[serde(rename = "Name", default)]
    pub name: String,
    #[serde(rename = "Iface", default)]
    pub iface: String,
}

impl LeaseRequest {
    /// Resolves the key the lease is stored under.
    ///
    /// A hardware address is normalised (`aa:bb:cc:dd:ee:ff`); an identifier
    /// is sanitized.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] if `MAC` does not parse or if neither
    /// field yields a usable key.
    pub fn client_key(&self) -> Result<String> {
        if !self.mac.trim().is_empty() {
            let mac: HardwareAddress = self.mac.parse()?;
            return Ok(mac.to_string());
        }

        let key = sanitize(&self.identifier);
        if key.is_empty() {
            return Err(Error::InvalidRequest(
                "request carries neither MAC nor Identifier".to_string(),
            ));
        }
        Ok(key)
    }

    /// Sanitized host name, or the placeholder if nothing is left.
    pub fn host_name(&self) -> String {
        let name = sanitize(&self.name);
        if name.is_empty() {
            MISSING_NAME_PLACEHOLDER.to_string()
        } else {
            name
        }
    }

    /// Sanitized interface name; may be empty.
    pub fn interface_name(&self) -> String {
        sanitize(&self.iface)
    }
}

/// Address request from a caller that does not speak DHCP.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbstractLeaseRequest {
    #[serde(rename = "Identifier")]
    pub identifier: String,
}

impl AbstractLeaseRequest {
    /// Resolves the key the lease is stored under.
    ///
    /// The identifier must be a single non-empty token. It is then sanitized
    /// exactly like `Identifier` in a [`LeaseRequest`], so both routes map the
    /// same caller onto the same lease.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidRequest`] for empty identifiers, surrounding
    /// whitespace, embedded spaces or newlines, or an identifier with no
    /// allowed characters at all.
    pub fn client_key(&self) -> Result<String> {
        let identifier = self.identifier.as_str();
        if identifier.is_empty()
            || identifier.trim() != identifier
            || identifier.contains(' ')
            || identifier.contains('\n')
        {
            return Err(Error::InvalidRequest("Invalid Identifier".to_string()));
        }

        let key = sanitize(identifier);
        if key.is_empty() {
            return Err(Error::InvalidRequest("Invalid Identifier".to_string()));
        }
        Ok(key)
    }
}

/// Lease response body, as sent on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseResponse {
    #[serde(rename = "IP")]
    pub ip: String,
    #[serde(rename = "RouterIP")]
    pub router_ip: String,
    #[serde(rename = "DNSIP", default)]
    pub dns_ip: String,
    #[serde(rename = "LeaseTime")]
    pub lease_time: String,
}

/// A lease as handed to the packet-handling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseGrant {
    pub host_address: Ipv4Addr,
    pub router_address: Ipv4Addr,
    pub dns_override: Option<Ipv4Addr>,
    pub lease_time: LeaseDuration,
}

impl LeaseGrant {
    pub fn from_record(
        record: &LeaseRecord,
        dns_override: Option<Ipv4Addr>,
        lease_time: LeaseDuration,
    ) -> Self {
        Self {
            host_address: record.host_address,
            router_address: record.router_address(),
            dns_override,
            lease_time,
        }
    }
}

impl From<LeaseGrant> for LeaseResponse {
    fn from(grant: LeaseGrant) -> Self {
        Self {
            ip: grant.host_address.to_string(),
            router_ip: grant.router_address.to_string(),
            dns_ip: grant
                .dns_override
                .map(|dns| dns.to_string())
                .unwrap_or_default(),
            lease_time: grant.lease_time.to_string(),
        }
    }
}

impl TryFrom<LeaseResponse> for LeaseGrant {
    type Error = Error;

    fn try_from(response: LeaseResponse) -> Result<Self> {
        let address = |field: &str, text: &str| -> Result<Ipv4Addr> {
            text.parse().map_err(|_| {
                Error::Transport(format!("broker sent invalid {}: {:?}", field, text))
            })
        };

        let dns_override = if response.dns_ip.is_empty() {
            None
        } else {
            Some(address("DNSIP", &response.dns_ip)?)
        };

        let lease_time = response.lease_time.parse::<LeaseDuration>().map_err(|_| {
            Error::Transport(format!(
                "broker sent invalid LeaseTime: {:?}",
                response.lease_time
            ))
        })?;

        Ok(Self {
            host_address: address("IP", &response.ip)?,
            router_address: address("RouterIP", &response.router_ip)?,
            dns_override,
            lease_time,
        })
    }
}

/// Strips everything but ASCII letters, digits, `.`, `-` and `_`.
pub fn sanitize(text: &str) -> String {
    text.chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        .collect()
}
