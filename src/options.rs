//! DHCP options for a brokered lease.
//!
//! The packet-handling layer asks the broker for a lease and copies the
//! result into its reply. This module turns a [`LeaseGrant`] into the
//! offered address plus the RFC 2132 options that go with it, so every
//! packet handler fills them in the same way.
//!
//! | Option | Value |
//! |---|---|
//! | 1 Subnet mask | always `255.255.255.252` |
//! | 3 Router | block router address |
//! | 51 Lease time | configured lease duration |
//! | 6 DNS server | DNS override, only if configured and requested |
//! | 54 Server identifier | DNS override if configured, else router |
//!
//! # References
//!
//! - RFC 2132: DHCP Options and BOOTP Vendor Extensions

use std::net::Ipv4Addr;

use tracing::warn;

use crate::address::BLOCK_MASK;
use crate::client::BrokerClient;
use crate::protocol::LeaseGrant;

/// DHCP option codes written for a brokered lease.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OptionCode {
    /// Subnet mask (RFC 2132 §3.3).
    SubnetMask = 1,
    /// Router/gateway addresses (RFC 2132 §3.5).
    Router = 3,
    /// DNS server addresses (RFC 2132 §3.8).
    DnsServer = 6,
    /// IP address lease time in seconds (RFC 2132 §9.2).
    LeaseTime = 51,
    /// Server identifier (RFC 2132 §9.7).
    ServerIdentifier = 54,
}

/// One option of a lease reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhcpOption {
    /// Subnet mask (Option 1).
    SubnetMask(Ipv4Addr),
    /// Router address (Option 3).
    Router(Ipv4Addr),
    /// DNS server address (Option 6).
    DnsServer(Ipv4Addr),
    /// Lease time in seconds (Option 51).
    LeaseTime(u32),
    /// Server identifier (Option 54).
    ServerIdentifier(Ipv4Addr),
}

impl DhcpOption {
    /// Returns the RFC 2132 option code for this option.
    pub fn option_code(&self) -> u8 {
        match self {
            Self::SubnetMask(_) => OptionCode::SubnetMask as u8,
            Self::Router(_) => OptionCode::Router as u8,
            Self::DnsServer(_) => OptionCode::DnsServer as u8,
            Self::LeaseTime(_) => OptionCode::LeaseTime as u8,
            Self::ServerIdentifier(_) => OptionCode::ServerIdentifier as u8,
        }
    }

    /// Encodes the option to its wire format (code + length + data).
    pub fn encode(&self) -> Vec<u8> {
        let data = match self {
            Self::SubnetMask(addr)
            | Self::Router(addr)
            | Self::DnsServer(addr)
            | Self::ServerIdentifier(addr) => addr.octets(),
            Self::LeaseTime(time) => time.to_be_bytes(),
        };
        let mut result = vec![self.option_code(), data.len() as u8];
        result.extend_from_slice(&data);
        result
    }
}

/// Address and options to put into a DHCP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseOffer {
    /// Value for the reply's `yiaddr`.
    pub your_address: Ipv4Addr,
    pub options: Vec<DhcpOption>,
}

impl LeaseOffer {
    /// Builds the reply contents for `grant`.
    ///
    /// `parameter_request_list` is the client's Option 55, if sent; the DNS
    /// option is only included when the client asked for it.
    pub fn from_grant(grant: &LeaseGrant, parameter_request_list: Option<&[u8]>) -> Self {
        let mut options = vec![
            DhcpOption::SubnetMask(BLOCK_MASK),
            DhcpOption::Router(grant.router_address),
            DhcpOption::LeaseTime(grant.lease_time.as_option_seconds()),
        ];

        let wants_dns = parameter_request_list
            .is_some_and(|prl| prl.contains(&(OptionCode::DnsServer as u8)));
        if let Some(dns) = grant.dns_override
            && wants_dns
        {
            options.push(DhcpOption::DnsServer(dns));
        }

        let server_identifier = grant.dns_override.unwrap_or(grant.router_address);
        options.push(DhcpOption::ServerIdentifier(server_identifier));

        Self {
            your_address: grant.host_address,
            options,
        }
    }

    /// Looks up an option by code.
    pub fn option(&self, code: OptionCode) -> Option<&DhcpOption> {
        self.options
            .iter()
            .find(|option| option.option_code() == code as u8)
    }

    /// Encoded options section, without the End marker.
    pub fn encode_options(&self) -> Vec<u8> {
        self.options.iter().flat_map(DhcpOption::encode).collect()
    }
}

/// Asks the broker for a lease and builds the reply contents.
///
/// Returns `None` when no lease is available for any reason. The caller
/// must then send no offer at all.
pub async fn offer_for(
    client: &BrokerClient,
    client_key: &str,
    interface_name: &str,
    host_name: &str,
    parameter_request_list: Option<&[u8]>,
) -> Option<LeaseOffer> {
    match client
        .request_lease(client_key, interface_name, host_name)
        .await
    {
        Ok(grant) => Some(LeaseOffer::from_grant(&grant, parameter_request_list)),
        Err(error) => {
            warn!("No lease for {} on {}: {}", client_key, interface_name, error);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::LeaseDuration;

    fn grant(dns_override: Option<Ipv4Addr>) -> LeaseGrant {
        LeaseGrant {
            host_address: Ipv4Addr::new(10, 0, 0, 6),
            router_address: Ipv4Addr::new(10, 0, 0, 5),
            dns_override,
            lease_time: LeaseDuration::from_secs(3600),
        }
    }

    #[test]
    fn test_offer_without_dns_override() {
        let offer = LeaseOffer::from_grant(&grant(None), Some(&[1, 3, 6, 15]));
        assert_eq!(offer.your_address, Ipv4Addr::new(10, 0, 0, 6));
        assert_eq!(
            offer.options,
            vec![
                DhcpOption::SubnetMask(Ipv4Addr::new(255, 255, 255, 252)),
                DhcpOption::Router(Ipv4Addr::new(10, 0, 0, 5)),
                DhcpOption::LeaseTime(3600),
                DhcpOption::ServerIdentifier(Ipv4Addr::new(10, 0, 0, 5)),
            ]
        );
    }

    #[test]
    fn test_dns_override_only_when_requested() {
        let dns = Ipv4Addr::new(10, 53, 0, 1);

        let requested = LeaseOffer::from_grant(&grant(Some(dns)), Some(&[1, 3, 6]));
        assert_eq!(
            requested.option(OptionCode::DnsServer),
            Some(&DhcpOption::DnsServer(dns))
        );
        assert_eq!(
            requested.option(OptionCode::ServerIdentifier),
            Some(&DhcpOption::ServerIdentifier(dns))
        );

        let not_requested = LeaseOffer::from_grant(&grant(Some(dns)), Some(&[1, 3]));
        assert_eq!(not_requested.option(OptionCode::DnsServer), None);
        assert_eq!(
            not_requested.option(OptionCode::ServerIdentifier),
            Some(&DhcpOption::ServerIdentifier(dns))
        );

        let no_list = LeaseOffer::from_grant(&grant(Some(dns)), None);
        assert_eq!(no_list.option(OptionCode::DnsServer), None);
    }

    #[test]
    fn test_encode_options() {
        let offer = LeaseOffer::from_grant(&grant(None), None);
        assert_eq!(
            offer.encode_options(),
            vec![
                1, 4, 255, 255, 255, 252, //
                3, 4, 10, 0, 0, 5, //
                51, 4, 0, 0, 0x0e, 0x10, //
                54, 4, 10, 0, 0, 5,
            ]
        );
    }

    #[tokio::test]
    async fn test_no_offer_without_broker() {
        let dir = tempfile::tempdir().unwrap();
        let client = BrokerClient::new(dir.path().join("missing.sock"));
        let offer = offer_for(&client, "aa:bb:cc:dd:ee:ff", "eth1", "laptop", None).await;
        assert!(offer.is_none());
    }
}
