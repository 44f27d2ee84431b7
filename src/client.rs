//! Broker client for the packet-handling layer.
//!
//! Every failure (unreachable socket, broken exchange, non-success status or
//! an undecodable body) comes back as an error. Callers must treat any error
//! as "no lease" and must never fall back to a cached or default address.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::Request;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::net::UnixStream;
use tracing::debug;

use crate::config::DEFAULT_SOCKET_PATH;
use crate::error::{Error, Result};
use crate::protocol::{
    ABSTRACT_REQUEST_PATH, AbstractLeaseRequest, LEASE_REQUEST_PATH, LeaseGrant, LeaseRequest,
    LeaseResponse,
};

/// Issues lease requests to a broker over its Unix socket.
///
/// No timeout is applied here; a caller that wraps calls in one must treat
/// expiry as "no lease" rather than retrying concurrently for the same key.
#[derive(Debug, Clone)]
pub struct BrokerClient {
    socket_path: PathBuf,
}

impl Default for BrokerClient {
    fn default() -> Self {
        Self::new(DEFAULT_SOCKET_PATH)
    }
}

impl BrokerClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
        }
    }

    /// Requests a lease for a DHCP client.
    ///
    /// `client_key` is sent as the hardware address when it parses as one,
    /// otherwise as an abstract identifier.
    pub async fn request_lease(
        &self,
        client_key: &str,
        interface_name: &str,
        host_name: &str,
    ) -> Result<LeaseGrant> {
        let request = if client_key.parse::<crate::address::HardwareAddress>().is_ok() {
            LeaseRequest {
                mac: client_key.to_string(),
                name: host_name.to_string(),
                iface: interface_name.to_string(),
                ..Default::default()
            }
        } else {
            LeaseRequest {
                identifier: client_key.to_string(),
                name: host_name.to_string(),
                iface: interface_name.to_string(),
                ..Default::default()
            }
        };
        self.send(LEASE_REQUEST_PATH, &request).await
    }

    /// Sends a prepared lease request as-is.
    pub async fn send_lease_request(&self, request: &LeaseRequest) -> Result<LeaseGrant> {
        self.send(LEASE_REQUEST_PATH, request).await
    }

    /// Requests an address for a non-DHCP caller.
    pub async fn request_abstract(&self, identifier: &str) -> Result<LeaseGrant> {
        let request = AbstractLeaseRequest {
            identifier: identifier.to_string(),
        };
        self.send(ABSTRACT_REQUEST_PATH, &request).await
    }

    async fn send<T: Serialize>(&self, path: &str, payload: &T) -> Result<LeaseGrant> {
        let body = serde_json::to_vec(payload)?;

        let stream = UnixStream::connect(&self.socket_path).await.map_err(|error| {
            Error::Transport(format!(
                "cannot connect to {}: {}",
                self.socket_path.display(),
                error
            ))
        })?;

        let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(transport)?;
        tokio::spawn(async move {
            if let Err(error) = connection.await {
                debug!("Broker connection closed with error: {}", error);
            }
        });

        let request = Request::builder()
            .method(Method::PUT)
            .uri(path)
            .header(HOST, "localhost")
            .header(CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|error| Error::Transport(error.to_string()))?;

        let response = sender.send_request(request).await.map_err(transport)?;
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(transport)?
            .to_bytes();

        if status != StatusCode::OK {
            return Err(Error::Broker {
                status: status.as_u16(),
                message: String::from_utf8_lossy(&bytes).trim().to_string(),
            });
        }

        let response: LeaseResponse = serde_json::from_slice(&bytes)
            .map_err(|error| Error::Transport(format!("undecodable lease response: {}", error)))?;
        LeaseGrant::try_from(response)
    }
}

fn transport(error: hyper::Error) -> Error {
    Error::Transport(error.to_string())
}
