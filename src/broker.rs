//! Local IPC broker.
//!
//! Serves lease requests over HTTP on a Unix domain socket so that the
//! process handling DHCP packets can obtain leases without embedding the
//! allocation engine. Requests carry no authentication, so the broker only
//! ever listens on a filesystem path, with the socket restricted to its
//! owner.
//!
//! | Route | Body | Used by |
//! |---|---|---|
//! | `PUT /dhcpRequest` | [`LeaseRequest`] | packet-handling layer |
//! | `PUT /DHCPRequest` | [`AbstractLeaseRequest`] | non-DHCP callers |
//!
//! Both answer with a [`LeaseResponse`] on success and a plain-text error
//! body with a 4xx status otherwise.

use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use axum::{Json, Router};
use bytes::Bytes;
use tokio::net::UnixListener;
use tracing::{info, warn};

use crate::address::LeaseDuration;
use crate::error::{Error, Result};
use crate::lease::Leases;
use crate::notify::{BoundedNotifier, LeaseEvent};
use crate::protocol::{
    ABSTRACT_REQUEST_PATH, AbstractLeaseRequest, LEASE_REQUEST_PATH, LeaseGrant, LeaseRequest,
    LeaseResponse,
};
use crate::store::LeaseRecord;

#[derive(Debug, Clone)]
struct BrokerState {
    leases: Arc<Leases>,
    notifier: Option<BoundedNotifier>,
    dns_override: Option<Ipv4Addr>,
    lease_duration: LeaseDuration,
    upstream_interface: Option<String>,
}

impl BrokerState {
    fn grant(&self, record: &LeaseRecord) -> LeaseGrant {
        LeaseGrant::from_record(record, self.dns_override, self.lease_duration)
    }
}

/// Broker IPC server bound to the engine it serves.
#[derive(Debug)]
pub struct Broker {
    state: BrokerState,
    socket_path: PathBuf,
}

impl Broker {
    /// Creates a broker for `leases`, taking socket path, DNS override,
    /// upstream interface and notification hook from the engine's config.
    pub fn new(leases: Arc<Leases>) -> Self {
        let config = leases.config();
        let state = BrokerState {
            notifier: config.notify.as_ref().map(BoundedNotifier::from_config),
            dns_override: config.dns_override,
            lease_duration: config.lease_duration,
            upstream_interface: config.upstream_interface.clone(),
            leases: Arc::clone(&leases),
        };
        let socket_path = config.socket_path.clone();
        Self { state, socket_path }
    }

    /// Replaces the notification hook.
    pub fn with_notifier(mut self, notifier: BoundedNotifier) -> Self {
        self.state.notifier = Some(notifier);
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route(LEASE_REQUEST_PATH, put(lease_request_handler))
            .route(ABSTRACT_REQUEST_PATH, put(abstract_request_handler))
            .layer(middleware::from_fn(log_request))
            .with_state(self.state.clone())
    }

    /// Binds the socket, replacing a stale socket file left by a previous run.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or the
    /// socket cannot be bound.
    pub fn bind(&self) -> Result<UnixListener> {
        if let Some(parent) = self.socket_path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        match std::fs::remove_file(&self.socket_path) {
            Ok(()) => info!("Removed stale socket {}", self.socket_path.display()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => return Err(error.into()),
        }

        let listener = UnixListener::bind(&self.socket_path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.socket_path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(listener)
    }

    /// Serves requests until the process exits.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Serves requests until `shutdown` resolves, then removes the socket.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Serves requests on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(self, listener: UnixListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Lease broker listening on {}", self.socket_path.display());

        let result = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;

        if let Err(error) = std::fs::remove_file(&self.socket_path)
            && error.kind() != std::io::ErrorKind::NotFound
        {
            warn!(
                "Failed to remove socket {}: {}",
                self.socket_path.display(),
                error
            );
        }

        result.map_err(Error::from)
    }
}

/// Failure of a single broker request.
#[derive(Debug)]
enum BrokerError {
    /// The request itself was unacceptable.
    Rejected(Error),
    /// The engine could not produce a lease.
    Allocation(Error),
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> Response {
        match self {
            Self::Rejected(error @ Error::UpstreamInterface(_)) => {
                (StatusCode::FORBIDDEN, error.to_string()).into_response()
            }
            Self::Rejected(error) => (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
            Self::Allocation(error) => (
                StatusCode::CONFLICT,
                format!("Failed to get IP: {}", error),
            )
                .into_response(),
        }
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(body: &Bytes) -> std::result::Result<T, BrokerError> {
    serde_json::from_slice(body).map_err(|error| {
        BrokerError::Rejected(Error::InvalidRequest(format!("malformed body: {}", error)))
    })
}

async fn lease_request_handler(
    State(state): State<BrokerState>,
    body: Bytes,
) -> std::result::Result<Json<LeaseResponse>, BrokerError> {
    let request: LeaseRequest = parse_body(&body)?;
    let client_key = request.client_key().map_err(BrokerError::Rejected)?;
    let host_name = request.host_name();
    let interface_name = request.interface_name();

    if let Some(ref upstream) = state.upstream_interface
        && *upstream == interface_name
    {
        warn!(
            "Refusing lease for {} on upstream interface {}",
            client_key, interface_name
        );
        return Err(BrokerError::Rejected(Error::UpstreamInterface(
            interface_name,
        )));
    }

    let record = state
        .leases
        .request_lease(&client_key, None)
        .await
        .map_err(BrokerError::Allocation)?;
    let grant = state.grant(&record);

    info!(
        "Found IP address {} for {} ({}) on {}",
        grant.host_address, client_key, host_name, interface_name
    );

    if let Some(notifier) = state.notifier.clone() {
        let event = LeaseEvent {
            host_address: grant.host_address,
            client_key,
            host_name,
            interface_name,
            router_address: grant.router_address,
        };
        tokio::spawn(async move {
            notifier.deliver(&event).await;
        });
    }

    Ok(Json(grant.into()))
}

async fn abstract_request_handler(
    State(state): State<BrokerState>,
    body: Bytes,
) -> std::result::Result<Json<LeaseResponse>, BrokerError> {
    let request: AbstractLeaseRequest = parse_body(&body)?;
    let client_key = request.client_key().map_err(BrokerError::Rejected)?;

    let record = state
        .leases
        .request_lease(&client_key, None)
        .await
        .map_err(BrokerError::Allocation)?;

    Ok(Json(state.grant(&record).into()))
}

async fn log_request(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let response = next.run(request).await;
    info!("{} {} {}", method, uri, response.status());
    response
}
