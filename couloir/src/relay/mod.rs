// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! The public side of couloir: accepts host and client sockets on one port and pairs them

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use crate::common::control_api::ControlApi;
use crate::common::http::{banner, html_response, STATUS_OK};
use crate::common::protocol::{OpenRequest, OpenResponse, ProtocolStream};
use crate::common::quota::QuotaMeter;
use crate::common::tls::{self, CertificateService};
use crate::common::version::{equal_versions, VersionLevel, VERSION};
use crate::util::cancellation::StopSignal;
use crate::util::enable_keepalive;
use crate::util::tunnel_stream::{boxed, BoxedStream};

pub mod classify;
mod connection;
pub mod options;
pub mod registry;
pub mod sockets;

pub use options::RelayOptions;
use options::DEFAULT_HTTP_PORT;
pub use registry::{CouloirError, CouloirState};
pub use sockets::{RelaySocketInfo, SocketRole};

use connection::HostSocket;
use registry::{ClosedCouloir, CouloirRegistry, DrainTicket};
use sockets::{SocketGuard, SocketTable};

pub const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
  #[error("Failed to listen on {address}: {source}")]
  Bind {
    address: SocketAddr,
    source: std::io::Error,
  },
  #[error("A certificate service is required unless the relay runs in HTTP mode")]
  MissingCertificates,
  #[error("Port {0} is reserved for certificate validation and cannot serve TLS")]
  ReservedPort(u16),
}

/// Why a host was refused a couloir
#[derive(thiserror::Error, Debug)]
pub enum OpenError {
  #[error("Relay version {relay} is not compatible with client version {client}. Please install couloir {relay}")]
  IncompatibleVersion { relay: String, client: String },
  #[error("Invalid relay password")]
  InvalidPassword,
  #[error("A CLI token is required to open a couloir on this relay")]
  MissingToken,
  #[error("{0}")]
  Rejected(String),
  #[error("Failed to open couloir on the control server")]
  ControlApi,
  #[error(transparent)]
  Couloir(#[from] CouloirError),
}

/// Pluggable collaborators of a relay
#[derive(Clone, Default)]
pub struct RelayServices {
  /// Server certificates; required unless the relay runs in HTTP mode
  pub certificates: Option<Arc<dyn CertificateService>>,
  /// Enables token checks and traffic quotas
  pub control_api: Option<Arc<dyn ControlApi>>,
}

/// Snapshot of one couloir, as reported by [RelayHandle::couloir]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CouloirStats {
  pub host: String,
  pub state: CouloirState,
  pub host_sockets: usize,
  pub available_hosts: usize,
  pub pending_clients: usize,
  pub remaining_bytes: Option<i64>,
}

pub(crate) struct RelayState {
  pub options: RelayOptions,
  registry: Mutex<CouloirRegistry<HostSocket>>,
  pub sockets: Arc<SocketTable>,
  certificates: Option<Arc<dyn CertificateService>>,
  control_api: Option<Arc<dyn ControlApi>>,
  pub stop: StopSignal,
}

impl RelayState {
  fn new(options: RelayOptions, services: RelayServices) -> Self {
    let registry = CouloirRegistry::new(&options.domain, &options.couloir_prefix);
    Self {
      options,
      registry: Mutex::new(registry),
      sockets: Arc::new(SocketTable::default()),
      certificates: services.certificates,
      control_api: services.control_api,
      stop: StopSignal::new(),
    }
  }

  /// The registry never awaits while locked, so a poisoned lock still holds consistent data
  pub fn registry(&self) -> MutexGuard<'_, CouloirRegistry<HostSocket>> {
    self.registry.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub async fn open_couloir(
    self: &Arc<Self>,
    request: OpenRequest,
  ) -> Result<OpenResponse, OpenError> {
    if !equal_versions(&request.version, VERSION, VersionLevel::Minor) {
      return Err(OpenError::IncompatibleVersion {
        relay: VERSION.to_owned(),
        client: request.version,
      });
    }
    if let Some(expected) = &self.options.password {
      if request.password.as_deref() != Some(expected.as_str()) {
        return Err(OpenError::InvalidPassword);
      }
    }
    let (label, quota) = match &self.control_api {
      None => (request.couloir_label, None),
      Some(control_api) => {
        let token = request.cli_token.ok_or(OpenError::MissingToken)?;
        let opened = control_api
          .open(&token, request.couloir_label.as_deref())
          .await
          .map_err(|error| match error.is_user_error() {
            true => OpenError::Rejected(error.to_string()),
            false => {
              tracing::error!(error = %error, "Control API failed to open couloir");
              OpenError::ControlApi
            }
          })?;
        let meter = QuotaMeter::new(
          Arc::clone(control_api),
          token,
          opened.label.clone(),
          opened.remaining_bytes,
        )
        .with_threshold(self.options.quota_sync_threshold);
        (Some(opened.label), Some(Arc::new(meter)))
      }
    };
    let opened = self.registry().open(label.as_deref(), quota.clone());
    let reservation = match opened {
      Ok(reservation) => reservation,
      Err(error) => {
        if let Some(quota) = quota {
          tokio::spawn(async move { quota.close().await });
        }
        return Err(error.into());
      }
    };
    if let Some(replaced) = reservation.replaced {
      self.finalize(replaced);
    }
    self.schedule_expiry(reservation.expiry, self.options.join_timeout);
    if let Some(certificates) = &self.certificates {
      certificates.prewarm(&reservation.host);
    }
    tracing::info!(couloir = %reservation.host, "Couloir opened");
    Ok(OpenResponse {
      key: reservation.key,
      host: reservation.host,
    })
  }

  /// Closes the ticket's couloir after `delay` unless it changed in the meantime
  pub fn schedule_expiry(self: &Arc<Self>, ticket: DrainTicket, delay: Duration) {
    let state: Weak<Self> = Arc::downgrade(self);
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      let state = match state.upgrade() {
        Some(state) => state,
        None => return,
      };
      let closed = state.registry().expire(&ticket);
      if let Some(closed) = closed {
        state.finalize(closed);
      }
    });
  }

  pub fn remove_host_socket(self: &Arc<Self>, host: &str, id: crate::common::id::SocketId) {
    let ticket = self.registry().remove_host_socket(host, id);
    if let Some(ticket) = ticket {
      tracing::debug!(couloir = %host, "Last host socket left, draining");
      self.schedule_expiry(ticket, self.options.drain_grace);
    }
  }

  pub fn finalize(&self, closed: ClosedCouloir) {
    tracing::info!(
      couloir = %closed.host,
      rejected_clients = closed.rejected_clients,
      "Couloir closed"
    );
    if let Some(quota) = closed.quota {
      tokio::spawn(async move { quota.close().await });
    }
  }

  pub fn quota_for(&self, host: &str) -> Option<Arc<QuotaMeter>> {
    self.registry().get(host)?.quota().cloned()
  }

  pub fn status_page(&self, accept: Option<&str>) -> Vec<u8> {
    let couloirs = self.registry().names();
    let mut body = format!("Couloir relay for {}\n\n", self.options.domain);
    if couloirs.is_empty() {
      body.push_str("No couloir is open.\n");
    } else {
      body.push_str("Open couloirs:\n");
      for couloir in couloirs {
        body.push_str(&format!("  - {}\n", couloir));
      }
    }
    body.push_str(&format!(
      "\nTo open a couloir, run:\n  {}",
      self.options.expose_command()
    ));
    html_response(accept, &banner(&body), STATUS_OK)
  }

  async fn accept(self: Arc<Self>, tcp: TcpStream, acceptor: Option<TlsAcceptor>) {
    let peer = tcp.peer_addr().ok();
    if let Err(error) = tcp.set_nodelay(true) {
      tracing::debug!(error = %error, "Failed to disable Nagle's algorithm");
    }
    if let Err(error) = enable_keepalive(&tcp) {
      tracing::debug!(error = %error, "Failed to enable keep-alive");
    }
    let guard = self.sockets.register(peer);
    let span = tracing::debug_span!("relay_socket", id = %guard.id(), peer = tracing::field::Empty);
    if self.options.verbose {
      if let Some(peer) = peer {
        span.record("peer", &tracing::field::display(peer));
      }
    }
    async move {
      let stream = match acceptor {
        None => boxed(tcp),
        Some(acceptor) => match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(tcp)).await {
          Ok(Ok(tls)) => boxed(tls),
          Ok(Err(error)) => {
            tracing::debug!(error = %error, "TLS handshake failed");
            return;
          }
          Err(_) => {
            tracing::debug!("TLS handshake timed out");
            return;
          }
        },
      };
      self.serve(stream, guard).await
    }
    .instrument(span)
    .await
  }

  async fn serve(self: Arc<Self>, stream: BoxedStream, guard: SocketGuard) {
    connection::handle(self, ProtocolStream::new(stream), guard).await
  }
}

/// A bound relay, ready to [run](Relay::run)
pub struct Relay {
  state: Arc<RelayState>,
  listener: TcpListener,
  acceptor: Option<TlsAcceptor>,
}

impl std::fmt::Debug for Relay {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Relay")
      .field("options", &self.state.options)
      .field("local_addr", &self.listener.local_addr().ok())
      .field("tls", &self.acceptor.is_some())
      .finish_non_exhaustive()
  }
}

impl Relay {
  pub async fn bind(options: RelayOptions, services: RelayServices) -> Result<Self, RelayError> {
    if !options.http && options.relay_port == DEFAULT_HTTP_PORT {
      return Err(RelayError::ReservedPort(options.relay_port));
    }
    let acceptor = match (options.http, &services.certificates) {
      (true, _) => None,
      (false, Some(certificates)) => Some(TlsAcceptor::from(tls::server_config(Arc::clone(
        certificates,
      )))),
      (false, None) => return Err(RelayError::MissingCertificates),
    };
    let address = SocketAddr::new(options.bind_ip, options.relay_port);
    let listener = TcpListener::bind(address)
      .await
      .map_err(|source| RelayError::Bind { address, source })?;
    Ok(Self {
      state: Arc::new(RelayState::new(options, services)),
      listener,
      acceptor,
    })
  }

  pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
    self.listener.local_addr()
  }

  pub fn handle(&self) -> RelayHandle {
    RelayHandle {
      state: Arc::clone(&self.state),
    }
  }

  /// Accepts sockets until `shutdown` fires or the relay is stopped through a [RelayHandle]
  ///
  /// Cancelling `shutdown` is a forced stop. Every couloir still open is closed on return.
  pub async fn run(self, shutdown: CancellationToken) {
    let Relay {
      state,
      listener,
      acceptor,
    } = self;
    let local_addr = listener.local_addr().ok();
    let stopping = {
      let state = Arc::clone(&state);
      async move {
        tokio::select! {
          _ = shutdown.cancelled() => state.stop.stop(true),
          _ = state.stop.stopped() => {},
        }
      }
    };
    tracing::info!(
      address = ?local_addr,
      domain = %state.options.domain,
      tls = acceptor.is_some(),
      "Relay listening"
    );
    if let Some(certificates) = &state.certificates {
      certificates.start();
    }
    let mut incoming = TcpListenerStream::new(listener).take_until(Box::pin(stopping));
    while let Some(accepted) = incoming.next().await {
      match accepted {
        Ok(tcp) => {
          tokio::spawn(Arc::clone(&state).accept(tcp, acceptor.clone()));
        }
        Err(error) => tracing::warn!(error = %error, "Failed to accept connection"),
      }
    }
    let closed = state.registry().close_all();
    for couloir in closed {
      state.finalize(couloir);
    }
    if let Some(certificates) = &state.certificates {
      certificates.stop();
    }
    tracing::info!("Relay stopped");
  }
}

/// Cloneable control surface of a running relay
#[derive(Clone)]
pub struct RelayHandle {
  state: Arc<RelayState>,
}

impl RelayHandle {
  /// Stops accepting sockets; a forced stop also cuts exchanges in flight
  pub fn stop(&self, force: bool) {
    self.state.stop.stop(force);
  }

  pub fn is_stopped(&self) -> bool {
    self.state.stop.is_stopped()
  }

  pub fn couloirs(&self) -> Vec<String> {
    self.state.registry().names()
  }

  pub fn couloir(&self, host: &str) -> Option<CouloirStats> {
    let registry = self.state.registry();
    let couloir = registry.get(host)?;
    Some(CouloirStats {
      host: couloir.host().to_owned(),
      state: couloir.state(),
      host_sockets: couloir.host_socket_count(),
      available_hosts: couloir.available_host_count(),
      pending_clients: couloir.pending_client_count(),
      remaining_bytes: couloir.quota().map(|quota| quota.remaining()),
    })
  }

  pub fn socket_count(&self) -> usize {
    self.state.sockets.len()
  }

  pub fn sockets(&self) -> Vec<RelaySocketInfo> {
    self.state.sockets.snapshot()
  }
}
