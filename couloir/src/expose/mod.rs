// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! The host side of couloir: exposes a local HTTP server through a relay

use std::sync::Arc;
use std::time::Duration;

use crate::common::protocol::ProtocolError;

mod local;
pub mod options;
mod pool;

pub use options::{ExposeOptions, RelayTransport};

use pool::Pool;

#[derive(thiserror::Error, Debug)]
pub enum ExposeError {
  #[error("Unable to reach the relay on {relay}: {source}")]
  RelayUnreachable {
    relay: String,
    source: std::io::Error,
  },
  #[error("Invalid relay host name {0:?}")]
  InvalidRelayHost(String),
  #[error("The relay did not answer within {0:?}")]
  Timeout(Duration),
  #[error(transparent)]
  Protocol(#[from] ProtocolError),
  #[error("Gave up after {attempts} connection attempts: {last}")]
  RetriesExhausted {
    attempts: u32,
    last: Box<ExposeError>,
  },
  #[error("Couloir was stopped")]
  Stopped,
}

impl ExposeError {
  /// Errors worth another connection attempt after the retry delay
  pub fn is_retryable(&self) -> bool {
    match self {
      ExposeError::RelayUnreachable { .. } | ExposeError::Timeout(_) => true,
      ExposeError::Protocol(ProtocolError::ClosedPrematurely | ProtocolError::Io(_)) => true,
      _ => false,
    }
  }

  /// Errors reported by the relay for the user to act on, such as a wrong password
  pub fn is_user_error(&self) -> bool {
    match self {
      ExposeError::Protocol(ProtocolError::Remote(_)) => true,
      ExposeError::RetriesExhausted { last, .. } => last.is_user_error(),
      _ => false,
    }
  }
}

/// A local server exposed through a relay
///
/// ```no_run
/// # async fn demo() -> Result<(), couloir::expose::ExposeError> {
/// use couloir::expose::{Expose, ExposeOptions};
///
/// let expose = Expose::new(ExposeOptions::new(3000, "relay.example.com"));
/// let url = expose.start().await?;
/// println!("Serving on {}", url);
/// expose.closed().await
/// # }
/// ```
#[derive(Clone)]
pub struct Expose {
  pool: Arc<Pool>,
}

impl std::fmt::Debug for Expose {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Expose")
      .field("options", &self.pool.options)
      .field("host", &self.host())
      .field("active", &self.active_count())
      .field("pending", &self.pending_count())
      .finish()
  }
}

impl Expose {
  pub fn new(options: ExposeOptions) -> Self {
    Self {
      pool: Arc::new(Pool::new(options)),
    }
  }

  pub fn options(&self) -> &ExposeOptions {
    &self.pool.options
  }

  /// Opens the couloir and its first pool socket, returning the public URL
  pub async fn start(&self) -> Result<String, ExposeError> {
    match self.pool.open_couloir().await {
      Ok(opened) => {
        let url = self.pool.options.public_url(&opened.host);
        tracing::info!(url = %url, local = %self.pool.options.local_address(), "Couloir open");
        Ok(url)
      }
      Err(error) => {
        self.pool.abandon();
        Err(error)
      }
    }
  }

  /// Resolves once the couloir is stopped, with the error that ended it if it failed
  pub async fn closed(&self) -> Result<(), ExposeError> {
    self.pool.closed().await
  }

  pub async fn stop(&self, force: bool) {
    self.pool.shutdown(force).await
  }

  /// Public host name, once the couloir is open
  pub fn host(&self) -> Option<String> {
    self.pool.couloir().map(|couloir| couloir.host)
  }

  /// Relay sockets joined to the couloir, idle or bound
  pub fn active_count(&self) -> usize {
    self.pool.active_count()
  }

  pub fn bound_count(&self) -> usize {
    self.pool.bound_count()
  }

  pub fn pending_count(&self) -> usize {
    self.pool.pending_count()
  }

  pub fn is_throttled(&self) -> bool {
    self.pool.is_throttled()
  }

  pub fn is_closed(&self) -> bool {
    self.pool.is_done()
  }
}
