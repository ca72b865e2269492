// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// A [CancellationToken] that cannot be triggered by its recipient
#[derive(Debug, Clone, Default)]
#[repr(transparent)]
pub struct CancellationListener {
  token: CancellationToken,
}

impl CancellationListener {
  pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
    self.token.cancelled()
  }
}

impl From<CancellationToken> for CancellationListener {
  fn from(token: CancellationToken) -> Self {
    Self { token }
  }
}

/// Two-stage shutdown shared by every socket of a relay or expose pool
///
/// A graceful stop closes sockets that are not carrying traffic; a forced stop
/// also tears down sockets bound to a live exchange.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
  graceful: CancellationToken,
  forced: CancellationToken,
}

impl StopSignal {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn stop(&self, force: bool) {
    self.graceful.cancel();
    if force {
      self.forced.cancel();
    }
  }

  pub fn is_stopped(&self) -> bool {
    self.graceful.is_cancelled()
  }

  pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
    self.graceful.cancelled()
  }

  pub fn listener(&self) -> StopListener {
    StopListener {
      graceful: self.graceful.clone().into(),
      forced: self.forced.clone().into(),
    }
  }
}

/// Receiving end of a [StopSignal], handed to per-socket tasks
#[derive(Debug, Clone, Default)]
pub struct StopListener {
  pub graceful: CancellationListener,
  pub forced: CancellationListener,
}

impl StopListener {
  /// Resolves once a socket in the given binding state has to be torn down
  pub async fn closing(&self, bound: bool) {
    if bound {
      self.forced.cancelled().await
    } else {
      self.graceful.cancelled().await
    }
  }
}
