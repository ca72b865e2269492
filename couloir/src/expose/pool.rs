// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! The pool of relay sockets kept open by an exposing host
//!
//! Every pool socket joins the couloir and idles until the relay signals a client with
//! `COULOIR_STREAM`. The pool replaces a socket as soon as it is claimed, so the relay keeps
//! seeing at least one host socket while traffic flows.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{BoxFuture, FutureExt};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing_futures::Instrument;

use super::local;
use super::options::{ExposeOptions, RelayTransport};
use super::ExposeError;
use crate::common::id::{MonotonicAtomicGenerator, SocketId};
use crate::common::protocol::{
  AckPolicy, JoinRequest, MessageKey, OpenRequest, OpenResponse, ProtocolError, ProtocolStream,
};
use crate::common::version::VERSION;
use crate::util::cancellation::StopSignal;
use crate::util::enable_keepalive;
use crate::util::tunnel_stream::{boxed, BoxedStream};

type RelayStream = ProtocolStream<BoxedStream>;

#[derive(Debug, Default)]
struct PoolState {
  couloir: Option<OpenResponse>,
  /// Joined sockets, and whether each one is bound to a client
  active: HashMap<SocketId, bool>,
  /// Sockets being connected or joined
  pending: usize,
  /// Set when a socket was not opened because the pool was full
  throttled: bool,
}

pub(crate) struct Pool {
  pub options: ExposeOptions,
  state: Mutex<PoolState>,
  ids: MonotonicAtomicGenerator,
  pub stop: StopSignal,
  /// Cancelled once the pool is done, after a stop or a fatal error
  done: CancellationToken,
  fatal: Mutex<Option<ExposeError>>,
  settled: Notify,
}

impl Pool {
  pub fn new(options: ExposeOptions) -> Self {
    Self {
      options,
      state: Mutex::new(PoolState::default()),
      ids: MonotonicAtomicGenerator::default(),
      stop: StopSignal::new(),
      done: CancellationToken::new(),
      fatal: Mutex::new(None),
      settled: Notify::new(),
    }
  }

  fn state(&self) -> MutexGuard<'_, PoolState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn couloir(&self) -> Option<OpenResponse> {
    self.state().couloir.clone()
  }

  pub fn active_count(&self) -> usize {
    self.state().active.len()
  }

  pub fn bound_count(&self) -> usize {
    self.state().active.values().filter(|bound| **bound).count()
  }

  pub fn pending_count(&self) -> usize {
    self.state().pending
  }

  pub fn is_throttled(&self) -> bool {
    self.state().throttled
  }

  pub fn is_done(&self) -> bool {
    self.done.is_cancelled()
  }

  /// Reserves the couloir on the relay over a short-lived control connection, then opens the
  /// first pool socket
  #[tracing::instrument(skip(self), fields(relay = %self.options.relay_address()))]
  pub async fn open_couloir(self: &Arc<Self>) -> Result<OpenResponse, ExposeError> {
    let (control, opened) = self.with_retries(|| self.request_couloir()).await?;
    tracing::debug!(couloir = %opened.host, "Couloir reserved");
    self.state().couloir = Some(opened.clone());
    let first = self.open_next_relay_socket(opened.key.clone()).await;
    drop(control);
    first?;
    Ok(opened)
  }

  async fn request_couloir(&self) -> Result<(RelayStream, OpenResponse), ExposeError> {
    let mut control = self.connect().await?;
    let request = OpenRequest {
      version: VERSION.to_owned(),
      couloir_label: self.options.requested_host(),
      password: self.options.password.clone(),
      cli_token: self.options.cli_token.clone(),
    };
    tracing::trace!(request = ?request, "Sending open request");
    let payload = serde_json::to_value(&request).map_err(ProtocolError::from)?;
    let acknowledged = self
      .acknowledged(control.send_message(MessageKey::Open, Some(payload), AckPolicy::Await))
      .await?;
    let opened: OpenResponse =
      serde_json::from_value(acknowledged.unwrap_or_default()).map_err(ProtocolError::from)?;
    Ok((control, opened))
  }

  /// Opens and joins one more relay socket unless the pool is stopped or full
  ///
  /// The slot is reserved before this returns; the future resolves once the socket has
  /// joined the couloir, or with the error that made the pool give up on it.
  pub fn open_next_relay_socket(
    self: &Arc<Self>,
    key: String,
  ) -> BoxFuture<'static, Result<(), ExposeError>> {
    if self.stop.is_stopped() || !self.reserve_slot() {
      return futures::future::ready(Ok(())).boxed();
    }
    let pool = Arc::clone(self);
    async move {
      let id = pool.ids.next();
      let span = tracing::debug_span!("relay_socket", id = %id);
      let joined = pool
        .with_retries(|| pool.join(&key))
        .instrument(span.clone())
        .await;
      match joined {
        Ok(socket) => {
          pool.activate(id, socket, key, span);
          Ok(())
        }
        Err(ExposeError::Stopped) => {
          pool.release_pending();
          Ok(())
        }
        Err(error) => {
          pool.release_pending();
          Err(error)
        }
      }
    }
    .boxed()
  }

  /// Tops the pool up in the background; a failure there is fatal to the whole pool
  fn replenish(self: &Arc<Self>, key: String) {
    let joining = self.open_next_relay_socket(key);
    let pool = Arc::clone(self);
    tokio::spawn(async move {
      if let Err(error) = joining.await {
        pool.fail(error);
      }
    });
  }

  fn reserve_slot(&self) -> bool {
    let mut state = self.state();
    if state.active.len() + state.pending >= self.options.max_concurrency {
      tracing::trace!("Pool full, deferring new relay socket");
      state.throttled = true;
      return false;
    }
    state.throttled = false;
    state.pending += 1;
    true
  }

  fn release_pending(&self) {
    self.state().pending -= 1;
    self.settled.notify_waiters();
  }

  fn activate(
    self: &Arc<Self>,
    id: SocketId,
    socket: RelayStream,
    key: String,
    span: tracing::Span,
  ) {
    {
      let mut state = self.state();
      state.pending -= 1;
      state.active.insert(id, false);
    }
    tracing::debug!(parent: &span, "Relay socket joined");
    tokio::spawn(Arc::clone(self).serve(id, socket, key).instrument(span));
  }

  /// Forgets a socket, returning whether the pool was throttled while it was held
  fn release(&self, id: SocketId) -> bool {
    let throttled = {
      let mut state = self.state();
      state.active.remove(&id);
      std::mem::take(&mut state.throttled)
    };
    self.settled.notify_waiters();
    throttled
  }

  async fn serve(self: Arc<Self>, id: SocketId, mut socket: RelayStream, key: String) {
    let stop = self.stop.listener();
    let signal = tokio::select! {
      signal = socket.expect_message(MessageKey::Stream) => Some(signal),
      _ = stop.closing(false) => None,
    };
    match signal {
      None => {
        self.release(id);
        return;
      }
      Some(Err(error)) => {
        tracing::debug!(error = %error, "Idle relay socket closed");
        self.release(id);
        if !self.stop.is_stopped() {
          self.replenish(key);
        }
        return;
      }
      Some(Ok(_)) => {}
    }

    if let Some(bound) = self.state().active.get_mut(&id) {
      *bound = true;
    }
    self.replenish(key.clone());
    let before_close = Arc::clone(&self).retire(id, key.clone()).boxed();
    local::proxy(&self.options, &mut socket, &stop, before_close).await;

    self.retire(id, key).await;
    if let Err(error) = socket.shutdown().await {
      tracing::trace!(error = %error, "Relay socket already closed");
    }
  }

  /// Forgets a finished socket, joining a replacement first if the pool was full meanwhile
  async fn retire(self: Arc<Self>, id: SocketId, key: String) {
    if self.release(id) && !self.stop.is_stopped() {
      if let Err(error) = self.open_next_relay_socket(key).await {
        self.fail(error);
      }
    }
  }

  async fn join(&self, key: &str) -> Result<RelayStream, ExposeError> {
    let mut socket = self.connect().await?;
    let payload = serde_json::to_value(JoinRequest {
      key: key.to_owned(),
    })
    .map_err(ProtocolError::from)?;
    self
      .acknowledged(socket.send_message(MessageKey::Join, Some(payload), AckPolicy::Await))
      .await?;
    Ok(socket)
  }

  /// Bounds a control round-trip by the join timeout
  async fn acknowledged<T>(
    &self,
    round_trip: impl Future<Output = Result<T, ProtocolError>>,
  ) -> Result<T, ExposeError> {
    let timeout = self.options.join_timeout;
    match tokio::time::timeout(timeout, round_trip).await {
      Ok(result) => Ok(result?),
      Err(_) => Err(ExposeError::Timeout(timeout)),
    }
  }

  async fn connect(&self) -> Result<RelayStream, ExposeError> {
    let options = &self.options;
    let connecting = async {
      match options.relay_ip {
        Some(ip) => TcpStream::connect((ip, options.relay_port)).await,
        None => TcpStream::connect((options.relay_host.as_str(), options.relay_port)).await,
      }
    };
    let tcp = match tokio::time::timeout(options.join_timeout, connecting).await {
      Ok(Ok(tcp)) => tcp,
      Ok(Err(source)) => {
        return Err(ExposeError::RelayUnreachable {
          relay: options.relay_address(),
          source,
        })
      }
      Err(_) => return Err(ExposeError::Timeout(options.join_timeout)),
    };
    if let Err(error) = tcp.set_nodelay(true) {
      tracing::debug!(error = %error, "Failed to disable Nagle's algorithm");
    }
    if let Err(error) = enable_keepalive(&tcp) {
      tracing::debug!(error = %error, "Failed to enable keep-alive");
    }
    let stream = match &options.transport {
      RelayTransport::Plain => boxed(tcp),
      RelayTransport::Tls(config) => {
        let server_name = rustls::ServerName::try_from(options.relay_host.as_str())
          .map_err(|_| ExposeError::InvalidRelayHost(options.relay_host.clone()))?;
        let tls = TlsConnector::from(Arc::clone(config))
          .connect(server_name, tcp)
          .await
          .map_err(|source| ExposeError::RelayUnreachable {
            relay: options.relay_address(),
            source,
          })?;
        boxed(tls)
      }
    };
    Ok(ProtocolStream::new(stream))
  }

  /// Runs `attempt` until it succeeds, fails for good, or exhausts the connection tries
  async fn with_retries<T, F, Fut>(&self, mut attempt: F) -> Result<T, ExposeError>
  where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExposeError>>,
  {
    let mut attempts = 0;
    loop {
      attempts += 1;
      let outcome = tokio::select! {
        outcome = attempt() => outcome,
        _ = self.stop.stopped() => Err(ExposeError::Stopped),
      };
      let error = match outcome {
        Ok(value) => return Ok(value),
        Err(error) if !error.is_retryable() => return Err(error),
        Err(error) => error,
      };
      if attempts >= self.options.max_connection_tries {
        return Err(ExposeError::RetriesExhausted {
          attempts,
          last: Box::new(error),
        });
      }
      tracing::warn!(
        error = %error,
        attempt = attempts,
        "Relay connection failed, retrying in {:?}",
        self.options.retry_delay
      );
      tokio::select! {
        _ = tokio::time::sleep(self.options.retry_delay) => {},
        _ = self.stop.stopped() => return Err(ExposeError::Stopped),
      }
    }
  }

  /// Ends the pool without recording an error, after a failed start
  pub fn abandon(&self) {
    self.stop.stop(true);
    self.done.cancel();
  }

  /// Records the error that ends the pool and tears every socket down
  pub fn fail(&self, error: ExposeError) {
    tracing::error!(error = %error, "Couloir can no longer be maintained");
    {
      let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
      if fatal.is_none() {
        *fatal = Some(error);
      }
    }
    self.stop.stop(true);
    self.done.cancel();
  }

  /// Stops opening sockets, waits for opens in flight, then lets every socket end
  ///
  /// A graceful stop lets bound sockets finish their exchange; a forced stop cuts them.
  pub async fn shutdown(&self, force: bool) {
    self.stop.stop(force);
    loop {
      let settled = self.settled.notified();
      futures::pin_mut!(settled);
      settled.as_mut().enable();
      {
        let state = self.state();
        if state.pending == 0 && state.active.is_empty() {
          break;
        }
      }
      settled.await;
    }
    self.done.cancel();
  }

  pub async fn closed(&self) -> Result<(), ExposeError> {
    self.done.cancelled().await;
    match self.fatal.lock().unwrap_or_else(PoisonError::into_inner).take() {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }
}

#[cfg(test)]
mod tests {
  use std::net::Ipv4Addr;
  use std::time::Duration;

  use tokio::net::TcpListener;

  use super::*;

  async fn silent_relay() -> (TcpListener, ExposeOptions) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let mut options = ExposeOptions::new(3000, "test.local");
    options.relay_ip = Some(Ipv4Addr::LOCALHOST.into());
    options.relay_port = listener.local_addr().unwrap().port();
    options.join_timeout = Duration::from_secs(30);
    (listener, options)
  }

  #[tokio::test]
  async fn replenishing_reserves_the_slot_right_away() {
    let (_listener, mut options) = silent_relay().await;
    options.max_concurrency = 1;
    let pool = Arc::new(Pool::new(options));

    pool.replenish(String::from("key"));
    assert_eq!(pool.pending_count(), 1);
    assert!(!pool.is_throttled());

    pool.replenish(String::from("key"));
    assert_eq!(pool.pending_count(), 1);
    assert!(pool.is_throttled());

    tokio::time::timeout(Duration::from_secs(5), pool.shutdown(true))
      .await
      .unwrap();
    assert_eq!(pool.pending_count(), 0);
  }

  #[tokio::test]
  async fn retiring_a_socket_of_a_full_pool_opens_its_replacement() {
    let (_listener, mut options) = silent_relay().await;
    options.max_concurrency = 1;
    let pool = Arc::new(Pool::new(options));
    let id = pool.ids.next();
    pool.state().active.insert(id, true);
    pool.replenish(String::from("key"));
    assert!(pool.is_throttled());

    let retiring = tokio::spawn(Arc::clone(&pool).retire(id, String::from("key")));
    assert!(eventually_pending(&pool).await);
    assert_eq!(pool.active_count(), 0);

    pool.shutdown(true).await;
    retiring.await.unwrap();
  }

  async fn eventually_pending(pool: &Pool) -> bool {
    for _ in 0..100 {
      if pool.pending_count() == 1 {
        return true;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
  }
}
