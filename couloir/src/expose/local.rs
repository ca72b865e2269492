// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! Forwarding of one bound relay socket to the local server

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::ready;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use super::options::ExposeOptions;
use crate::common::http::{
  banner, html_response, HttpError, HttpHeadTransform, HttpMessageHead, HEAD_SEPARATOR,
  MAX_HEAD_LENGTH, STATUS_BAD_GATEWAY, STATUS_BAD_REQUEST,
};
use crate::common::pipe::{splice, PipeError, SpliceOptions};
use crate::common::protocol::ProtocolStream;
use crate::util::cancellation::StopListener;
use crate::util::find_bytes;

/// How long a failed exchange waits for the request head before answering without it
const ACCEPT_HEADER_TIMEOUT: Duration = Duration::from_secs(1);

/// Requests forwarded on one connection, waiting for their response to be logged
type AccessLog = Arc<Mutex<VecDeque<(String, Instant)>>>;

/// Request and response transforms for one relayed connection
///
/// Requests get `Connection: close`, unless they upgrade to a websocket, and the optional
/// host override. Responses are matched with their request for the access log.
pub fn exchange_transforms(options: &ExposeOptions) -> (HttpHeadTransform, HttpHeadTransform) {
  let log: AccessLog = Arc::default();
  let override_host = options.override_host.clone();
  let (request, response) = HttpHeadTransform::pair();
  let request = request.with_hook({
    let log = Arc::clone(&log);
    move |head: &mut HttpMessageHead| {
      if let Some(line) = head.request_line() {
        let summary = format!("{} {}", line.method, line.path);
        log
          .lock()
          .unwrap_or_else(PoisonError::into_inner)
          .push_back((summary, Instant::now()));
      }
      if let Some(host) = &override_host {
        head.set_header("Host", host.as_str());
      }
      if !head.is_websocket_upgrade() {
        head.set_header("Connection", "close");
      }
      Ok(())
    }
  });
  let response = response.with_hook(move |head: &mut HttpMessageHead| {
    let request = log.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
    if let Some((request, started)) = request {
      let status = head
        .status()
        .map_or_else(|| String::from("???"), |status| status.to_string());
      tracing::info!(
        "{} -> {} ({} ms)",
        request,
        status,
        started.elapsed().as_millis()
      );
    }
    Ok(())
  });
  (request, response)
}

/// A relay socket whose shutdown first waits for `before_close`
///
/// The relay drains a couloir once its last host socket closes, so a full pool joins the
/// replacement socket before letting the relay see this one end.
struct CloseGate<'a, S> {
  relay: &'a mut ProtocolStream<S>,
  before_close: Option<BoxFuture<'static, ()>>,
}

impl<'a, S> CloseGate<'a, S> {
  fn new(relay: &'a mut ProtocolStream<S>, before_close: BoxFuture<'static, ()>) -> Self {
    Self {
      relay,
      before_close: Some(before_close),
    }
  }

  /// The hook, unless a shutdown already ran it
  fn into_pending(self) -> Option<BoxFuture<'static, ()>> {
    self.before_close
  }
}

impl<S: AsyncRead + Unpin> AsyncRead for CloseGate<'_, S> {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    Pin::new(&mut *self.relay).poll_read(cx, buf)
  }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for CloseGate<'_, S> {
  fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    Pin::new(&mut *self.relay).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    Pin::new(&mut *self.relay).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    if let Some(before_close) = self.before_close.as_mut() {
      ready!(before_close.as_mut().poll(cx));
      self.before_close = None;
    }
    Pin::new(&mut *self.relay).poll_shutdown(cx)
  }
}

/// Connects a bound relay socket to the local server and relays until either side is done
///
/// Failures only concern this socket: an unreachable local server gets a 502 page and a
/// local server that does not speak HTTP gets a 400 page. `before_close` runs before the relay
/// socket is shut down.
pub async fn proxy<S>(
  options: &ExposeOptions,
  relay: &mut ProtocolStream<S>,
  stop: &StopListener,
  before_close: BoxFuture<'static, ()>,
) where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut local = match connect_local(options).await {
    Ok(local) => local,
    Err(error) => {
      tracing::warn!(local = %options.local_address(), error = %error, "Unable to connect to local server");
      let message = format!(
        "502 - Unable to connect to your local server on {}",
        options.local_address()
      );
      answer(relay, &message, STATUS_BAD_GATEWAY, Some(before_close)).await;
      return;
    }
  };
  let (request, response) = exchange_transforms(options);
  let mut gated = CloseGate::new(relay, before_close);
  let outcome = tokio::select! {
    outcome = splice(&mut gated, &mut local, SpliceOptions {
      request: Some(request),
      response: Some(response),
      quota: None,
    }) => outcome,
    _ = stop.closing(true) => Ok(()),
  };
  let before_close = gated.into_pending();
  match outcome {
    Ok(()) => tracing::trace!("Local exchange finished"),
    Err(PipeError::Http(HttpError::InvalidProtocol)) => {
      tracing::warn!(local = %options.local_address(), "Local server did not answer with HTTP");
      let message = format!(
        "400 - Your local server on {} did not answer with HTTP.\nIt likely expects TLS, \
         which couloir does not use towards local servers.",
        options.local_address()
      );
      answer(relay, &message, STATUS_BAD_REQUEST, before_close).await;
    }
    Err(error) => tracing::debug!(error = %error, "Local exchange failed"),
  }
}

async fn connect_local(options: &ExposeOptions) -> io::Result<TcpStream> {
  let local = TcpStream::connect((options.local_host.as_str(), options.local_port)).await?;
  local.set_nodelay(true)?;
  Ok(local)
}

/// Writes an error page to the relay socket, shaped after the client's `Accept` header
async fn answer<S>(
  relay: &mut ProtocolStream<S>,
  message: &str,
  status: &str,
  before_close: Option<BoxFuture<'static, ()>>,
) where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let accept = tokio::time::timeout(ACCEPT_HEADER_TIMEOUT, read_accept_header(relay))
    .await
    .ok()
    .flatten();
  let response = html_response(accept.as_deref(), &banner(message), status);
  let written = async {
    relay.write_all(&response).await?;
    if let Some(before_close) = before_close {
      before_close.await;
    }
    relay.shutdown().await
  };
  if let Err(error) = written.await {
    tracing::debug!(error = %error, "Failed to answer on relay socket");
  }
}

async fn read_accept_header<S>(relay: &mut ProtocolStream<S>) -> Option<String>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  loop {
    if let Some(end) = find_bytes(relay.buffered(), HEAD_SEPARATOR) {
      let head = HttpMessageHead::parse(&relay.buffered()[..end]).ok()?;
      return head.header("accept").map(str::to_owned);
    }
    if relay.buffered().len() > MAX_HEAD_LENGTH {
      return None;
    }
    match relay.fill_buffer().await {
      Ok(read) if read > 0 => {}
      _ => return None,
    }
  }
}

#[cfg(test)]
mod tests {
  use futures::FutureExt;
  use tokio::io::{duplex, AsyncReadExt};

  use super::*;

  fn rewrite(options: &ExposeOptions, request: &[u8]) -> Vec<u8> {
    let (mut transform, _) = exchange_transforms(options);
    transform.transform(request).unwrap().into_owned()
  }

  #[test]
  fn requests_are_closed_after_one_exchange() {
    let options = ExposeOptions::new(3000, "test.local");
    assert_eq!(
      rewrite(&options, b"GET / HTTP/1.1\r\nHost: demo.test.local\r\n\r\n"),
      b"GET / HTTP/1.1\r\nHost: demo.test.local\r\nConnection: close\r\n\r\n"
    );
    assert_eq!(
      rewrite(
        &options,
        b"GET / HTTP/1.1\r\nHost: demo.test.local\r\nConnection: keep-alive\r\n\r\n"
      ),
      b"GET / HTTP/1.1\r\nHost: demo.test.local\r\nConnection: close\r\n\r\n"
    );
  }

  #[test]
  fn host_override_and_websockets() {
    let mut options = ExposeOptions::new(3000, "test.local");
    options.override_host = Some(String::from("localhost:3000"));
    assert_eq!(
      rewrite(
        &options,
        b"GET /ws HTTP/1.1\r\nHost: demo.test.local\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n"
      ),
      b"GET /ws HTTP/1.1\r\nHost: localhost:3000\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n"
    );
  }

  #[tokio::test]
  async fn unreachable_local_server_gets_bad_gateway() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let mut options = ExposeOptions::new(port, "test.local");
    options.local_host = String::from("127.0.0.1");

    let (near, mut far) = duplex(16 * 1024);
    far
      .write_all(b"GET / HTTP/1.1\r\nHost: demo.test.local\r\nAccept: text/plain\r\n\r\n")
      .await
      .unwrap();
    let mut relay = ProtocolStream::new(near);
    proxy(
      &options,
      &mut relay,
      &StopListener::default(),
      futures::future::ready(()).boxed(),
    )
    .await;
    drop(relay);

    let mut response = String::new();
    far.read_to_string(&mut response).await.unwrap();
    assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
    assert!(response.contains(&format!(
      "Unable to connect to your local server on 127.0.0.1:{}",
      port
    )));
  }

  #[tokio::test]
  async fn relay_shutdown_waits_for_the_close_hook() {
    let (near, mut far) = duplex(1024);
    let (replaced, replacement) = tokio::sync::oneshot::channel::<()>();
    let closing = tokio::spawn(async move {
      let mut relay = ProtocolStream::new(near);
      let before_close = async move {
        let _ = replacement.await;
      }
      .boxed();
      let mut gated = CloseGate::new(&mut relay, before_close);
      gated.write_all(b"bye").await.unwrap();
      gated.shutdown().await.unwrap();
    });

    let mut received = [0u8; 3];
    far.read_exact(&mut received).await.unwrap();
    assert_eq!(&received, b"bye");
    let mut rest = [0u8; 1];
    assert!(
      tokio::time::timeout(Duration::from_millis(100), far.read(&mut rest))
        .await
        .is_err()
    );

    replaced.send(()).unwrap();
    assert_eq!(far.read(&mut rest).await.unwrap(), 0);
    closing.await.unwrap();
  }
}
