// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! Per-socket lifecycle on the relay: classification, control messages, parked host sockets,
//! queued clients, and bound exchanges

use std::io;
use std::sync::Arc;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;

use super::classify::{classify, Sniff};
use super::registry::{ClientWake, Delivery, ParkedClient, ParkedHost};
use super::sockets::{SocketGuard, SocketRole};
use super::RelayState;
use crate::common::http::{
  banner, html_response, HttpMessageHead, STATUS_BAD_REQUEST, STATUS_NOT_FOUND,
};
use crate::common::pipe::{splice, PipeError, SpliceOptions};
use crate::common::protocol::{
  AckPolicy, ErrorResponse, JoinRequest, Message, MessageKey, OpenRequest, ProtocolError,
  ProtocolStream, MAX_MESSAGE_LENGTH,
};
use crate::common::quota::QuotaMeter;
use crate::util::tunnel_stream::BoxedStream;

/// Bytes a queued client may send before the relay stops reading from it
pub const MAX_PENDING_CLIENT_BYTES: usize = 1024 * 1024;

type RelayStream = ProtocolStream<BoxedStream>;

/// A host socket handed to a client on binding
pub(crate) struct HostSocket {
  pub stream: RelayStream,
  pub guard: SocketGuard,
}

#[derive(thiserror::Error, Debug)]
enum ExchangeError {
  #[error(transparent)]
  Protocol(#[from] ProtocolError),
  #[error(transparent)]
  Pipe(#[from] PipeError),
}

enum HostEvent {
  Claimed(Option<Delivery<HostSocket>>),
  Read(io::Result<usize>),
  Stopping,
}

enum ClientEvent {
  Woken(Option<ClientWake<HostSocket>>),
  Read(io::Result<usize>),
  Stopping,
}

pub(crate) async fn handle(state: Arc<RelayState>, mut socket: RelayStream, guard: SocketGuard) {
  let stop = state.stop.listener();
  loop {
    match classify(socket.buffered()) {
      Sniff::Incomplete => {
        let read = tokio::select! {
          read = socket.fill_buffer() => read,
          _ = stop.closing(false) => return,
        };
        match read {
          Ok(0) => {
            tracing::trace!("Socket closed before sending anything useful");
            return;
          }
          Ok(_) => {}
          Err(error) => {
            tracing::debug!(error = %error, "Failed to read from socket");
            return;
          }
        }
      }
      Sniff::Control => return serve_control(state, socket, guard).await,
      Sniff::Client(head) => return serve_client(state, socket, guard, head).await,
      Sniff::Invalid(reason) => {
        tracing::debug!(reason = %reason, "Rejecting socket");
        reject(&mut socket, None, &format!("400 - {}", reason), STATUS_BAD_REQUEST).await;
        return;
      }
    }
  }
}

/// Writes a final response and hangs up
async fn reject(socket: &mut RelayStream, accept: Option<&str>, message: &str, status: &str) {
  let response = html_response(accept, &banner(message), status);
  if let Err(error) = write_and_close(socket, &response).await {
    tracing::trace!(error = %error, "Failed to deliver response");
  }
}

async fn write_and_close(socket: &mut RelayStream, bytes: &[u8]) -> io::Result<()> {
  socket.write_all(bytes).await?;
  socket.shutdown().await
}

async fn serve_control(state: Arc<RelayState>, mut socket: RelayStream, guard: SocketGuard) {
  let stop = state.stop.listener();
  loop {
    let message = tokio::select! {
      message = socket.next_message() => message,
      _ = stop.closing(false) => return,
    };
    let message = match message {
      Ok(Some(message)) => message,
      Ok(None) => return,
      Err(error) => {
        tracing::debug!(error = %error, "Control socket failed");
        return;
      }
    };
    match message.key {
      MessageKey::Open => {
        guard.set_role(SocketRole::Control, None);
        let response = match message.decode_payload::<OpenRequest>() {
          Ok(request) => match state.open_couloir(request).await {
            Ok(opened) => json!({ "key": opened.key, "host": opened.host }),
            Err(error) => {
              tracing::info!(error = %error, "Refused to open couloir");
              ErrorResponse::new(error.to_string()).to_value()
            }
          },
          Err(error) => ErrorResponse::new(error.to_string()).to_value(),
        };
        if let Err(error) = socket.respond(MessageKey::Open, response).await {
          tracing::debug!(error = %error, "Failed to answer open request");
          return;
        }
      }
      MessageKey::Join => return join_couloir(state, socket, guard, message).await,
      other => {
        tracing::warn!(key = %other, "Unexpected message on relay socket");
        return;
      }
    }
  }
}

async fn join_couloir(
  state: Arc<RelayState>,
  mut socket: RelayStream,
  guard: SocketGuard,
  message: Message,
) {
  let request = match message.decode_payload::<JoinRequest>() {
    Ok(request) => request,
    Err(error) => {
      let _ = socket
        .respond(MessageKey::Join, ErrorResponse::new(error.to_string()).to_value())
        .await;
      return;
    }
  };
  let (parked, claimed) = ParkedHost::new(guard.id());
  let joined = state.registry().join(&request.key, parked);
  let host = match joined {
    Ok(host) => host,
    Err(error) => {
      tracing::info!(error = %error, "Rejected host socket");
      let _ = socket
        .respond(MessageKey::Join, ErrorResponse::new(error.to_string()).to_value())
        .await;
      return;
    }
  };
  guard.set_role(SocketRole::Host, Some(&host));
  tracing::debug!(couloir = %host, "Host socket joined");
  if let Err(error) = socket.respond(MessageKey::Join, json!({})).await {
    tracing::debug!(error = %error, "Failed to acknowledge join");
    state.remove_host_socket(&host, guard.id());
    return;
  }
  park_host(state, socket, guard, host, claimed).await
}

/// Waits for a client to claim this host socket, watching for the host hanging up meanwhile
async fn park_host(
  state: Arc<RelayState>,
  mut socket: RelayStream,
  mut guard: SocketGuard,
  host: String,
  mut claimed: oneshot::Receiver<Delivery<HostSocket>>,
) {
  let stop = state.stop.listener();
  let id = guard.id();
  loop {
    let event = tokio::select! {
      delivery = &mut claimed => HostEvent::Claimed(delivery.ok()),
      read = socket.fill_buffer() => HostEvent::Read(read),
      _ = stop.closing(false) => HostEvent::Stopping,
    };
    match event {
      HostEvent::Claimed(Some(delivery)) => {
        guard.set_bound(true);
        match delivery.send(ClientWake::Bound(HostSocket {
          stream: socket,
          guard,
        })) {
          Ok(()) => return,
          Err(ClientWake::Bound(returned)) => {
            tracing::debug!(couloir = %host, "Client left before binding, parking again");
            socket = returned.stream;
            guard = returned.guard;
            guard.set_bound(false);
            let (parked, next) = ParkedHost::new(id);
            claimed = next;
            let parked_again = state.registry().park_host(&host, parked);
            if parked_again.is_err() {
              state.remove_host_socket(&host, id);
              return;
            }
          }
          Err(ClientWake::Closed) => return,
        }
      }
      HostEvent::Claimed(None) => {
        tracing::debug!(couloir = %host, "Couloir closed under an idle host socket");
        state.remove_host_socket(&host, id);
        return;
      }
      HostEvent::Read(Ok(0)) => {
        tracing::debug!(couloir = %host, "Idle host socket closed");
        state.remove_host_socket(&host, id);
        return;
      }
      HostEvent::Read(Err(error)) => {
        tracing::debug!(couloir = %host, error = %error, "Idle host socket failed");
        state.remove_host_socket(&host, id);
        return;
      }
      HostEvent::Read(Ok(_)) => {
        if socket.buffered().len() > MAX_MESSAGE_LENGTH {
          tracing::warn!(couloir = %host, "Idle host socket sent unexpected data");
          state.remove_host_socket(&host, id);
          return;
        }
      }
      HostEvent::Stopping => {
        state.remove_host_socket(&host, id);
        return;
      }
    }
  }
}

async fn serve_client(
  state: Arc<RelayState>,
  mut socket: RelayStream,
  guard: SocketGuard,
  head: HttpMessageHead,
) {
  let accept = head.header("accept").map(str::to_owned);
  let host = match head.host() {
    Some(host) => host.to_ascii_lowercase(),
    None => {
      reject(
        &mut socket,
        accept.as_deref(),
        "400 - Missing Host header",
        STATUS_BAD_REQUEST,
      )
      .await;
      return;
    }
  };
  if let Some(line) = head.request_line() {
    tracing::debug!(method = %line.method, path = %line.path, host = %host, "Client request");
  }
  if host == state.options.domain {
    let page = state.status_page(accept.as_deref());
    if let Err(error) = write_and_close(&mut socket, &page).await {
      tracing::trace!(error = %error, "Failed to deliver status page");
    }
    return;
  }

  let id = guard.id();
  let (parked, mut woken) = ParkedClient::new(id);
  let queued = state.registry().add_client_socket(&host, parked);
  if queued.is_err() {
    let message = format!("404 - No couloir open for {}", host);
    reject(&mut socket, accept.as_deref(), &message, STATUS_NOT_FOUND).await;
    return;
  }
  guard.set_role(SocketRole::Client, Some(&host));

  let stop = state.stop.listener();
  loop {
    let can_buffer = socket.buffered().len() < MAX_PENDING_CLIENT_BYTES;
    let event = tokio::select! {
      wake = &mut woken => ClientEvent::Woken(wake.ok()),
      read = socket.fill_buffer(), if can_buffer => ClientEvent::Read(read),
      _ = stop.closing(false) => ClientEvent::Stopping,
    };
    match event {
      ClientEvent::Woken(Some(ClientWake::Bound(host_socket))) => {
        return bind(state, socket, guard, host_socket, host).await
      }
      ClientEvent::Woken(Some(ClientWake::Closed)) => {
        let message = format!("404 - Couloir {} closed", host);
        reject(&mut socket, accept.as_deref(), &message, STATUS_NOT_FOUND).await;
        return;
      }
      ClientEvent::Woken(None) => {
        let (parked, next) = ParkedClient::new(id);
        woken = next;
        let requeued = state.registry().requeue_client_socket(&host, parked);
        if requeued.is_err() {
          let message = format!("404 - No couloir open for {}", host);
          reject(&mut socket, accept.as_deref(), &message, STATUS_NOT_FOUND).await;
          return;
        }
      }
      ClientEvent::Read(Ok(0)) | ClientEvent::Read(Err(_)) => {
        tracing::debug!(couloir = %host, "Client left while queued");
        state.registry().remove_client_socket(&host, id);
        return;
      }
      ClientEvent::Read(Ok(_)) => {}
      ClientEvent::Stopping => {
        state.registry().remove_client_socket(&host, id);
        return;
      }
    }
  }
}

/// Relays one client through the host socket it was matched with
async fn bind(
  state: Arc<RelayState>,
  mut client: RelayStream,
  client_guard: SocketGuard,
  host: HostSocket,
  couloir: String,
) {
  client_guard.set_bound(true);
  let HostSocket {
    stream: mut host_stream,
    guard: host_guard,
  } = host;
  let host_id = host_guard.id();
  tracing::debug!(couloir = %couloir, host_socket = %host_id, "Client bound to host socket");
  let quota = state.quota_for(&couloir);
  let stop = state.stop.listener();
  let outcome = tokio::select! {
    outcome = exchange(&mut client, &mut host_stream, quota.as_deref()) => outcome,
    _ = stop.closing(true) => Ok(()),
  };
  match outcome {
    Ok(()) => tracing::debug!(couloir = %couloir, "Exchange finished"),
    Err(ExchangeError::Pipe(PipeError::Quota(error))) => {
      tracing::warn!(error = %error, "Closing stream")
    }
    Err(error) => tracing::debug!(couloir = %couloir, error = %error, "Exchange failed"),
  }
  if let Some(quota) = &quota {
    quota.sync().await;
  }
  drop(client);
  drop(host_stream);
  drop(client_guard);
  drop(host_guard);
  state.remove_host_socket(&couloir, host_id);
}

async fn exchange(
  client: &mut RelayStream,
  host: &mut RelayStream,
  quota: Option<&QuotaMeter>,
) -> Result<(), ExchangeError> {
  host
    .send_message(MessageKey::Stream, None, AckPolicy::Skip)
    .await?;
  let pending = client.take_buffered();
  if let Some(quota) = quota {
    quota.record(pending.len()).await.map_err(PipeError::from)?;
  }
  host.write_all(&pending).await.map_err(PipeError::from)?;
  host.flush().await.map_err(PipeError::from)?;
  splice(
    client,
    host,
    SpliceOptions {
      quota,
      ..Default::default()
    },
  )
  .await?;
  Ok(())
}
