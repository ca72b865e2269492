// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use pin_project_lite::pin_project;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

use super::{decode_message, Decoded, Message, MessageKey, ProtocolError};

const READ_CHUNK: usize = 16 * 1024;

/// Whether [ProtocolStream::send_message] waits for the matching `_ACK`
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum AckPolicy {
  Await,
  Skip,
}

pin_project! {
  /// A socket that can carry control messages ahead of raw traffic
  ///
  /// Bytes read from the inner stream are held in a buffer until they are either
  /// decoded as a control message or handed out untouched through [AsyncRead],
  /// so traffic following a message is never lost.
  pub struct ProtocolStream<S> {
    #[pin]
    inner: S,
    buffer: Vec<u8>,
  }
}

impl<S> ProtocolStream<S> {
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      buffer: Vec::new(),
    }
  }

  /// Bytes received but not yet consumed as a message or read through [AsyncRead]
  pub fn buffered(&self) -> &[u8] {
    &self.buffer
  }

  pub fn take_buffered(&mut self) -> Vec<u8> {
    std::mem::take(&mut self.buffer)
  }
}

impl<S> ProtocolStream<S>
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  /// Reads one more chunk from the socket into the buffer, returning 0 at end of stream
  pub async fn fill_buffer(&mut self) -> io::Result<usize> {
    self.buffer.reserve(READ_CHUNK);
    self.inner.read_buf(&mut self.buffer).await
  }

  /// Writes a message and, for requests under [AckPolicy::Await], returns the payload of the
  /// matching acknowledgement
  ///
  /// An acknowledgement carrying an `error` field resolves to [ProtocolError::Remote].
  pub async fn send_message(
    &mut self,
    key: MessageKey,
    payload: Option<Value>,
    ack: AckPolicy,
  ) -> Result<Option<Value>, ProtocolError> {
    let message = Message::new(key, payload);
    tracing::trace!(key = %key, "Sending message");
    self.inner.write_all(&message.encode()).await?;
    self.inner.flush().await?;
    let expected = match (ack, key.ack()) {
      (AckPolicy::Await, Some(expected)) => expected,
      _ => return Ok(None),
    };
    let response = self.expect_message(expected).await?;
    if let Some(error) = response.error() {
      return Err(ProtocolError::Remote(error.to_owned()));
    }
    Ok(response.payload)
  }

  /// Waits for the next control message
  ///
  /// Resolves to `None` when the peer closes without sending anything. Traffic that is not a
  /// control message is left in the buffer and reported as [ProtocolError::Mismatch].
  pub async fn next_message(&mut self) -> Result<Option<Message>, ProtocolError> {
    loop {
      match decode_message(&self.buffer)? {
        Decoded::Message { message, consumed } => {
          self.buffer.drain(..consumed);
          tracing::trace!(key = %message.key, "Received message");
          return Ok(Some(message));
        }
        Decoded::Passthrough => return Err(ProtocolError::Mismatch),
        Decoded::Incomplete => {
          if self.fill_buffer().await? == 0 {
            return match self.buffer.is_empty() {
              true => Ok(None),
              false => Err(ProtocolError::ClosedPrematurely),
            };
          }
        }
      }
    }
  }

  pub async fn expect_message(&mut self, key: MessageKey) -> Result<Message, ProtocolError> {
    match self.next_message().await? {
      None => Err(ProtocolError::ClosedPrematurely),
      Some(message) if message.key == key => Ok(message),
      Some(message) => Err(ProtocolError::UnexpectedMessage {
        expected: key,
        received: message.key,
      }),
    }
  }

  /// Answers `request` with its acknowledgement
  pub async fn respond(&mut self, request: MessageKey, payload: Value) -> Result<(), ProtocolError> {
    let ack = request.ack().ok_or_else(|| {
      ProtocolError::Malformed(format!("{} cannot be acknowledged", request))
    })?;
    self
      .send_message(ack, Some(payload), AckPolicy::Skip)
      .await
      .map(|_| ())
  }
}

impl<S: AsyncRead> AsyncRead for ProtocolStream<S> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<io::Result<()>> {
    let this = self.project();
    if !this.buffer.is_empty() {
      let len = this.buffer.len().min(buf.remaining());
      buf.put_slice(&this.buffer[..len]);
      this.buffer.drain(..len);
      return Poll::Ready(Ok(()));
    }
    this.inner.poll_read(cx, buf)
  }
}

impl<S: AsyncWrite> AsyncWrite for ProtocolStream<S> {
  fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
    self.project().inner.poll_write(cx, buf)
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
    self.project().inner.poll_shutdown(cx)
  }
}
