// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use tokio::io::{AsyncRead, AsyncWrite};

/// A duplex byte stream abstracting over plain TCP, TLS, and in-memory connections
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> TunnelStream for T {}

/// Type-erased socket used once the transport (plain or TLS) has been negotiated
pub type BoxedStream = Box<dyn TunnelStream + 'static>;

pub fn boxed<S: TunnelStream + 'static>(stream: S) -> BoxedStream {
  Box::new(stream)
}

#[cfg(test)]
mod tests {
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  use super::boxed;

  #[tokio::test]
  async fn boxed_streams_stay_duplex() {
    let (near, mut far) = tokio::io::duplex(64);
    let mut near = boxed(near);
    near.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    far.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    far.write_all(b"pong").await.unwrap();
    near.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");
  }
}
