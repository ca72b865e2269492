// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::time::Duration;

use tokio::net::TcpStream;

pub mod cancellation;
pub mod tunnel_stream;
pub mod validators;

/// Idle time before the kernel starts probing a quiet socket
pub const KEEPALIVE_IDLE: Duration = Duration::from_secs(30);

/// Enables TCP keep-alive so that long-idle pool sockets are not silently dropped by middleboxes
pub fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
  let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_IDLE);
  socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Position of the first occurrence of `needle` in `haystack`
pub fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  if needle.is_empty() || haystack.len() < needle.len() {
    return None;
  }
  haystack
    .windows(needle.len())
    .position(|window| window == needle)
}
