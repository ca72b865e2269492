// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-unique identifier of a relay or pool socket
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct SocketId(u64);

impl SocketId {
  pub fn new(inner: u64) -> SocketId {
    Self(inner)
  }

  pub fn inner(&self) -> u64 {
    self.0
  }
}

impl From<u64> for SocketId {
  fn from(inner: u64) -> Self {
    Self::new(inner)
  }
}

impl From<SocketId> for u64 {
  fn from(id: SocketId) -> Self {
    id.inner()
  }
}

impl std::fmt::Debug for SocketId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_tuple("SocketId").field(&self.0).finish()
  }
}

impl std::fmt::Display for SocketId {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{}", self.0)
  }
}

#[derive(Debug)]
pub struct MonotonicAtomicGenerator {
  next: AtomicU64,
}

impl Default for MonotonicAtomicGenerator {
  fn default() -> Self {
    Self::new(1)
  }
}

impl MonotonicAtomicGenerator {
  pub fn new(next: u64) -> Self {
    Self {
      next: AtomicU64::new(next),
    }
  }

  pub fn next(&self) -> SocketId {
    SocketId::new(self.next.fetch_add(1, Ordering::Relaxed))
  }
}
