// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;

use crate::common::id::{MonotonicAtomicGenerator, SocketId};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SocketRole {
  /// First bytes not received yet
  Unclassified,
  /// A host's control connection, used to open a couloir
  Control,
  /// A pooled host socket that joined a couloir
  Host,
  /// A public HTTP client
  Client,
}

#[derive(Debug, Clone)]
pub struct RelaySocketInfo {
  pub id: SocketId,
  pub role: SocketRole,
  pub bound: bool,
  pub couloir: Option<String>,
  pub peer: Option<SocketAddr>,
  pub accepted_at: Instant,
}

/// Every socket currently accepted by the relay
#[derive(Debug, Default)]
pub(crate) struct SocketTable {
  sockets: DashMap<SocketId, RelaySocketInfo>,
  ids: MonotonicAtomicGenerator,
}

impl SocketTable {
  pub fn register(self: &Arc<Self>, peer: Option<SocketAddr>) -> SocketGuard {
    let id = self.ids.next();
    self.sockets.insert(
      id,
      RelaySocketInfo {
        id,
        role: SocketRole::Unclassified,
        bound: false,
        couloir: None,
        peer,
        accepted_at: Instant::now(),
      },
    );
    SocketGuard {
      table: Arc::clone(self),
      id,
    }
  }

  pub fn len(&self) -> usize {
    self.sockets.len()
  }

  pub fn snapshot(&self) -> Vec<RelaySocketInfo> {
    let mut sockets: Vec<RelaySocketInfo> =
      self.sockets.iter().map(|entry| entry.value().clone()).collect();
    sockets.sort_by_key(|info| info.id);
    sockets
  }
}

/// Keeps a socket listed in its [SocketTable] for as long as the guard lives
#[derive(Debug)]
pub(crate) struct SocketGuard {
  table: Arc<SocketTable>,
  id: SocketId,
}

impl SocketGuard {
  pub fn id(&self) -> SocketId {
    self.id
  }

  pub fn set_role(&self, role: SocketRole, couloir: Option<&str>) {
    if let Some(mut info) = self.table.sockets.get_mut(&self.id) {
      info.role = role;
      info.couloir = couloir.map(str::to_owned);
    }
  }

  pub fn set_bound(&self, bound: bool) {
    if let Some(mut info) = self.table.sockets.get_mut(&self.id) {
      info.bound = bound;
    }
  }
}

impl Drop for SocketGuard {
  fn drop(&mut self) {
    self.table.sockets.remove(&self.id);
  }
}
