// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! Couloir bookkeeping and the matcher that pairs waiting clients with idle host sockets
//!
//! The registry is plain data guarded by the relay's lock; it never awaits. Sockets park
//! themselves by handing over one half of a oneshot channel, and the matcher completes
//! a binding by passing the client's delivery channel to the claimed host socket. The
//! host payload type `H` is whatever the relay hands over on binding.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::common::id::SocketId;
use crate::common::quota::QuotaMeter;

/// What a parked client socket is woken with
#[derive(Debug)]
pub enum ClientWake<H> {
  Bound(H),
  /// The couloir closed before a host socket became available
  Closed,
}

pub type Delivery<H> = oneshot::Sender<ClientWake<H>>;

pub struct ParkedClient<H> {
  pub id: SocketId,
  pub delivery: Delivery<H>,
}

impl<H> ParkedClient<H> {
  pub fn new(id: SocketId) -> (Self, oneshot::Receiver<ClientWake<H>>) {
    let (delivery, woken) = oneshot::channel();
    (Self { id, delivery }, woken)
  }
}

pub struct ParkedHost<H> {
  pub id: SocketId,
  pub claim: oneshot::Sender<Delivery<H>>,
}

impl<H> ParkedHost<H> {
  pub fn new(id: SocketId) -> (Self, oneshot::Receiver<Delivery<H>>) {
    let (claim, claimed) = oneshot::channel();
    (Self { id, claim }, claimed)
  }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CouloirState {
  /// Opened and either waiting for its first host socket or holding at least one
  Active,
  /// Lost its last host socket; closes unless one joins within the grace window
  Draining,
  Closed,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum CouloirError {
  #[error("Couloir host {0} is already opened")]
  AlreadyOpened(String),
  #[error("Invalid couloir name {0:?}. Use letters, digits, and dashes")]
  InvalidLabel(String),
  #[error("Invalid couloir key. Please restart your couloir client")]
  InvalidKey,
  #[error("No couloir open for {0}")]
  NotFound(String),
}

/// Issued whenever a couloir may have to close later; stale once the couloir changes state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainTicket {
  pub host: String,
  generation: u64,
}

/// Result of [CouloirRegistry::open]
#[derive(Debug)]
pub struct Reservation {
  pub host: String,
  pub key: String,
  /// Closes the couloir if no host socket joins in time
  pub expiry: DrainTicket,
  /// A draining couloir of the same name that this one replaced
  pub replaced: Option<ClosedCouloir>,
}

/// What is left of a couloir once it is removed from the registry
#[derive(Debug)]
pub struct ClosedCouloir {
  pub host: String,
  pub quota: Option<Arc<QuotaMeter>>,
  pub rejected_clients: usize,
}

pub struct Couloir<H> {
  host: String,
  key: String,
  state: CouloirState,
  opened_at: Instant,
  generation: u64,
  host_sockets: HashSet<SocketId>,
  available_hosts: VecDeque<ParkedHost<H>>,
  pending_clients: VecDeque<ParkedClient<H>>,
  quota: Option<Arc<QuotaMeter>>,
}

impl<H> std::fmt::Debug for Couloir<H> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Couloir")
      .field("host", &self.host)
      .field("state", &self.state)
      .field("host_sockets", &self.host_sockets.len())
      .field("available_hosts", &self.available_hosts.len())
      .field("pending_clients", &self.pending_clients.len())
      .finish()
  }
}

impl<H> Couloir<H> {
  fn new(host: String, key: String, quota: Option<Arc<QuotaMeter>>) -> Self {
    Self {
      host,
      key,
      state: CouloirState::Active,
      opened_at: Instant::now(),
      generation: 0,
      host_sockets: HashSet::new(),
      available_hosts: VecDeque::new(),
      pending_clients: VecDeque::new(),
      quota,
    }
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn key(&self) -> &str {
    &self.key
  }

  pub fn state(&self) -> CouloirState {
    self.state
  }

  pub fn is_active(&self) -> bool {
    self.state == CouloirState::Active
  }

  pub fn opened_at(&self) -> Instant {
    self.opened_at
  }

  pub fn host_socket_count(&self) -> usize {
    self.host_sockets.len()
  }

  pub fn available_host_count(&self) -> usize {
    self.available_hosts.len()
  }

  pub fn pending_client_count(&self) -> usize {
    self.pending_clients.len()
  }

  pub fn quota(&self) -> Option<&Arc<QuotaMeter>> {
    self.quota.as_ref()
  }

  fn ticket(&self) -> DrainTicket {
    DrainTicket {
      host: self.host.clone(),
      generation: self.generation,
    }
  }

  /// Pairs queued clients with idle host sockets, oldest first on both sides
  ///
  /// Clients that went away while queued are dropped; a host socket that went away
  /// is skipped and its client stays at the head of the queue.
  fn bind_next_socket(&mut self) -> usize {
    let mut bound = 0;
    loop {
      while matches!(self.pending_clients.front(), Some(client) if client.delivery.is_closed()) {
        self.pending_clients.pop_front();
      }
      while matches!(self.available_hosts.front(), Some(host) if host.claim.is_closed()) {
        self.available_hosts.pop_front();
      }
      let Some(client) = self.pending_clients.pop_front() else {
        break;
      };
      let Some(host) = self.available_hosts.pop_front() else {
        self.pending_clients.push_front(client);
        break;
      };
      match host.claim.send(client.delivery) {
        Ok(()) => {
          tracing::debug!(couloir = %self.host, client = %client.id, host = %host.id, "Bound sockets");
          bound += 1;
        }
        Err(delivery) => self.pending_clients.push_front(ParkedClient {
          id: client.id,
          delivery,
        }),
      }
    }
    bound
  }
}

/// Every couloir of a relay, indexed by public host name and by join key
pub struct CouloirRegistry<H> {
  domain: String,
  prefix: String,
  couloirs: HashMap<String, Couloir<H>>,
  keys: HashMap<String, String>,
}

fn is_valid_label(label: &str) -> bool {
  !label.is_empty()
    && label.len() <= 63
    && !label.starts_with('-')
    && !label.ends_with('-')
    && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

impl<H> CouloirRegistry<H> {
  pub fn new(domain: impl Into<String>, prefix: impl Into<String>) -> Self {
    Self {
      domain: domain.into().to_ascii_lowercase(),
      prefix: prefix.into(),
      couloirs: HashMap::new(),
      keys: HashMap::new(),
    }
  }

  pub fn domain(&self) -> &str {
    &self.domain
  }

  pub fn get(&self, host: &str) -> Option<&Couloir<H>> {
    self.couloirs.get(host)
  }

  pub fn len(&self) -> usize {
    self.couloirs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.couloirs.is_empty()
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.couloirs.keys().cloned().collect();
    names.sort();
    names
  }

  fn is_taken(&self, host: &str) -> bool {
    self.couloirs.get(host).map_or(false, Couloir::is_active)
  }

  /// `<prefix>.<domain>`, then `<prefix>1.<domain>`, `<prefix>2.<domain>`, ...
  fn allocate(&self) -> String {
    let first = format!("{}.{}", self.prefix, self.domain);
    if !self.is_taken(&first) {
      return first;
    }
    let mut index = 1u64;
    loop {
      let candidate = format!("{}{}.{}", self.prefix, index, self.domain);
      if !self.is_taken(&candidate) {
        return candidate;
      }
      index += 1;
    }
  }

  /// Maps a requested label to a full host name under the relay's domain
  ///
  /// Names under the domain are kept; anything else, including a missing label or the bare
  /// domain, gets a generated name.
  pub fn resolve_host(&self, label: Option<&str>) -> Result<String, CouloirError> {
    let requested = match label.map(str::trim).filter(|label| !label.is_empty()) {
      Some(label) => label.trim_end_matches('.').to_ascii_lowercase(),
      None => return Ok(self.allocate()),
    };
    let suffix = format!(".{}", self.domain);
    let subdomain = match requested.strip_suffix(&suffix) {
      Some(subdomain) => subdomain,
      None => return Ok(self.allocate()),
    };
    if !subdomain.split('.').all(is_valid_label) {
      return Err(CouloirError::InvalidLabel(requested));
    }
    Ok(requested)
  }

  pub fn open(
    &mut self,
    label: Option<&str>,
    quota: Option<Arc<QuotaMeter>>,
  ) -> Result<Reservation, CouloirError> {
    let host = self.resolve_host(label)?;
    if self.is_taken(&host) {
      return Err(CouloirError::AlreadyOpened(host));
    }
    let replaced = self.close(&host);
    let key = uuid::Uuid::new_v4().simple().to_string();
    let couloir = Couloir::new(host.clone(), key.clone(), quota);
    let expiry = couloir.ticket();
    self.keys.insert(key.clone(), host.clone());
    self.couloirs.insert(host.clone(), couloir);
    Ok(Reservation {
      host,
      key,
      expiry,
      replaced,
    })
  }

  /// Registers a host socket presenting `key`, returning the couloir's host name
  pub fn join(&mut self, key: &str, host: ParkedHost<H>) -> Result<String, CouloirError> {
    let name = self.keys.get(key).ok_or(CouloirError::InvalidKey)?;
    let couloir = self
      .couloirs
      .get_mut(name)
      .ok_or(CouloirError::InvalidKey)?;
    if couloir.state == CouloirState::Draining {
      tracing::debug!(couloir = %couloir.host, "Host socket rejoined a draining couloir");
    }
    couloir.state = CouloirState::Active;
    couloir.generation += 1;
    couloir.host_sockets.insert(host.id);
    couloir.available_hosts.push_back(host);
    couloir.bind_next_socket();
    Ok(couloir.host.clone())
  }

  fn open_couloir_mut(&mut self, host: &str) -> Result<&mut Couloir<H>, CouloirError> {
    self
      .couloirs
      .get_mut(host)
      .filter(|couloir| couloir.state != CouloirState::Closed)
      .ok_or_else(|| CouloirError::NotFound(host.to_owned()))
  }

  /// Puts a host socket back at the head of the queue after a hand-off its client never received
  pub fn park_host(&mut self, host: &str, parked: ParkedHost<H>) -> Result<(), CouloirError> {
    let couloir = self.open_couloir_mut(host)?;
    couloir.available_hosts.push_front(parked);
    couloir.bind_next_socket();
    Ok(())
  }

  pub fn add_client_socket(
    &mut self,
    host: &str,
    client: ParkedClient<H>,
  ) -> Result<(), CouloirError> {
    let couloir = self.open_couloir_mut(host)?;
    couloir.pending_clients.push_back(client);
    couloir.bind_next_socket();
    Ok(())
  }

  /// Re-queues a client at the head of the line after its host socket vanished mid-binding
  pub fn requeue_client_socket(
    &mut self,
    host: &str,
    client: ParkedClient<H>,
  ) -> Result<(), CouloirError> {
    let couloir = self.open_couloir_mut(host)?;
    couloir.pending_clients.push_front(client);
    couloir.bind_next_socket();
    Ok(())
  }

  pub fn remove_client_socket(&mut self, host: &str, id: SocketId) {
    if let Some(couloir) = self.couloirs.get_mut(host) {
      couloir.pending_clients.retain(|client| client.id != id);
    }
  }

  /// Forgets a host socket; returns a ticket when it was the couloir's last one
  pub fn remove_host_socket(&mut self, host: &str, id: SocketId) -> Option<DrainTicket> {
    let couloir = self.couloirs.get_mut(host)?;
    couloir.available_hosts.retain(|parked| parked.id != id);
    if !couloir.host_sockets.remove(&id) || !couloir.host_sockets.is_empty() {
      return None;
    }
    couloir.state = CouloirState::Draining;
    couloir.generation += 1;
    Some(couloir.ticket())
  }

  /// Closes the couloir if nothing happened to it since the ticket was issued
  pub fn expire(&mut self, ticket: &DrainTicket) -> Option<ClosedCouloir> {
    let couloir = self.couloirs.get(&ticket.host)?;
    if couloir.generation != ticket.generation || !couloir.host_sockets.is_empty() {
      return None;
    }
    self.close(&ticket.host)
  }

  /// Removes a couloir, waking its queued clients with [ClientWake::Closed]
  pub fn close(&mut self, host: &str) -> Option<ClosedCouloir> {
    let mut couloir = self.couloirs.remove(host)?;
    self.keys.remove(&couloir.key);
    couloir.state = CouloirState::Closed;
    couloir.available_hosts.clear();
    let rejected_clients = couloir
      .pending_clients
      .drain(..)
      .filter_map(|client| client.delivery.send(ClientWake::Closed).ok())
      .count();
    Some(ClosedCouloir {
      host: couloir.host,
      quota: couloir.quota,
      rejected_clients,
    })
  }

  pub fn close_all(&mut self) -> Vec<ClosedCouloir> {
    let hosts: Vec<String> = self.couloirs.keys().cloned().collect();
    hosts.iter().filter_map(|host| self.close(host)).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  type Registry = CouloirRegistry<&'static str>;

  fn registry() -> Registry {
    CouloirRegistry::new("test.local", "couloir")
  }

  fn id(value: u64) -> SocketId {
    SocketId::new(value)
  }

  #[test]
  fn allocates_and_resolves_names() {
    let mut registry = registry();
    assert_eq!(registry.open(None, None).unwrap().host, "couloir.test.local");
    assert_eq!(registry.open(None, None).unwrap().host, "couloir1.test.local");
    assert_eq!(
      registry.open(Some("test.local"), None).unwrap().host,
      "couloir2.test.local"
    );
    assert_eq!(
      registry.open(Some("Demo.test.local"), None).unwrap().host,
      "demo.test.local"
    );
    assert_eq!(
      registry.open(Some("demo.test.local"), None).unwrap_err(),
      CouloirError::AlreadyOpened(String::from("demo.test.local"))
    );
    assert!(matches!(
      registry.open(Some("not_valid.test.local"), None),
      Err(CouloirError::InvalidLabel(_))
    ));
    assert_eq!(registry.len(), 4);
  }

  #[test]
  fn names_outside_the_domain_get_allocated() {
    let mut registry = registry();
    assert_eq!(registry.open(Some("demo"), None).unwrap().host, "couloir.test.local");
    assert_eq!(
      registry.open(Some("demo.other.com"), None).unwrap().host,
      "couloir1.test.local"
    );
    assert_eq!(
      registry.open(Some("demo.test.local.evil.com"), None).unwrap().host,
      "couloir2.test.local"
    );
  }

  #[test]
  fn unknown_keys_cannot_join() {
    let mut registry = registry();
    let (host, _claimed) = ParkedHost::new(id(1));
    assert_eq!(registry.join("nope", host).unwrap_err(), CouloirError::InvalidKey);
  }

  #[test]
  fn binds_clients_in_arrival_order() {
    let mut registry = registry();
    let reservation = registry.open(Some("demo.test.local"), None).unwrap();
    let (first, mut first_woken) = ParkedClient::new(id(10));
    let (second, mut second_woken) = ParkedClient::new(id(11));
    registry.add_client_socket("demo.test.local", first).unwrap();
    registry.add_client_socket("demo.test.local", second).unwrap();
    assert_eq!(registry.get("demo.test.local").unwrap().pending_client_count(), 2);

    let (host, mut claimed) = ParkedHost::new(id(1));
    registry.join(&reservation.key, host).unwrap();
    let delivery = claimed.try_recv().unwrap();
    assert!(delivery.send(ClientWake::Bound("host-1")).is_ok());
    assert!(matches!(first_woken.try_recv(), Ok(ClientWake::Bound("host-1"))));
    assert!(second_woken.try_recv().is_err());

    let (host, mut claimed) = ParkedHost::new(id(2));
    registry.join(&reservation.key, host).unwrap();
    assert!(claimed.try_recv().unwrap().send(ClientWake::Bound("host-2")).is_ok());
    assert!(matches!(second_woken.try_recv(), Ok(ClientWake::Bound("host-2"))));
    let couloir = registry.get("demo.test.local").unwrap();
    assert_eq!(couloir.pending_client_count(), 0);
    assert_eq!(couloir.host_socket_count(), 2);
  }

  #[test]
  fn idle_hosts_wait_for_clients() {
    let mut registry = registry();
    let reservation = registry.open(None, None).unwrap();
    let (host, mut claimed) = ParkedHost::new(id(1));
    registry.join(&reservation.key, host).unwrap();
    assert!(claimed.try_recv().is_err());
    let (client, mut woken) = ParkedClient::new(id(5));
    registry.add_client_socket(&reservation.host, client).unwrap();
    claimed
      .try_recv()
      .unwrap()
      .send(ClientWake::Bound("host"))
      .ok()
      .unwrap();
    assert!(matches!(woken.try_recv(), Ok(ClientWake::Bound("host"))));
  }

  #[test]
  fn departed_sockets_are_skipped() {
    let mut registry = registry();
    let reservation = registry.open(None, None).unwrap();
    let (gone, gone_woken) = ParkedClient::new(id(10));
    let (waiting, mut waiting_woken) = ParkedClient::new(id(11));
    registry.add_client_socket(&reservation.host, gone).unwrap();
    registry.add_client_socket(&reservation.host, waiting).unwrap();
    drop(gone_woken);

    let (dead_host, dead_claimed) = ParkedHost::new(id(1));
    drop(dead_claimed);
    registry.join(&reservation.key, dead_host).unwrap();
    assert_eq!(registry.get(&reservation.host).unwrap().pending_client_count(), 1);

    let (host, mut claimed) = ParkedHost::new(id(2));
    registry.join(&reservation.key, host).unwrap();
    claimed
      .try_recv()
      .unwrap()
      .send(ClientWake::Bound("live"))
      .ok()
      .unwrap();
    assert!(matches!(waiting_woken.try_recv(), Ok(ClientWake::Bound("live"))));
  }

  #[test]
  fn draining_couloirs_recover_when_a_host_rejoins() {
    let mut registry = registry();
    let reservation = registry.open(Some("demo.test.local"), None).unwrap();
    let (host, _first) = ParkedHost::new(id(1));
    registry.join(&reservation.key, host).unwrap();
    assert_eq!(registry.expire(&reservation.expiry).map(|c| c.host), None);

    let ticket = registry.remove_host_socket("demo.test.local", id(1)).unwrap();
    assert_eq!(
      registry.get("demo.test.local").unwrap().state(),
      CouloirState::Draining
    );
    let (host, _second) = ParkedHost::new(id(2));
    registry.join(&reservation.key, host).unwrap();
    assert!(registry.expire(&ticket).is_none());
    assert!(registry.get("demo.test.local").unwrap().is_active());
  }

  #[test]
  fn drained_couloirs_close_and_reject_waiting_clients() {
    let mut registry = registry();
    let reservation = registry.open(Some("demo.test.local"), None).unwrap();
    let (host, _claimed) = ParkedHost::new(id(1));
    registry.join(&reservation.key, host).unwrap();
    assert!(registry.remove_host_socket("demo.test.local", id(2)).is_none());
    let ticket = registry.remove_host_socket("demo.test.local", id(1)).unwrap();

    let (client, mut woken) = ParkedClient::new(id(9));
    registry.add_client_socket("demo.test.local", client).unwrap();
    let closed = registry.expire(&ticket).unwrap();
    assert_eq!(closed.rejected_clients, 1);
    assert!(matches!(woken.try_recv(), Ok(ClientWake::Closed)));
    assert!(registry.get("demo.test.local").is_none());
    assert_eq!(
      registry.join(&reservation.key, ParkedHost::new(id(3)).0),
      Err(CouloirError::InvalidKey)
    );
  }

  #[test]
  fn unjoined_couloirs_expire() {
    let mut registry = registry();
    let reservation = registry.open(None, None).unwrap();
    assert!(registry.expire(&reservation.expiry).is_some());
    assert!(registry.is_empty());
  }

  #[test]
  fn reopening_replaces_a_draining_couloir() {
    let mut registry = registry();
    let first = registry.open(Some("demo.test.local"), None).unwrap();
    let (host, _claimed) = ParkedHost::new(id(1));
    registry.join(&first.key, host).unwrap();
    registry.remove_host_socket("demo.test.local", id(1)).unwrap();

    let second = registry.open(Some("demo.test.local"), None).unwrap();
    assert_eq!(second.host, "demo.test.local");
    assert_eq!(second.replaced.map(|closed| closed.host).as_deref(), Some("demo.test.local"));
    assert_ne!(first.key, second.key);
    assert_eq!(
      registry.join(&first.key, ParkedHost::new(id(2)).0),
      Err(CouloirError::InvalidKey)
    );
  }
}
