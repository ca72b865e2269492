// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use crate::common::quota::DEFAULT_SYNC_THRESHOLD;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_TLS_PORT: u16 = 443;
pub const DEFAULT_COULOIR_PREFIX: &str = "couloir";
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_millis(300);
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Parameters used to run a couloir relay
#[derive(Clone, PartialEq, Eq)]
pub struct RelayOptions {
  /// Domain under which couloir host names are allocated
  pub domain: String,
  pub bind_ip: IpAddr,
  pub relay_port: u16,
  /// Serve plain HTTP instead of TLS
  pub http: bool,
  pub certs_directory: PathBuf,
  /// Shared secret hosts must present when opening a couloir
  pub password: Option<String>,
  pub couloir_prefix: String,
  /// How long a couloir without host sockets survives before being closed
  pub drain_grace: Duration,
  /// How long an opened couloir waits for its first host socket
  pub join_timeout: Duration,
  pub quota_sync_threshold: u64,
  /// Include peer addresses in logs
  pub verbose: bool,
}

impl std::fmt::Debug for RelayOptions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RelayOptions")
      .field("domain", &self.domain)
      .field("bind_ip", &self.bind_ip)
      .field("relay_port", &self.relay_port)
      .field("http", &self.http)
      .field("certs_directory", &self.certs_directory)
      .field("password", &self.password.as_ref().map(|_| "<redacted>"))
      .field("couloir_prefix", &self.couloir_prefix)
      .field("drain_grace", &self.drain_grace)
      .field("join_timeout", &self.join_timeout)
      .field("quota_sync_threshold", &self.quota_sync_threshold)
      .field("verbose", &self.verbose)
      .finish()
  }
}

impl RelayOptions {
  pub fn new(domain: impl Into<String>) -> Self {
    Self {
      domain: domain.into().to_ascii_lowercase(),
      bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
      relay_port: DEFAULT_TLS_PORT,
      http: false,
      certs_directory: default_certs_directory(),
      password: None,
      couloir_prefix: String::from(DEFAULT_COULOIR_PREFIX),
      drain_grace: DEFAULT_DRAIN_GRACE,
      join_timeout: DEFAULT_JOIN_TIMEOUT,
      quota_sync_threshold: DEFAULT_SYNC_THRESHOLD,
      verbose: false,
    }
  }

  pub fn default_port(&self) -> u16 {
    match self.http {
      true => DEFAULT_HTTP_PORT,
      false => DEFAULT_TLS_PORT,
    }
  }

  /// The command a user runs to expose a local server through this relay
  pub fn expose_command(&self) -> String {
    let mut command = format!("couloir expose <local-port> --on {}", self.domain);
    if self.http {
      command.push_str(" --http");
    }
    if self.relay_port != self.default_port() {
      command.push_str(&format!(" --relay-port {}", self.relay_port));
    }
    if self.password.is_some() {
      command.push_str(" --password <password>");
    }
    command
  }
}

/// `~/.couloir/certs`, or a relative `.couloir/certs` when no home directory is known
pub fn default_certs_directory() -> PathBuf {
  std::env::var_os("HOME")
    .map(PathBuf::from)
    .unwrap_or_default()
    .join(".couloir")
    .join("certs")
}
