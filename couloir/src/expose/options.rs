// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_LOCAL_HOST: &str = "localhost";
pub const DEFAULT_MAX_CONCURRENCY: usize = 100;
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONNECTION_TRIES: u32 = 10;
pub const DEFAULT_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How pool sockets reach the relay
#[derive(Clone)]
pub enum RelayTransport {
  Plain,
  Tls(Arc<rustls::ClientConfig>),
}

impl RelayTransport {
  pub fn is_tls(&self) -> bool {
    matches!(self, RelayTransport::Tls(_))
  }
}

impl std::fmt::Debug for RelayTransport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      RelayTransport::Plain => f.write_str("Plain"),
      RelayTransport::Tls(_) => f.write_str("Tls"),
    }
  }
}

/// Parameters of an exposed local server
#[derive(Clone)]
pub struct ExposeOptions {
  pub local_host: String,
  pub local_port: u16,
  /// Relay host name, also used for TLS server name verification
  pub relay_host: String,
  /// Connect to this address instead of resolving `relay_host`
  pub relay_ip: Option<IpAddr>,
  pub relay_port: u16,
  pub transport: RelayTransport,
  /// Requested couloir name; the relay allocates one when absent
  pub name: Option<String>,
  pub password: Option<String>,
  pub cli_token: Option<String>,
  /// Rewrites the `Host` header of proxied requests
  pub override_host: Option<String>,
  /// Ceiling on relay sockets open at once, idle and bound together
  pub max_concurrency: usize,
  pub retry_delay: Duration,
  pub max_connection_tries: u32,
  /// How long the relay gets to acknowledge a control message
  pub join_timeout: Duration,
}

impl std::fmt::Debug for ExposeOptions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ExposeOptions")
      .field("local_host", &self.local_host)
      .field("local_port", &self.local_port)
      .field("relay_host", &self.relay_host)
      .field("relay_ip", &self.relay_ip)
      .field("relay_port", &self.relay_port)
      .field("transport", &self.transport)
      .field("name", &self.name)
      .field("password", &self.password.as_ref().map(|_| "<redacted>"))
      .field("cli_token", &self.cli_token.as_ref().map(|_| "<redacted>"))
      .field("override_host", &self.override_host)
      .field("max_concurrency", &self.max_concurrency)
      .field("retry_delay", &self.retry_delay)
      .field("max_connection_tries", &self.max_connection_tries)
      .field("join_timeout", &self.join_timeout)
      .finish()
  }
}

impl ExposeOptions {
  /// Plain-HTTP defaults; see [ExposeOptions::with_tls]
  pub fn new(local_port: u16, relay_host: impl Into<String>) -> Self {
    Self {
      local_host: String::from(DEFAULT_LOCAL_HOST),
      local_port,
      relay_host: relay_host.into(),
      relay_ip: None,
      relay_port: 80,
      transport: RelayTransport::Plain,
      name: None,
      password: None,
      cli_token: None,
      override_host: None,
      max_concurrency: DEFAULT_MAX_CONCURRENCY,
      retry_delay: DEFAULT_RETRY_DELAY,
      max_connection_tries: DEFAULT_MAX_CONNECTION_TRIES,
      join_timeout: DEFAULT_JOIN_TIMEOUT,
    }
  }

  /// Switches to TLS, moving the relay port to 443 if it was still the plain default
  pub fn with_tls(mut self, config: Arc<rustls::ClientConfig>) -> Self {
    if self.relay_port == 80 {
      self.relay_port = 443;
    }
    self.transport = RelayTransport::Tls(config);
    self
  }

  /// Full host name asked of the relay, `<name>.<relay host>`
  pub fn requested_host(&self) -> Option<String> {
    let name = self.name.as_deref()?;
    let suffix = format!(".{}", self.relay_host);
    match name.ends_with(&suffix) {
      true => Some(name.to_owned()),
      false => Some(format!("{}{}", name, suffix)),
    }
  }

  pub fn local_address(&self) -> String {
    format!("{}:{}", self.local_host, self.local_port)
  }

  pub fn relay_address(&self) -> String {
    match self.relay_ip {
      Some(ip) => format!("{} ({}:{})", self.relay_host, ip, self.relay_port),
      None => format!("{}:{}", self.relay_host, self.relay_port),
    }
  }

  /// Public URL of a couloir opened with these options
  pub fn public_url(&self, host: &str) -> String {
    let (scheme, default_port) = match self.transport.is_tls() {
      true => ("https", 443),
      false => ("http", 80),
    };
    match self.relay_port == default_port {
      true => format!("{}://{}", scheme, host),
      false => format!("{}://{}:{}", scheme, host, self.relay_port),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn public_url_omits_default_ports() {
    let mut options = ExposeOptions::new(3000, "test.local");
    assert_eq!(options.public_url("demo.test.local"), "http://demo.test.local");
    options.relay_port = 8080;
    assert_eq!(options.public_url("demo.test.local"), "http://demo.test.local:8080");
  }

  #[test]
  fn requested_host_lives_under_the_relay() {
    let mut options = ExposeOptions::new(3000, "test.local");
    assert_eq!(options.requested_host(), None);
    options.name = Some(String::from("demo"));
    assert_eq!(options.requested_host().as_deref(), Some("demo.test.local"));
    options.name = Some(String::from("demo.test.local"));
    assert_eq!(options.requested_host().as_deref(), Some("demo.test.local"));
  }

  #[test]
  fn debug_output_hides_secrets() {
    let mut options = ExposeOptions::new(3000, "test.local");
    options.password = Some(String::from("hunter2"));
    options.cli_token = Some(String::from("tok-123"));
    let rendered = format!("{:?}", options);
    assert!(!rendered.contains("hunter2"));
    assert!(!rendered.contains("tok-123"));
  }
}
