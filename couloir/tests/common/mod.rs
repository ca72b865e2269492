// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use couloir::common::control_api::{ControlApi, ControlApiError, OpenedCouloir};
use couloir::expose::ExposeOptions;
use couloir::relay::{Relay, RelayHandle, RelayOptions, RelayServices};
use futures::future::{BoxFuture, FutureExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const DOMAIN: &str = "test.local";
pub const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

pub fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

pub struct TestRelay {
  pub handle: RelayHandle,
  pub port: u16,
  pub shutdown: CancellationToken,
  pub task: JoinHandle<()>,
}

impl TestRelay {
  pub async fn start(configure: impl FnOnce(&mut RelayOptions)) -> Self {
    Self::start_with(configure, RelayServices::default()).await
  }

  pub async fn start_with(
    configure: impl FnOnce(&mut RelayOptions),
    services: RelayServices,
  ) -> Self {
    init_tracing();
    let mut options = RelayOptions::new(DOMAIN);
    options.http = true;
    options.bind_ip = LOCALHOST;
    options.relay_port = 0;
    configure(&mut options);
    let relay = Relay::bind(options, services).await.unwrap();
    let port = relay.local_addr().unwrap().port();
    let handle = relay.handle();
    let shutdown = CancellationToken::new();
    let task = tokio::spawn(relay.run(shutdown.clone()));
    Self {
      handle,
      port,
      shutdown,
      task,
    }
  }

  /// Options for an expose pool pointed at this relay and at `local_port`
  pub fn expose_options(&self, local_port: u16) -> ExposeOptions {
    let mut options = ExposeOptions::new(local_port, DOMAIN);
    options.relay_ip = Some(LOCALHOST);
    options.local_host = String::from("127.0.0.1");
    options.relay_port = self.port;
    options.retry_delay = Duration::from_millis(50);
    options.max_connection_tries = 3;
    options.join_timeout = Duration::from_secs(2);
    options
  }

  /// Sends a raw request to the relay and collects everything it answers
  pub async fn request(&self, raw: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect((LOCALHOST, self.port)).await.unwrap();
    client.write_all(raw).await.unwrap();
    let mut response = Vec::new();
    let _ = tokio::time::timeout(Duration::from_secs(10), client.read_to_end(&mut response)).await;
    response
  }

  pub async fn request_text(&self, raw: &[u8]) -> String {
    String::from_utf8_lossy(&self.request(raw).await).into_owned()
  }
}

/// Serves every connection of an ephemeral local listener with `handler`
pub async fn serve_local<F, Fut>(handler: F) -> u16
where
  F: Fn(TcpStream) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(handler(stream));
    }
  });
  port
}

/// A port nothing listens on
pub async fn closed_port() -> u16 {
  let listener = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
  listener.local_addr().unwrap().port()
}

/// Reads a message head and `body_length` bytes after it
pub async fn read_message<S: AsyncRead + Unpin>(stream: &mut S, body_length: usize) -> (Vec<u8>, Vec<u8>) {
  let mut received = Vec::new();
  let mut chunk = [0u8; 4096];
  loop {
    if let Some(end) = find(&received, b"\r\n\r\n") {
      let head_end = end + 4;
      if received.len() >= head_end + body_length {
        let body = received.split_off(head_end);
        return (received, body);
      }
    }
    let read = stream.read(&mut chunk).await.unwrap();
    assert!(read > 0, "Stream ended early: {:?}", String::from_utf8_lossy(&received));
    received.extend_from_slice(&chunk[..read]);
  }
}

pub fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
  haystack
    .windows(needle.len())
    .position(|window| window == needle)
}

/// Local server answering every request with a fixed body
pub async fn hello_server(body: &'static str) -> u16 {
  serve_local(move |mut stream| async move {
    read_message(&mut stream, 0).await;
    let response = format!(
      "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
      body.len(),
      body
    );
    stream.write_all(response.as_bytes()).await.unwrap();
    let _ = stream.shutdown().await;
  })
  .await
}

pub fn get(host: &str, path: &str) -> Vec<u8> {
  format!("GET {} HTTP/1.1\r\nHost: {}\r\n\r\n", path, host).into_bytes()
}

/// Polls `condition` until it holds or a few seconds elapse
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
  for _ in 0..100 {
    if condition() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  condition()
}

/// In-memory control API granting a byte budget per token
#[derive(Default)]
pub struct MemoryControlApi {
  pub budgets: Mutex<HashMap<String, i64>>,
  pub closed: Mutex<Vec<String>>,
}

impl MemoryControlApi {
  pub fn with_budgets(budgets: &[(&str, i64)]) -> Arc<Self> {
    let api = Self::default();
    for (token, budget) in budgets {
      api.budgets.lock().unwrap().insert(token.to_string(), *budget);
    }
    Arc::new(api)
  }
}

impl ControlApi for MemoryControlApi {
  fn open<'a>(
    &'a self,
    cli_token: &'a str,
    label: Option<&'a str>,
  ) -> BoxFuture<'a, Result<OpenedCouloir, ControlApiError>> {
    let result = match self.budgets.lock().unwrap().get(cli_token) {
      Some(budget) => Ok(OpenedCouloir {
        label: label.unwrap_or(cli_token).to_owned(),
        remaining_bytes: *budget,
      }),
      None => Err(ControlApiError::Rejected(String::from("Unknown CLI token"))),
    };
    futures::future::ready(result).boxed()
  }

  fn sync<'a>(
    &'a self,
    cli_token: &'a str,
    _label: &'a str,
    transferred_bytes: u64,
  ) -> BoxFuture<'a, Result<i64, ControlApiError>> {
    let mut budgets = self.budgets.lock().unwrap();
    let result = match budgets.get_mut(cli_token) {
      Some(budget) => {
        *budget -= transferred_bytes as i64;
        Ok(*budget)
      }
      None => Err(ControlApiError::Rejected(String::from("Unknown CLI token"))),
    };
    futures::future::ready(result).boxed()
  }

  fn close<'a>(
    &'a self,
    _cli_token: &'a str,
    label: &'a str,
  ) -> BoxFuture<'a, Result<(), ControlApiError>> {
    self.closed.lock().unwrap().push(label.to_owned());
    futures::future::ready(Ok(())).boxed()
  }
}
