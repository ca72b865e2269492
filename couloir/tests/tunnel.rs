// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;
use std::time::Duration;

use couloir::expose::Expose;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

mod common;
use common::*;

#[tokio::test(flavor = "multi_thread")]
async fn request_and_response_pass_through_unchanged() {
  let relay = TestRelay::start(|_| {}).await;
  let received = Arc::new(Mutex::new(Vec::new()));
  let local = serve_local({
    let received = Arc::clone(&received);
    move |mut stream| {
      let received = Arc::clone(&received);
      async move {
        let (head, body) = read_message(&mut stream, 3).await;
        let mut all = head;
        all.extend_from_slice(&body);
        *received.lock().await = all;
        stream
          .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nbar")
          .await
          .unwrap();
        let _ = stream.shutdown().await;
      }
    }
  })
  .await;

  let expose = Expose::new(relay.expose_options(local));
  let url = expose.start().await.unwrap();
  assert_eq!(url, format!("http://couloir.{}:{}", DOMAIN, relay.port));
  assert_eq!(expose.host().as_deref(), Some("couloir.test.local"));

  let response = relay
    .request(b"GET / HTTP/1.1\r\nHost: couloir.test.local\r\n\r\nfoo")
    .await;
  assert_eq!(response, b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\nbar");
  assert_eq!(
    &received.lock().await[..],
    &b"GET / HTTP/1.1\r\nHost: couloir.test.local\r\nConnection: close\r\n\r\nfoo"[..]
  );
  expose.stop(true).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn binary_bodies_are_relayed_intact() {
  let relay = TestRelay::start(|_| {}).await;
  let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
  let local = serve_local(|mut stream| async move {
    let (head, mut body) = read_message(&mut stream, 0).await;
    let head = String::from_utf8(head).unwrap();
    let length: usize = head
      .lines()
      .find_map(|line| line.strip_prefix("Content-Length: "))
      .unwrap()
      .parse()
      .unwrap();
    let received = body.len();
    body.resize(length, 0);
    stream.read_exact(&mut body[received..]).await.unwrap();
    let response = format!("HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n", body.len());
    stream.write_all(response.as_bytes()).await.unwrap();
    stream.write_all(&body).await.unwrap();
    let _ = stream.shutdown().await;
  })
  .await;
  let expose = Expose::new(relay.expose_options(local));
  expose.start().await.unwrap();

  let mut request = format!(
    "POST /echo HTTP/1.1\r\nHost: couloir.test.local\r\nContent-Length: {}\r\n\r\n",
    payload.len()
  )
  .into_bytes();
  request.extend_from_slice(&payload);
  let response = relay.request(&request).await;
  let body_start = find(&response, b"\r\n\r\n").unwrap() + 4;
  assert!(response.starts_with(b"HTTP/1.1 200 OK\r\n"));
  assert_eq!(&response[body_start..], &payload[..]);
  expose.stop(true).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_requests_share_a_single_socket_budget() {
  let relay = TestRelay::start(|options| options.drain_grace = Duration::from_millis(1)).await;
  let local = hello_server("hello").await;
  let mut options = relay.expose_options(local);
  options.max_concurrency = 1;
  let expose = Expose::new(options);
  expose.start().await.unwrap();

  for index in 0..50 {
    let path = format!("/{}", index);
    let response = relay.request_text(&get("couloir.test.local", &path)).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}: {}", path, response);
    assert!(response.ends_with("hello"));
    assert!(expose.active_count() + expose.pending_count() <= 1);
  }
  assert!(!expose.is_closed());
  expose.stop(true).await;
  assert!(expose.is_closed());
}

#[tokio::test(flavor = "multi_thread")]
async fn parallel_requests_are_served() {
  let relay = Arc::new(TestRelay::start(|_| {}).await);
  let local = serve_local(|mut stream| async move {
    read_message(&mut stream, 0).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    stream
      .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
      .await
      .unwrap();
    let _ = stream.shutdown().await;
  })
  .await;
  let mut options = relay.expose_options(local);
  options.max_concurrency = 2;
  let expose = Expose::new(options);
  expose.start().await.unwrap();

  let requests: Vec<_> = (0..4)
    .map(|index| {
      let relay = Arc::clone(&relay);
      tokio::spawn(async move {
        relay
          .request_text(&get("couloir.test.local", &format!("/{}", index)))
          .await
      })
    })
    .collect();
  for request in requests {
    let response = request.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.ends_with("ok"));
  }
  expose.stop(true).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_upgrades_become_raw_tunnels() {
  let relay = TestRelay::start(|_| {}).await;
  let local = serve_local(|mut stream| async move {
    let (head, _) = read_message(&mut stream, 0).await;
    let head = String::from_utf8(head).unwrap();
    assert!(head.contains("Upgrade: websocket\r\n"));
    assert!(!head.contains("Connection: close"));
    stream
      .write_all(b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
      .await
      .unwrap();
    let mut buf = [0u8; 64];
    loop {
      let read = stream.read(&mut buf).await.unwrap();
      if read == 0 {
        break;
      }
      stream.write_all(&buf[..read]).await.unwrap();
    }
  })
  .await;
  let expose = Expose::new(relay.expose_options(local));
  expose.start().await.unwrap();

  let mut client = TcpStream::connect((LOCALHOST, relay.port)).await.unwrap();
  client
    .write_all(b"GET /ws HTTP/1.1\r\nHost: couloir.test.local\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n")
    .await
    .unwrap();
  let (head, _) = read_message(&mut client, 0).await;
  assert!(head.starts_with(b"HTTP/1.1 101 Switching Protocols\r\n"));

  for frame in [&b"\x81\x05hello"[..], &b"GET / HTTP/1.1\r\n\r\n"[..]] {
    client.write_all(frame).await.unwrap();
    let mut echoed = vec![0u8; frame.len()];
    client.read_exact(&mut echoed).await.unwrap();
    assert_eq!(echoed, frame);
  }
  drop(client);
  expose.stop(true).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_hosts_and_the_bare_domain() {
  let relay = TestRelay::start(|_| {}).await;

  let missing = relay.request_text(&get("nothing.test.local", "/")).await;
  assert!(missing.starts_with("HTTP/1.1 404 Not Found\r\n"), "{}", missing);
  assert!(missing.contains("No couloir open for nothing.test.local"));

  let status = relay.request_text(&get(DOMAIN, "/")).await;
  assert!(status.starts_with("HTTP/1.1 200 OK\r\n"), "{}", status);
  assert!(status.contains("No couloir is open."));

  let local = hello_server("hi").await;
  let mut options = relay.expose_options(local);
  options.name = Some(String::from("demo"));
  let expose = Expose::new(options);
  expose.start().await.unwrap();
  let status = relay
    .request_text(b"GET / HTTP/1.1\r\nHost: test.local\r\nAccept: text/html\r\n\r\n")
    .await;
  assert!(status.contains("Content-Type: text/html"));
  assert!(status.contains("demo.test.local"));

  let no_host = relay.request_text(b"GET / HTTP/1.1\r\n\r\n").await;
  assert!(no_host.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", no_host);
  expose.stop(true).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn stopped_local_server_gets_bad_gateway() {
  let relay = TestRelay::start(|_| {}).await;
  let local = closed_port().await;
  let expose = Expose::new(relay.expose_options(local));
  expose.start().await.unwrap();

  let response = relay
    .request_text(b"GET / HTTP/1.1\r\nHost: couloir.test.local\r\nAccept: */*\r\n\r\n")
    .await;
  assert!(response.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", response);
  assert!(response.contains(&format!(
    "502 - Unable to connect to your local server on 127.0.0.1:{}",
    local
  )));
  assert!(!expose.is_closed());
  expose.stop(true).await;
}
