// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use couloir::expose::Expose;
use couloir::relay::RelayServices;

mod common;
use common::*;

#[tokio::test(flavor = "multi_thread")]
async fn control_api_tokens_are_required() {
  let api = MemoryControlApi::with_budgets(&[("token", 1_000_000)]);
  let relay = TestRelay::start_with(
    |_| {},
    RelayServices {
      certificates: None,
      control_api: Some(api.clone()),
    },
  )
  .await;
  let local = hello_server("hi").await;

  let anonymous = Expose::new(relay.expose_options(local));
  let error = anonymous.start().await.unwrap_err();
  assert!(error.is_user_error());
  assert_eq!(
    error.to_string(),
    "A CLI token is required to open a couloir on this relay"
  );

  let mut options = relay.expose_options(local);
  options.cli_token = Some(String::from("stolen"));
  let error = Expose::new(options).start().await.unwrap_err();
  assert_eq!(error.to_string(), "Unknown CLI token");

  let mut options = relay.expose_options(local);
  options.cli_token = Some(String::from("token"));
  options.name = Some(String::from("metered"));
  let expose = Expose::new(options);
  expose.start().await.unwrap();

  let response = relay.request_text(&get("metered.test.local", "/")).await;
  assert!(response.ends_with("hi"), "{}", response);
  assert!(
    eventually(|| {
      relay
        .handle
        .couloir("metered.test.local")
        .and_then(|stats| stats.remaining_bytes)
        .map_or(false, |remaining| remaining < 1_000_000)
    })
    .await
  );

  expose.stop(true).await;
  assert!(eventually(|| api.closed.lock().unwrap().contains(&String::from("metered.test.local"))).await);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_quota_cuts_the_exchange() {
  let api = MemoryControlApi::with_budgets(&[("token", 10)]);
  let relay = TestRelay::start_with(
    |options| options.quota_sync_threshold = 1,
    RelayServices {
      certificates: None,
      control_api: Some(api.clone()),
    },
  )
  .await;
  let local = hello_server("this response is never delivered").await;
  let mut options = relay.expose_options(local);
  options.cli_token = Some(String::from("token"));
  let expose = Expose::new(options);
  expose.start().await.unwrap();

  let host = expose.host().unwrap();
  let response = relay.request(&get(&host, "/")).await;
  assert!(response.is_empty(), "{:?}", String::from_utf8_lossy(&response));
  let remaining = relay.handle.couloir(&host).unwrap().remaining_bytes.unwrap();
  assert!(remaining < 0, "{}", remaining);
  expose.stop(true).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn one_exhausted_token_leaves_other_couloirs_serving() {
  let api = MemoryControlApi::with_budgets(&[("poor", 10), ("rich", 1_000_000)]);
  let relay = TestRelay::start_with(
    |options| options.quota_sync_threshold = 1,
    RelayServices {
      certificates: None,
      control_api: Some(api.clone()),
    },
  )
  .await;
  let local = hello_server("still served").await;

  let mut options = relay.expose_options(local);
  options.cli_token = Some(String::from("poor"));
  options.name = Some(String::from("poor"));
  let poor = Expose::new(options);
  poor.start().await.unwrap();

  let mut options = relay.expose_options(local);
  options.cli_token = Some(String::from("rich"));
  options.name = Some(String::from("rich"));
  let rich = Expose::new(options);
  rich.start().await.unwrap();

  let response = relay.request(&get("poor.test.local", "/")).await;
  assert!(response.is_empty(), "{:?}", String::from_utf8_lossy(&response));

  for _ in 0..3 {
    let response = relay.request_text(&get("rich.test.local", "/")).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"), "{}", response);
    assert!(response.ends_with("still served"), "{}", response);
  }
  let rich_remaining = relay
    .handle
    .couloir("rich.test.local")
    .and_then(|stats| stats.remaining_bytes)
    .unwrap();
  assert!(rich_remaining > 0, "{}", rich_remaining);

  poor.stop(true).await;
  rich.stop(true).await;
}
