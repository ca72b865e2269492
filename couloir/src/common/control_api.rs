// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! Client for the optional control API that authorizes couloirs and meters their traffic

use std::time::Duration;

use futures::future::{BoxFuture, FutureExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

const API_KEY_HEADER: &str = "X-API-KEY";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const PING_RETRIES: u32 = 3;
const PING_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, PartialEq, Eq)]
pub struct ControlApiOptions {
  pub host: String,
  pub port: u16,
  pub api_key: String,
  pub use_tls: bool,
}

impl std::fmt::Debug for ControlApiOptions {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ControlApiOptions")
      .field("host", &self.host)
      .field("port", &self.port)
      .field("api_key", &"<redacted>")
      .field("use_tls", &self.use_tls)
      .finish()
  }
}

impl ControlApiOptions {
  pub fn base_url(&self) -> String {
    let scheme = if self.use_tls { "https" } else { "http" };
    format!("{}://{}:{}", scheme, self.host, self.port)
  }
}

/// Couloir reservation granted by the control API
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OpenedCouloir {
  #[serde(alias = "couloir")]
  pub label: String,
  pub remaining_bytes: i64,
}

#[derive(thiserror::Error, Debug)]
pub enum ControlApiError {
  /// A rejection meant for the end user, such as an invalid token or an exhausted quota
  #[error("{0}")]
  Rejected(String),
  #[error("Control API responded with status {status}")]
  Unavailable { status: u16 },
  #[error("Failed to reach the control API: {0}")]
  Transport(#[from] reqwest::Error),
}

impl ControlApiError {
  pub fn is_user_error(&self) -> bool {
    matches!(self, ControlApiError::Rejected(_))
  }
}

/// Operations the relay needs from the control API
pub trait ControlApi: Send + Sync {
  fn open<'a>(
    &'a self,
    cli_token: &'a str,
    label: Option<&'a str>,
  ) -> BoxFuture<'a, Result<OpenedCouloir, ControlApiError>>;

  /// Reports bytes transferred since the previous sync and returns the remaining quota
  fn sync<'a>(
    &'a self,
    cli_token: &'a str,
    label: &'a str,
    transferred_bytes: u64,
  ) -> BoxFuture<'a, Result<i64, ControlApiError>>;

  fn close<'a>(
    &'a self,
    cli_token: &'a str,
    label: &'a str,
  ) -> BoxFuture<'a, Result<(), ControlApiError>>;
}

#[derive(Serialize)]
struct OpenBody<'a> {
  cli_token: &'a str,
  label: Option<&'a str>,
}

#[derive(Serialize)]
struct SyncBody<'a> {
  cli_token: &'a str,
  label: &'a str,
  transferred_bytes: u64,
}

#[derive(Serialize)]
struct CloseBody<'a> {
  cli_token: &'a str,
  label: &'a str,
}

#[derive(Deserialize)]
struct SyncReply {
  remaining_bytes: i64,
}

#[derive(Deserialize)]
struct Rejection {
  error: String,
}

/// [ControlApi] over HTTP, authenticated with an `X-API-KEY` header
#[derive(Debug, Clone)]
pub struct HttpControlApi {
  client: reqwest::Client,
  base_url: String,
  api_key: String,
}

impl HttpControlApi {
  pub fn new(options: &ControlApiOptions) -> Result<Self, ControlApiError> {
    let client = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()?;
    Ok(Self {
      client,
      base_url: options.base_url(),
      api_key: options.api_key.clone(),
    })
  }

  pub async fn ping(&self) -> Result<(), ControlApiError> {
    let response = self
      .client
      .get(format!("{}/api/v1/ping", self.base_url))
      .header(API_KEY_HEADER, &self.api_key)
      .send()
      .await?;
    match response.status() {
      status if status.is_success() => Ok(()),
      status => Err(ControlApiError::Unavailable {
        status: status.as_u16(),
      }),
    }
  }

  /// Pings the control API until it answers, giving up after a few attempts
  #[tracing::instrument(level = "debug", skip(self), fields(control_api = %self.base_url))]
  pub async fn init(&self) -> Result<(), ControlApiError> {
    let mut attempt = 0;
    loop {
      match self.ping().await {
        Ok(()) => {
          tracing::info!("Control API is reachable");
          return Ok(());
        }
        Err(error) if attempt < PING_RETRIES => {
          attempt += 1;
          tracing::warn!(
            error = %error,
            "Control API ping failed, retrying in {:?} ({}/{})",
            PING_RETRY_DELAY,
            attempt,
            PING_RETRIES
          );
          tokio::time::sleep(PING_RETRY_DELAY).await;
        }
        Err(error) => {
          tracing::error!(error = %error, "Control API ping failed");
          return Err(ControlApiError::Rejected(format!(
            "Control API on {} is not responding correctly. Please check your control API key and try again.",
            self.base_url
          )));
        }
      }
    }
  }

  /// Sends a JSON request, turning error statuses into [ControlApiError]s
  async fn send<B>(&self, path: &str, body: &B) -> Result<reqwest::Response, ControlApiError>
  where
    B: Serialize + ?Sized,
  {
    let response = self
      .client
      .post(format!("{}{}", self.base_url, path))
      .header(API_KEY_HEADER, &self.api_key)
      .json(body)
      .send()
      .await?;
    let status = response.status();
    if status.is_server_error() {
      let body = response.text().await.unwrap_or_default();
      tracing::error!(
        status = status.as_u16(),
        body = %body.chars().take(1000).collect::<String>(),
        path,
        "Control API failure"
      );
      return Err(ControlApiError::Unavailable {
        status: status.as_u16(),
      });
    }
    if status.is_client_error() {
      let rejection: Rejection = response.json().await?;
      return Err(ControlApiError::Rejected(rejection.error));
    }
    Ok(response)
  }

  async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, ControlApiError>
  where
    B: Serialize + ?Sized,
    R: DeserializeOwned,
  {
    Ok(self.send(path, body).await?.json::<R>().await?)
  }
}

impl ControlApi for HttpControlApi {
  fn open<'a>(
    &'a self,
    cli_token: &'a str,
    label: Option<&'a str>,
  ) -> BoxFuture<'a, Result<OpenedCouloir, ControlApiError>> {
    async move {
      self
        .post("/api/v1/couloir/open", &OpenBody { cli_token, label })
        .await
    }
    .boxed()
  }

  fn sync<'a>(
    &'a self,
    cli_token: &'a str,
    label: &'a str,
    transferred_bytes: u64,
  ) -> BoxFuture<'a, Result<i64, ControlApiError>> {
    async move {
      let reply: SyncReply = self
        .post(
          "/api/v1/couloir/sync",
          &SyncBody {
            cli_token,
            label,
            transferred_bytes,
          },
        )
        .await?;
      Ok(reply.remaining_bytes)
    }
    .boxed()
  }

  fn close<'a>(
    &'a self,
    cli_token: &'a str,
    label: &'a str,
  ) -> BoxFuture<'a, Result<(), ControlApiError>> {
    async move {
      self
        .send("/api/v1/couloir/close", &CloseBody { cli_token, label })
        .await?;
      Ok(())
    }
    .boxed()
  }
}
