// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use super::control_api::ControlApi;

/// Bytes accumulated before usage is reported to the control API
pub const DEFAULT_SYNC_THRESHOLD: u64 = 100_000;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaError {
  #[error("Quota exceeded for couloir {label}")]
  Exceeded { label: String },
}

/// Per-couloir traffic meter backed by the control API
///
/// Every chunk relayed in either direction is recorded. Usage is reported once enough bytes
/// accumulate and again when a stream ends; a negative remaining balance marks the meter as
/// exceeded, which aborts the next chunk of any stream of the couloir.
pub struct QuotaMeter {
  control_api: Arc<dyn ControlApi>,
  cli_token: String,
  label: String,
  threshold: u64,
  unsynced: AtomicU64,
  remaining: AtomicI64,
  exceeded: AtomicBool,
  sync_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for QuotaMeter {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QuotaMeter")
      .field("label", &self.label)
      .field("threshold", &self.threshold)
      .field("unsynced", &self.unsynced.load(Ordering::Relaxed))
      .field("remaining", &self.remaining())
      .field("exceeded", &self.is_exceeded())
      .finish()
  }
}

impl QuotaMeter {
  pub fn new(
    control_api: Arc<dyn ControlApi>,
    cli_token: impl Into<String>,
    label: impl Into<String>,
    remaining_bytes: i64,
  ) -> Self {
    Self {
      control_api,
      cli_token: cli_token.into(),
      label: label.into(),
      threshold: DEFAULT_SYNC_THRESHOLD,
      unsynced: AtomicU64::new(0),
      remaining: AtomicI64::new(remaining_bytes),
      exceeded: AtomicBool::new(remaining_bytes < 0),
      sync_lock: tokio::sync::Mutex::new(()),
    }
  }

  pub fn with_threshold(mut self, threshold: u64) -> Self {
    self.threshold = threshold.max(1);
    self
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn remaining(&self) -> i64 {
    self.remaining.load(Ordering::Acquire)
  }

  pub fn is_exceeded(&self) -> bool {
    self.exceeded.load(Ordering::Acquire)
  }

  pub fn unsynced(&self) -> u64 {
    self.unsynced.load(Ordering::Acquire)
  }

  pub fn check(&self) -> Result<(), QuotaError> {
    match self.is_exceeded() {
      true => Err(QuotaError::Exceeded {
        label: self.label.clone(),
      }),
      false => Ok(()),
    }
  }

  /// Counts a chunk about to be relayed, syncing once the threshold is crossed
  pub async fn record(&self, bytes: usize) -> Result<(), QuotaError> {
    self.check()?;
    let bytes = bytes as u64;
    let pending = self.unsynced.fetch_add(bytes, Ordering::AcqRel) + bytes;
    if pending >= self.threshold {
      self.sync().await;
    }
    Ok(())
  }

  /// Reports unsynced usage and returns the remaining balance
  ///
  /// Failures to reach the control API are logged and the usage is kept for the next attempt.
  pub async fn sync(&self) -> i64 {
    let _guard = self.sync_lock.lock().await;
    let transferred = self.unsynced.swap(0, Ordering::AcqRel);
    if transferred == 0 {
      return self.remaining();
    }
    match self
      .control_api
      .sync(&self.cli_token, &self.label, transferred)
      .await
    {
      Ok(remaining) => {
        self.remaining.store(remaining, Ordering::Release);
        tracing::debug!(label = %self.label, transferred, remaining, "Synced quota");
        if remaining < 0 && !self.exceeded.swap(true, Ordering::AcqRel) {
          tracing::warn!(label = %self.label, "Quota exceeded, closing streams");
        }
        remaining
      }
      Err(error) => {
        self.unsynced.fetch_add(transferred, Ordering::AcqRel);
        tracing::warn!(label = %self.label, error = %error, "Failed to sync quota");
        self.remaining()
      }
    }
  }

  /// Flushes remaining usage and releases the couloir on the control API
  pub async fn close(&self) {
    self.sync().await;
    if let Err(error) = self.control_api.close(&self.cli_token, &self.label).await {
      tracing::warn!(label = %self.label, error = %error, "Failed to close couloir on the control API");
    }
  }
}
