// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use couloir::common::tls;
use couloir::expose::{Expose, ExposeOptions};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ExposeArgs {
  pub options: ExposeOptions,
  /// Reach the relay over TLS
  pub tls: bool,
  pub relay_port: Option<u16>,
  pub authority: Option<PathBuf>,
}

#[tracing::instrument(skip_all, fields(relay = %args.options.relay_host))]
pub async fn expose_main(args: ExposeArgs, shutdown: CancellationToken) -> Result<()> {
  let mut options = args.options;
  if args.tls {
    let config = tls::client_config(args.authority.as_deref())
      .context("Failed to set up TLS towards the relay")?;
    options = options.with_tls(config);
  }
  if let Some(relay_port) = args.relay_port {
    options.relay_port = relay_port;
  }
  let local = options.local_address();
  let expose = Expose::new(options);

  let started = tokio::select! {
    started = expose.start() => started,
    _ = shutdown.cancelled() => {
      expose.stop(true).await;
      return Ok(());
    }
  };
  let url = started.context("Failed to open couloir")?;
  println!("Couloir open on {} -> {}", url, local);

  tokio::select! {
    closed = expose.closed() => closed.context("Couloir closed")?,
    _ = shutdown.cancelled() => {
      tracing::info!("Closing couloir");
      expose.stop(true).await;
    }
  }
  Ok(())
}
