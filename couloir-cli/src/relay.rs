// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use couloir::common::control_api::{ControlApi, ControlApiOptions, HttpControlApi};
use couloir::common::tls::{CertificateService, DirectoryCertificateStore};
use couloir::relay::{Relay, RelayOptions, RelayServices};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct RelayArgs {
  pub options: RelayOptions,
  pub control_api: Option<ControlApiOptions>,
}

#[tracing::instrument(skip_all, fields(domain = %args.options.domain))]
pub async fn relay_main(args: RelayArgs, shutdown: CancellationToken) -> Result<()> {
  let RelayArgs {
    options,
    control_api,
  } = args;

  let certificates: Option<Arc<dyn CertificateService>> = match options.http {
    true => None,
    false => {
      let store = DirectoryCertificateStore::load(&options.certs_directory, &options.domain)
        .with_context(|| {
          format!(
            "Failed loading certificates from {}",
            options.certs_directory.display()
          )
        })?;
      if store.names().is_empty() {
        tracing::warn!(
          "No certificate found, run `couloir cert {}` or provide one in {}",
          options.domain,
          options.certs_directory.display()
        );
      }
      Some(Arc::new(store))
    }
  };

  let control_api: Option<Arc<dyn ControlApi>> = match control_api {
    None => None,
    Some(control_api) => {
      let api = HttpControlApi::new(&control_api).context("Control API client setup failed")?;
      api.init().await.context("Control API unavailable")?;
      Some(Arc::new(api))
    }
  };

  let relay = Relay::bind(
    options,
    RelayServices {
      certificates,
      control_api,
    },
  )
  .await?;
  let address = relay.local_addr().context("Relay has no local address")?;
  println!("Couloir relay listening on {}", address);
  relay.run(shutdown).await;
  Ok(())
}
