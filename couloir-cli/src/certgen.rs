// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use couloir::common::tls::{CERT_FILE, CERT_KEY_FILE};
use std::path::PathBuf;
use tracing::instrument;

/// Writes a self-signed certificate covering `domain` and its subdomains, in the layout the
/// relay loads certificates from
#[instrument]
pub async fn certgen_main(certs_directory: PathBuf, domain: String) -> Result<()> {
  use std::fs;
  let directory = certs_directory.join(&domain);
  fs::create_dir_all(&directory).context("Directory creation must succeed for certs")?;
  let mut params =
    rcgen::CertificateParams::new(vec![domain.clone(), format!("*.{}", domain)]);
  params
    .distinguished_name
    .push(rcgen::DnType::CommonName, domain.as_str());
  let cert = rcgen::Certificate::from_params(params).context("Certificate generation failed")?;
  let public_pem = cert.serialize_pem()?;
  let private_pem = cert.serialize_private_key_pem();
  fs::write(directory.join(CERT_FILE), &public_pem).context("Failed writing certificate")?;
  fs::write(directory.join(CERT_KEY_FILE), &private_pem).context("Failed writing private key")?;
  println!("Certificate for {} written to {}", domain, directory.display());
  Ok(())
}
