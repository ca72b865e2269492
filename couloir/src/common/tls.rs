// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
//! Certificates for the relay's TLS listener and roots for exposing hosts
//!
//! Certificates live in a directory holding one sub-directory per host name, each
//! containing `cert.pem` and `cert.key`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;

pub const CERT_FILE: &str = "cert.pem";
pub const CERT_KEY_FILE: &str = "cert.key";

#[derive(thiserror::Error, Debug)]
pub enum CertificateError {
  #[error("Failed reading {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("No certificate found in {0}")]
  MissingCertificate(PathBuf),
  #[error("No supported private key found in {0}")]
  MissingKey(PathBuf),
  #[error("Unsupported private key: {0}")]
  UnsupportedKey(#[from] rustls::sign::SignError),
  #[error(transparent)]
  Tls(#[from] rustls::Error),
}

/// Source of server certificates, looked up by SNI name
#[cfg_attr(test, mockall::automock)]
pub trait CertificateService: Send + Sync {
  fn get_certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>>;

  /// Called when a couloir is opened so its certificate is ready before the first client
  fn prewarm(&self, server_name: &str);

  /// Called once the relay starts accepting sockets, for services that renew in the background
  fn start(&self) {}

  fn stop(&self) {}
}

fn read_file(path: &Path) -> Result<Vec<u8>, CertificateError> {
  std::fs::read(path).map_err(|source| CertificateError::Read {
    path: path.to_owned(),
    source,
  })
}

/// Builds a signing key from PEM-encoded certificate chain and private key
pub fn load_certified_key(
  cert_pem: &[u8],
  key_pem: &[u8],
  origin: &Path,
) -> Result<CertifiedKey, CertificateError> {
  let chain = rustls_pemfile::certs(&mut &cert_pem[..]).map_err(|source| CertificateError::Read {
    path: origin.join(CERT_FILE),
    source,
  })?;
  if chain.is_empty() {
    return Err(CertificateError::MissingCertificate(origin.join(CERT_FILE)));
  }
  let items = rustls_pemfile::read_all(&mut &key_pem[..]).map_err(|source| {
    CertificateError::Read {
      path: origin.join(CERT_KEY_FILE),
      source,
    }
  })?;
  let key = items
    .into_iter()
    .find_map(|item| match item {
      rustls_pemfile::Item::PKCS8Key(key)
      | rustls_pemfile::Item::RSAKey(key)
      | rustls_pemfile::Item::ECKey(key) => Some(rustls::PrivateKey(key)),
      _ => None,
    })
    .ok_or_else(|| CertificateError::MissingKey(origin.join(CERT_KEY_FILE)))?;
  let signing_key = rustls::sign::any_supported_type(&key)?;
  Ok(CertifiedKey::new(
    chain.into_iter().map(rustls::Certificate).collect(),
    signing_key,
  ))
}

/// Loads `<directory>/cert.pem` and `<directory>/cert.key`
pub fn load_certificate_directory(directory: &Path) -> Result<CertifiedKey, CertificateError> {
  let cert = read_file(&directory.join(CERT_FILE))?;
  let key = read_file(&directory.join(CERT_KEY_FILE))?;
  load_certified_key(&cert, &key, directory)
}

/// [CertificateService] over a certificate directory
///
/// Lookups try the exact name, then the wildcard certificate of its parent domain, then the
/// certificate of the relay's own domain.
pub struct DirectoryCertificateStore {
  directory: PathBuf,
  primary_domain: String,
  certificates: ArcSwap<HashMap<String, Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for DirectoryCertificateStore {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("DirectoryCertificateStore")
      .field("directory", &self.directory)
      .field("primary_domain", &self.primary_domain)
      .field("names", &self.names())
      .finish()
  }
}

impl DirectoryCertificateStore {
  pub fn load(
    directory: impl Into<PathBuf>,
    primary_domain: impl Into<String>,
  ) -> Result<Self, CertificateError> {
    let directory = directory.into();
    std::fs::create_dir_all(&directory).map_err(|source| CertificateError::Read {
      path: directory.clone(),
      source,
    })?;
    let entries = std::fs::read_dir(&directory).map_err(|source| CertificateError::Read {
      path: directory.clone(),
      source,
    })?;
    let mut certificates = HashMap::new();
    for entry in entries.flatten() {
      let path = entry.path();
      let name = match (path.is_dir(), entry.file_name().to_str()) {
        (true, Some(name)) => name.to_ascii_lowercase(),
        _ => continue,
      };
      match load_certificate_directory(&path) {
        Ok(key) => {
          tracing::debug!(name = %name, "Loaded certificate");
          certificates.insert(name, Arc::new(key));
        }
        Err(error) => tracing::warn!(name = %name, error = %error, "Skipping certificate"),
      }
    }
    tracing::info!(
      directory = %directory.display(),
      count = certificates.len(),
      "Loaded certificates"
    );
    Ok(Self {
      directory,
      primary_domain: primary_domain.into().to_ascii_lowercase(),
      certificates: ArcSwap::from_pointee(certificates),
    })
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  pub fn insert(&self, server_name: &str, key: Arc<CertifiedKey>) {
    let name = server_name.to_ascii_lowercase();
    self.certificates.rcu(|current| {
      let mut next = HashMap::clone(current);
      next.insert(name.clone(), key.clone());
      next
    });
  }

  pub fn names(&self) -> Vec<String> {
    let mut names: Vec<String> = self.certificates.load().keys().cloned().collect();
    names.sort();
    names
  }

  fn lookup(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
    let certificates = self.certificates.load();
    let name = server_name.to_ascii_lowercase();
    if let Some(key) = certificates.get(&name) {
      return Some(key.clone());
    }
    if let Some((_, parent)) = name.split_once('.') {
      if let Some(key) = certificates.get(&format!("*.{}", parent)) {
        return Some(key.clone());
      }
    }
    certificates.get(&self.primary_domain).cloned()
  }
}

impl CertificateService for DirectoryCertificateStore {
  fn get_certificate(&self, server_name: &str) -> Option<Arc<CertifiedKey>> {
    let key = self.lookup(server_name);
    if key.is_none() {
      tracing::warn!(server_name, "No certificate available");
    }
    key
  }

  fn prewarm(&self, server_name: &str) {
    let name = server_name.to_ascii_lowercase();
    if self.certificates.load().contains_key(&name) {
      return;
    }
    let path = self.directory.join(&name);
    if !path.is_dir() {
      tracing::debug!(server_name = %name, "No dedicated certificate, using fallback");
      return;
    }
    match load_certificate_directory(&path) {
      Ok(key) => self.insert(&name, Arc::new(key)),
      Err(error) => tracing::warn!(server_name = %name, error = %error, "Failed to load certificate"),
    }
  }
}

/// Hands rustls the certificate matching the SNI of each handshake
pub struct SniResolver {
  service: Arc<dyn CertificateService>,
}

impl SniResolver {
  pub fn new(service: Arc<dyn CertificateService>) -> Self {
    Self { service }
  }
}

impl ResolvesServerCert for SniResolver {
  fn resolve(&self, client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
    self
      .service
      .get_certificate(client_hello.server_name().unwrap_or_default())
  }
}

pub fn server_config(service: Arc<dyn CertificateService>) -> Arc<rustls::ServerConfig> {
  let mut config = rustls::ServerConfig::builder()
    .with_safe_defaults()
    .with_no_client_auth()
    .with_cert_resolver(Arc::new(SniResolver::new(service)));
  config.alpn_protocols = vec![b"http/1.1".to_vec()];
  Arc::new(config)
}

/// Client configuration trusting the system roots, plus an optional PEM authority
pub fn client_config(authority: Option<&Path>) -> Result<Arc<rustls::ClientConfig>, CertificateError> {
  let mut roots = rustls::RootCertStore::empty();
  match rustls_native_certs::load_native_certs() {
    Ok(certs) => {
      let ders: Vec<Vec<u8>> = certs.into_iter().map(|cert| cert.0).collect();
      let (added, ignored) = roots.add_parsable_certificates(&ders);
      tracing::debug!(added, ignored, "Loaded native root certificates");
    }
    Err(error) => tracing::warn!(error = %error, "Failed to load native root certificates"),
  }
  if let Some(path) = authority {
    let pem = read_file(path)?;
    let ders = rustls_pemfile::certs(&mut &pem[..]).map_err(|source| CertificateError::Read {
      path: path.to_owned(),
      source,
    })?;
    let (added, _) = roots.add_parsable_certificates(&ders);
    if added == 0 {
      return Err(CertificateError::MissingCertificate(path.to_owned()));
    }
  }
  let config = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_no_client_auth();
  Ok(Arc::new(config))
}
