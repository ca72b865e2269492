// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_ipaddr(v: &str) -> Result<IpAddr, String> {
  v.parse::<IpAddr>()
    .map_err(|_| String::from("Could not parse input as ipv4 or ipv6 address"))
}

pub fn parse_port(v: &str) -> Result<u16, String> {
  match v.parse::<u16>() {
    Ok(0) => Err(String::from("Port must be between 1 and 65535")),
    Ok(port) => Ok(port),
    Err(_) => Err(format!("{:?} is not a valid port number", v)),
  }
}

pub fn parse_concurrency(v: &str) -> Result<usize, String> {
  match v.parse::<usize>() {
    Ok(0) | Err(_) => Err(String::from("Concurrency must be a positive integer")),
    Ok(limit) => Ok(limit),
  }
}

/// Parses a duration given in milliseconds
pub fn parse_millis(v: &str) -> Result<Duration, String> {
  v.parse::<u64>()
    .map(Duration::from_millis)
    .map_err(|_| format!("{:?} is not a number of milliseconds", v))
}

/// Accepts DNS names made of letters, digits, dashes, and dots
pub fn parse_domain(v: &str) -> Result<String, String> {
  let domain = v.trim().trim_end_matches('.').to_ascii_lowercase();
  let valid = !domain.is_empty()
    && domain.split('.').all(|label| {
      !label.is_empty()
        && label.len() <= 63
        && !label.starts_with('-')
        && !label.ends_with('-')
        && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
  if valid {
    Ok(domain)
  } else {
    Err(format!("{:?} is not a valid domain name", v))
  }
}

pub fn validate_ipaddr(v: &str) -> Result<(), String> {
  parse_ipaddr(v).map(|_| ())
}

pub fn validate_port(v: &str) -> Result<(), String> {
  parse_port(v).map(|_| ())
}

pub fn validate_concurrency(v: &str) -> Result<(), String> {
  parse_concurrency(v).map(|_| ())
}

pub fn validate_millis(v: &str) -> Result<(), String> {
  parse_millis(v).map(|_| ())
}

pub fn validate_domain(v: &str) -> Result<(), String> {
  parse_domain(v).map(|_| ())
}
