// Copyright (c) Couloir Contributors.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::{Context as AnyhowContext, Result};
use clap::{Arg, ArgMatches, Command};
use couloir::common::control_api::ControlApiOptions;
use couloir::expose::ExposeOptions;
use couloir::relay::options::default_certs_directory;
use couloir::relay::RelayOptions;
use couloir::util;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

use util::validators::{
  parse_concurrency, parse_domain, parse_ipaddr, parse_millis, parse_port, validate_concurrency,
  validate_domain, validate_existing_file, validate_ipaddr, validate_millis, validate_port,
};

mod certgen;
mod expose;
mod relay;

fn main() {
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .arg(
      Arg::new("verbose")
        .long("verbose")
        .short('v')
        .global(true)
        .help("Log debug output, including peer addresses on the relay"),
    )
    .subcommand(
      Command::new("relay")
        .about("Run a relay accepting couloirs under a domain")
        .arg(
          Arg::new("domain")
            .validator(validate_domain)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("port")
            .long("port")
            .short('p')
            .validator(validate_port)
            .takes_value(true)
            .help("Defaults to 443, or 80 with --http"),
        )
        .arg(
          Arg::new("bind")
            .long("bind")
            .validator(validate_ipaddr)
            .default_value("0.0.0.0")
            .takes_value(true),
        )
        .arg(
          Arg::new("http")
            .long("http")
            .help("Serve plain HTTP instead of TLS"),
        )
        .arg(
          Arg::new("certs-directory")
            .long("certs-directory")
            .takes_value(true),
        )
        .arg(Arg::new("password").long("password").takes_value(true))
        .arg(
          Arg::new("drain-grace-ms")
            .long("drain-grace-ms")
            .validator(validate_millis)
            .takes_value(true),
        )
        .arg(
          Arg::new("control-api-host")
            .long("control-api-host")
            .takes_value(true)
            .requires_all(&["control-api-port", "control-api-key"]),
        )
        .arg(
          Arg::new("control-api-port")
            .long("control-api-port")
            .validator(validate_port)
            .takes_value(true),
        )
        .arg(
          Arg::new("control-api-key")
            .long("control-api-key")
            .takes_value(true),
        )
        .arg(Arg::new("control-api-tls").long("control-api-tls")),
    )
    .subcommand(
      Command::new("expose")
        .about("Expose a local HTTP server through a relay")
        .arg(
          Arg::new("local-port")
            .validator(validate_port)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("on")
            .long("on")
            .help("Host name of the relay")
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("name")
            .long("name")
            .help("Requested couloir name")
            .takes_value(true),
        )
        .arg(
          Arg::new("relay-port")
            .long("relay-port")
            .validator(validate_port)
            .takes_value(true),
        )
        .arg(
          Arg::new("relay-ip")
            .long("relay-ip")
            .validator(validate_ipaddr)
            .takes_value(true),
        )
        .arg(
          Arg::new("local-host")
            .long("local-host")
            .default_value("localhost")
            .takes_value(true),
        )
        .arg(
          Arg::new("override-host")
            .long("override-host")
            .help("Host header sent to the local server")
            .takes_value(true),
        )
        .arg(Arg::new("http").long("http").help("Reach the relay over plain HTTP"))
        .arg(Arg::new("password").long("password").takes_value(true))
        .arg(
          Arg::new("max-concurrency")
            .long("max-concurrency")
            .validator(validate_concurrency)
            .default_value("100")
            .takes_value(true),
        )
        .arg(Arg::new("cli-token").long("cli-token").takes_value(true))
        .arg(
          Arg::new("authority")
            .long("authority")
            .short('a')
            .help("Extra certificate authority trusted for the relay")
            .validator(validate_existing_file)
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate a self-signed certificate for a relay domain")
        .arg(
          Arg::new("domain")
            .validator(validate_domain)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("certs-directory")
            .long("certs-directory")
            .takes_value(true),
        ),
    )
    .subcommand(Command::new("version").about("Print the couloir version"))
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let verbose = matches.is_present("verbose")
    || matches
      .subcommand()
      .map_or(false, |(_, opts)| opts.is_present("verbose"));

  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
    tracing_subscriber::EnvFilter::new(if verbose { "couloir=debug,info" } else { "info" })
  });
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_target(verbose)
    .finish();
  if let Err(error) = tracing::subscriber::set_global_default(collector) {
    eprintln!("Logger init failed: {}", error);
  }

  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>").to_owned();
  let rt = match tokio::runtime::Builder::new_multi_thread()
    .thread_name("couloir-worker")
    .enable_all()
    .build()
  {
    Ok(rt) => rt,
    Err(error) => {
      eprintln!("Tokio runtime setup failure: {}", error);
      std::process::exit(1);
    }
  };
  match rt.block_on(main_args_handler(&matches, verbose)) {
    Err(err) => {
      tracing::error!(mode = %mode, "{:#}", err);
      std::process::exit(1);
    }
    Ok(()) => tracing::debug!("{} exited successfully", mode),
  }
}

/// Cancelled on the first Ctrl-C
fn shutdown_on_ctrl_c() -> CancellationToken {
  let shutdown = CancellationToken::new();
  tokio::spawn({
    let shutdown = shutdown.clone();
    async move {
      match tokio::signal::ctrl_c().await {
        Ok(()) => {
          tracing::info!("Interrupted, shutting down");
          shutdown.cancel();
        }
        Err(error) => tracing::warn!(error = %error, "Failed to listen for Ctrl-C"),
      }
    }
  });
  shutdown
}

fn value<T>(
  args: &'_ ArgMatches,
  name: &str,
  parse: fn(&str) -> Result<T, String>,
) -> Result<Option<T>> {
  args
    .value_of(name)
    .map(|raw| parse(raw).map_err(anyhow::Error::msg))
    .transpose()
    .with_context(|| format!("Invalid --{}", name))
}

fn relay_arg_handling(args: &'_ ArgMatches, verbose: bool) -> Result<relay::RelayArgs> {
  let domain = value(args, "domain", parse_domain)?.context("Domain is required")?;
  let mut options = RelayOptions::new(domain);
  options.http = args.is_present("http");
  options.relay_port = value(args, "port", parse_port)?.unwrap_or_else(|| options.default_port());
  if let Some(bind_ip) = value(args, "bind", parse_ipaddr)? {
    options.bind_ip = bind_ip;
  }
  options.certs_directory = args
    .value_of("certs-directory")
    .map_or_else(default_certs_directory, PathBuf::from);
  options.password = args.value_of("password").map(String::from);
  if let Some(drain_grace) = value(args, "drain-grace-ms", parse_millis)? {
    options.drain_grace = drain_grace;
  }
  options.verbose = verbose;

  let control_api = match args.value_of("control-api-host") {
    None => None,
    Some(host) => Some(ControlApiOptions {
      host: host.to_owned(),
      port: value(args, "control-api-port", parse_port)?.context("Missing control API port")?,
      api_key: args
        .value_of("control-api-key")
        .context("Missing control API key")?
        .to_owned(),
      use_tls: args.is_present("control-api-tls"),
    }),
  };
  Ok(relay::RelayArgs {
    options,
    control_api,
  })
}

fn expose_arg_handling(args: &'_ ArgMatches) -> Result<expose::ExposeArgs> {
  let local_port = value(args, "local-port", parse_port)?.context("Local port is required")?;
  let relay_host = args.value_of("on").context("Relay host is required")?;
  let mut options = ExposeOptions::new(local_port, relay_host);
  if let Some(local_host) = args.value_of("local-host") {
    options.local_host = local_host.to_owned();
  }
  options.relay_ip = value(args, "relay-ip", parse_ipaddr)?;
  options.name = args.value_of("name").map(String::from);
  options.override_host = args.value_of("override-host").map(String::from);
  options.password = args.value_of("password").map(String::from);
  options.cli_token = args.value_of("cli-token").map(String::from);
  if let Some(max_concurrency) = value(args, "max-concurrency", parse_concurrency)? {
    options.max_concurrency = max_concurrency;
  }
  Ok(expose::ExposeArgs {
    options,
    tls: !args.is_present("http"),
    relay_port: value(args, "relay-port", parse_port)?,
    authority: args.value_of("authority").map(PathBuf::from),
  })
}

async fn main_args_handler(matches: &'_ ArgMatches, verbose: bool) -> Result<()> {
  match matches
    .subcommand()
    .context("A subcommand is required")?
  {
    ("relay", opts) => {
      let config = relay_arg_handling(opts, verbose)?;
      tracing::debug!("Running as relay with config {:#?}", config);
      relay::relay_main(config, shutdown_on_ctrl_c()).await
    }
    ("expose", opts) => {
      let config = expose_arg_handling(opts)?;
      tracing::debug!("Running as host with config {:#?}", config);
      expose::expose_main(config, shutdown_on_ctrl_c()).await
    }
    ("cert", opts) => {
      let domain = value(opts, "domain", parse_domain)?.context("Domain is required")?;
      let directory = opts
        .value_of("certs-directory")
        .map_or_else(default_certs_directory, PathBuf::from);
      certgen::certgen_main(directory, domain).await
    }
    ("version", _) => {
      println!("couloir {}", couloir::VERSION);
      Ok(())
    }
    (other, _) => anyhow::bail!("Unknown subcommand {}", other),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_optional_values() {
    let matches = Command::new("test")
      .arg(Arg::new("port").long("port").takes_value(true))
      .try_get_matches_from(["test", "--port", "8080"])
      .unwrap();
    assert_eq!(value(&matches, "port", parse_port).unwrap(), Some(8080));

    let absent = Command::new("test")
      .arg(Arg::new("port").long("port").takes_value(true))
      .try_get_matches_from(["test"])
      .unwrap();
    assert_eq!(value(&absent, "port", parse_port).unwrap(), None);

    let invalid = Command::new("test")
      .arg(Arg::new("port").long("port").takes_value(true))
      .try_get_matches_from(["test", "--port", "0"])
      .unwrap();
    assert!(value(&invalid, "port", parse_port).is_err());
  }
}
