// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Tether connector daemon binary.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tether_connector::{Connector, ConnectorConfig, NoopIntegration, TlsPaths};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Pair-wise service exposure connector.
#[derive(Parser, Debug)]
#[command(name = "tether", about = "Tether service exposure connector", version)]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
	/// Run the connector daemon
	Run(RunArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
	/// Bind address for the RPC API
	#[arg(long, default_value = "0.0.0.0:9090")]
	rpc_bind: String,

	/// Bind address for the HTTP API
	#[arg(long, default_value = "0.0.0.0:9091")]
	http_bind: String,

	/// Path for the PEM encoded TLS root certificate
	#[arg(long)]
	root_cert_path: Option<PathBuf>,

	/// Path for the server's PEM encoded TLS certificate
	#[arg(long)]
	server_cert_path: Option<PathBuf>,

	/// Path for the server's PEM encoded private key
	#[arg(long)]
	server_key_path: Option<PathBuf>,

	/// Log output level [trace, debug, info, warn, error]
	#[arg(long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();
	match cli.command {
		Command::Run(args) => run(args).await,
	}
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
		)
		.init();

	let config = ConnectorConfig {
		tls: TlsPaths::new(
			args.root_cert_path,
			args.server_cert_path,
			args.server_key_path,
		),
		..ConnectorConfig::default()
	};

	let connector = Arc::new(Connector::new(config, Arc::new(NoopIntegration))?);

	info!(bind = %args.rpc_bind, "starting rpc server");
	if let Err(e) = connector.bind(&args.rpc_bind).await {
		error!(bind = %args.rpc_bind, error = %e, "unable to listen on rpc address");
		std::process::exit(1);
	}
	connector.spawn_serve().await?;

	info!(bind = %args.http_bind, "starting http server");
	let facade_tls = connector.tls_context();
	let http_bind = args.http_bind.clone();
	let rpc_addr = facade_rpc_addr(&args.rpc_bind);
	let http_handle = tokio::spawn(async move {
		if let Err(e) = tether_http::serve(&http_bind, rpc_addr, facade_tls).await {
			error!(error = %e, "unable to start http server");
			std::process::exit(1);
		}
	});

	// signals are wired before blocking on the servers so shutdown always runs
	tokio::signal::ctrl_c().await?;
	info!("received shutdown signal");

	http_handle.abort();
	connector.shutdown().await;

	Ok(())
}

/// The facade dials the daemon it shares a process with; an unspecified bind
/// host is rewritten to loopback.
fn facade_rpc_addr(rpc_bind: &str) -> String {
	match rpc_bind.rsplit_once(':') {
		Some(("0.0.0.0", port)) | Some(("", port)) => format!("localhost:{port}"),
		_ => rpc_bind.to_string(),
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_run_args_parse() {
		let cli = Cli::parse_from([
			"tether",
			"run",
			"--rpc-bind",
			"0.0.0.0:9090",
			"--http-bind",
			"0.0.0.0:9091",
			"--log-level",
			"debug",
		]);
		let Command::Run(args) = cli.command;
		assert_eq!(args.rpc_bind, "0.0.0.0:9090");
		assert_eq!(args.http_bind, "0.0.0.0:9091");
		assert_eq!(args.log_level, "debug");
		assert!(args.root_cert_path.is_none());
	}

	#[test]
	fn test_facade_rpc_addr() {
		assert_eq!(facade_rpc_addr("0.0.0.0:9090"), "localhost:9090");
		assert_eq!(facade_rpc_addr(":9090"), "localhost:9090");
		assert_eq!(facade_rpc_addr("127.0.0.1:9090"), "127.0.0.1:9090");
	}
}
