// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! keyweave daemon binary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use keyweave_common_config::load_secret_env;
use keyweave_core::Id;
use keyweave_daemon::{CredentialEngine, DaemonConfig, EngineOptions, LogFormat, LoginCredential, SessionHandle};
use keyweave_registry::HttpRegistry;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const TOKEN_ID_VAR: &str = "KEYWEAVE_TOKEN_ID";
const TOKEN_SECRET_VAR: &str = "KEYWEAVE_TOKEN_SECRET";

/// keyweave daemon - holds a session and serves credentials.
#[derive(Parser, Debug)]
#[command(name = "keyweave-daemon", about = "keyweave secrets daemon", version)]
struct Args {
	/// Path to the config file (default: $KEYWEAVE_ROOT/config.toml)
	#[arg(long, env = "KEYWEAVE_CONFIG")]
	config: Option<PathBuf>,

	/// Override the registry URL
	#[arg(long)]
	registry_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let args = Args::parse();

	let mut config = DaemonConfig::load(args.config.as_deref()).context("loading configuration")?;
	if let Some(url) = args.registry_url {
		config.registry.url = url;
		config.validate().context("validating --registry-url")?;
	}

	init_tracing(&config);
	tracing::info!(
		root = %config.root_dir.display(),
		registry = %config.registry.url,
		"starting keyweave-daemon"
	);

	let registry = HttpRegistry::new(config.registry.client_config()).context("creating registry client")?;
	let engine = CredentialEngine::new(Arc::new(registry), EngineOptions::from(&config));
	install_panic_wipe(engine.session().clone());

	if let Some(credential) = machine_credential()? {
		match engine.login(&credential).await {
			Ok(identity) => tracing::info!(identity_id = %identity.id, "machine session established"),
			Err(e) => tracing::error!(error = %e, kind = ?e.kind(), "machine login failed"),
		}
	}

	shutdown_signal().await;
	tracing::info!("received shutdown signal");
	engine.logout().await;
	tracing::info!("shutdown complete");
	Ok(())
}

fn init_tracing(config: &DaemonConfig) {
	let filter = tracing_subscriber::EnvFilter::try_from_default_env()
		.unwrap_or_else(|_| config.logging.level.clone().into());

	let registry = tracing_subscriber::registry().with(filter);
	match config.logging.format {
		LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
		LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
	}
}

/// Wipe session keys before the default panic output runs.
///
/// If the panicking operation holds the session, the wipe happens on the
/// next session access instead. Release builds keep `panic = "unwind"`, so a
/// panic on the main task still drops the engine and zeroizes its keys.
fn install_panic_wipe(session: SessionHandle) {
	let default_hook = std::panic::take_hook();
	std::panic::set_hook(Box::new(move |info| {
		if !session.try_wipe() {
			eprintln!("keyweave-daemon: session busy during panic; wiping once the operation unwinds");
		}
		default_hook(info);
	}));
}

/// A machine credential from the environment, if one is configured.
fn machine_credential() -> anyhow::Result<Option<LoginCredential>> {
	let Ok(token_id) = std::env::var(TOKEN_ID_VAR) else {
		return Ok(None);
	};
	let token_id: Id = token_id
		.trim()
		.parse()
		.with_context(|| format!("{TOKEN_ID_VAR} is not a valid id"))?;
	let secret = load_secret_env(TOKEN_SECRET_VAR)?
		.with_context(|| format!("{TOKEN_ID_VAR} is set but {TOKEN_SECRET_VAR} is not"))?;
	Ok(Some(LoginCredential::Machine { token_id, secret }))
}

async fn shutdown_signal() {
	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};
		match signal(SignalKind::terminate()) {
			Ok(mut terminate) => {
				tokio::select! {
					_ = tokio::signal::ctrl_c() => {}
					_ = terminate.recv() => {}
				}
			}
			Err(e) => {
				tracing::warn!(error = %e, "cannot listen for SIGTERM");
				let _ = tokio::signal::ctrl_c().await;
			}
		}
	}
	#[cfg(not(unix))]
	{
		let _ = tokio::signal::ctrl_c().await;
	}
}
