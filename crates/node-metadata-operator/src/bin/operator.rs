/*
 * 5D Labs Agent Platform - Node Metadata Operator
 * Copyright (C) 2025 5D Labs
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Node Metadata Operator - propagates MachineSet labels to Machines and Nodes

use anyhow::{Context as _, Result};
use clap::{Parser, ValueEnum};
use node_metadata_operator::controller::{run_controller, verify_machine_api};
use node_metadata_operator::health::{self, Readiness};
use node_metadata_operator::OperatorConfig;
use std::path::Path;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Propagate MachineSet template labels to Machines and their Nodes.
#[derive(Parser, Debug)]
#[command(name = "node-metadata-operator")]
#[command(version)]
struct Cli {
    /// Path to the mounted configuration file
    #[arg(long, env = "OPERATOR_CONFIG", default_value = "/config/config.yaml")]
    config: String,

    /// Only watch this namespace (overrides the config file)
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

fn load_config(cli: &Cli) -> Result<OperatorConfig> {
    let mut config = if Path::new(&cli.config).exists() {
        OperatorConfig::from_mounted_file(&cli.config)?
    } else {
        warn!("Config file {} not found, using defaults", cli.config);
        OperatorConfig::default()
    };

    if let Some(namespace) = &cli.namespace {
        config.namespace = Some(namespace.clone());
    }

    config
        .validate()
        .context("Configuration validation failed")?;
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting node metadata operator v{}", env!("CARGO_PKG_VERSION"));

    let config = Arc::new(load_config(&cli)?);
    info!(
        namespace = ?config.namespace,
        resync_seconds = config.resync_interval_seconds,
        protected_domains = ?config.protected_node_label_domains,
        "Configuration loaded"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let shutdown = CancellationToken::new();
    let readiness = Readiness::default();

    let health_task = {
        let bind_address = config.health.bind_address.clone();
        let readiness = readiness.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = health::serve(&bind_address, readiness, shutdown).await {
                error!("Health server failed: {}", e);
            }
        })
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown.cancel();
        });
    }

    verify_machine_api(&client, config.namespace.as_deref())
        .await
        .context("Machine API verification failed")?;
    readiness.mark_ready();

    let result = run_controller(client, config, shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = health_task.await {
        warn!("Health server task ended abnormally: {}", e);
    }

    result.context("Controller exited with an error")?;
    info!("Node metadata operator stopped");
    Ok(())
}
