// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kestrel Core - execution plane
//!
//! Runs the history engine, matching and the timer service in one process
//! until Ctrl-C. Without `KESTREL_DATABASE_URL` state lives in memory.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use kestrel_core::config::Config;
use kestrel_core::events::EventSerializer;
use kestrel_core::persistence::{InMemoryPersistence, SqlitePersistence};
use kestrel_core::runtime::{CoreRuntime, CoreRuntimeBuilder};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kestrel_core=info".parse()?),
        )
        .init();

    info!("Starting Kestrel Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        encoding = config.event_encoding.as_str(),
        partitions = config.matching.num_partitions,
        timer_shards = config.timer.num_shards,
        "Configuration loaded"
    );

    let builder = CoreRuntime::builder();
    let builder: CoreRuntimeBuilder = match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let persistence = SqlitePersistence::connect(url)
                .await?
                .with_serializer(EventSerializer::new(config.event_encoding))
                .with_num_shards(config.timer.num_shards);
            info!("Database connection established, migrations applied");
            builder.persistence(Arc::new(persistence))
        }
        None => {
            info!("KESTREL_DATABASE_URL not set, using in-memory persistence");
            builder.persistence(Arc::new(InMemoryPersistence::new()))
        }
    };

    let runtime = builder.config(config).build()?.start().await?;

    if !runtime.persistence().health_check().await? {
        error!("Persistence health check failed");
    }
    info!("Kestrel Core initialized successfully");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
