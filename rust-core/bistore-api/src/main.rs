// SPDX-License-Identifier: PMPL-1.0-or-later
//! BiStore API server binary
//!
//! Reads configuration from the environment and serves the HTTP API.
//! `RUST_LOG` sets the filter; `BISTORE_LOG_FORMAT=json` switches to JSON lines.

use bistore_api::BistoreConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if std::env::var("BISTORE_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = BistoreConfig::from_env()?;

    tracing::info!(
        "Starting BiStore API server on {}:{}",
        config.api.host,
        config.api.port
    );

    bistore_api::serve(config).await?;

    Ok(())
}
