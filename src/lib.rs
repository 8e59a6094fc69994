pub mod config;
pub mod email;
pub mod error;
pub mod http;
pub mod pipeline;
pub mod rewrite;
pub mod smtp;
pub mod webhook;

use acton_reactive::prelude::*;
use anyhow::Result;
use log::{error, info};
use std::sync::Arc;

/// Installs the process-wide rustls crypto provider. Calling it again is a no-op.
pub fn install_crypto_provider() {
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .ok();
}

pub async fn run() -> Result<()> {
    info!(
        "Starting {} v{}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION")
    );

    let config = match config::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    install_crypto_provider();
    let pipeline = Arc::new(pipeline::MailPipeline::from_config(&config));

    let mut runtime = ActonApp::launch_async().await;
    let _smtp_handle = smtp::SmtpListenerState::create(&mut runtime, &config, pipeline).await?;

    // Wait for shutdown signal (SIGTERM/SIGINT)
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping listener...");

    // Cancels the accept loop; sessions already running finish on their own tasks.
    runtime.shutdown_all().await?;
    info!("Shutdown complete");

    Ok(())
}
