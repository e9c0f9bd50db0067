//! loadswarm - worker process for distributed load generation

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use loadswarm_core::Runner;

mod cli;
mod tasks;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(args.log_level().into()),
        )
        .init();

    let config = args.worker_config();
    tracing::info!(
        host = %config.master_host,
        port = config.master_port,
        "loadswarm worker starting"
    );

    let mut runner = Runner::new(config)?;
    let recorder = runner.recorder();
    runner.register(Arc::new(tasks::BrowseTask::new(recorder.clone())));
    runner.register(Arc::new(tasks::CheckoutTask::new(recorder)));

    let shutdown = runner.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            shutdown.cancel();
        }
    });

    runner.run().await?;
    Ok(())
}
