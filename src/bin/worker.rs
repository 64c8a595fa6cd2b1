//! The demo backend worker process: consumes client traffic from `conn.*`
//! and answers on the matching `worker.<id>` topics.

use clap::Parser;
use sockbus::{config::WorkerArgs, worker::Worker};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = WorkerArgs::parse();

    let url = args.bus_url();
    info!(%url, "connecting to bus");
    let worker = Worker::connect(&url).await?;
    worker.run().await?;

    // run() only returns once the conn.* subscription has ended, which
    // means the bus transport is gone.
    Err(eyre::eyre!("bus subscription ended; exiting"))
}
