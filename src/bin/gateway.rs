//! The websocket gateway process: accepts client connections and bridges
//! them onto the bus.

use clap::Parser;
use sockbus::{bus::RedisBus, config::GatewayArgs, router, GatewayCfg};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = GatewayArgs::parse();

    let url = args.bus_url();
    info!(%url, "connecting to bus");
    let bus = RedisBus::connect(&url).await?;

    let app = router(GatewayCfg::new(bus));
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening for websocket upgrades on /ws");
    axum::serve(listener, app).await?;
    Ok(())
}
