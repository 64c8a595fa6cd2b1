//! Command-line and environment configuration for the two binaries.

use clap::Parser;

/// Arguments for `sockbus-gateway`.
#[derive(Debug, Clone, Parser)]
#[command(name = "sockbus-gateway", version, about = "websocket gateway onto a redis pub/sub bus")]
pub struct GatewayArgs {
    /// Listening port of the service.
    #[arg(long, env = "SOCKBUS_PORT", default_value_t = 8888)]
    pub port: u16,

    /// Bus (redis) server: host, host:port, or a full redis:// URL.
    #[arg(long = "redis", env = "SOCKBUS_REDIS", default_value = "127.0.0.1")]
    pub redis: String,
}

impl GatewayArgs {
    /// The bus URL derived from `--redis`.
    pub fn bus_url(&self) -> String {
        bus_url(&self.redis)
    }
}

/// Arguments for `sockbus-worker`.
#[derive(Debug, Clone, Parser)]
#[command(name = "sockbus-worker", version, about = "demo backend worker for the sockbus gateway")]
pub struct WorkerArgs {
    /// Bus (redis) server: host, host:port, or a full redis:// URL.
    #[arg(long = "redis", env = "SOCKBUS_REDIS", default_value = "127.0.0.1")]
    pub redis: String,
}

impl WorkerArgs {
    /// The bus URL derived from `--redis`.
    pub fn bus_url(&self) -> String {
        bus_url(&self.redis)
    }
}

fn bus_url(host: &str) -> String {
    if host.contains("://") {
        host.to_owned()
    } else if host.contains(':') {
        format!("redis://{host}")
    } else {
        format!("redis://{host}:6379")
    }
}
