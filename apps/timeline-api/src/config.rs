use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use timeline_routing::RouteTable;

#[derive(Debug, Parser)]
#[command(name = "timeline-api")]
#[command(about = "Realtime event timeline: SSE truth channel and WebSocket gesture channel")]
pub struct Cli {
    #[arg(long, env = "TIMELINE_LISTEN", default_value = "127.0.0.1:8787")]
    pub listen: SocketAddr,
    /// JSON array of route records.
    #[arg(long, env = "TIMELINE_ROUTES")]
    pub routes: Option<PathBuf>,
    #[arg(long, env = "TIMELINE_TENANT_ID", default_value = "*")]
    pub tenant_id: String,
    #[arg(long, env = "TIMELINE_ENV", default_value = "lab")]
    pub env: String,
    #[arg(long, env = "TIMELINE_PROJECT_ID", default_value = "*")]
    pub project_id: String,
    #[arg(long, env = "TIMELINE_JWT_SECRET", hide_env_values = true)]
    pub jwt_secret: String,
    #[arg(long, env = "TIMELINE_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,
    #[arg(long, env = "TIMELINE_SUBSCRIBER_CAPACITY", default_value_t = 1024)]
    pub subscriber_capacity: usize,
    /// Mode assumed for WebSocket clients whose hello omits one.
    #[arg(long, env = "TIMELINE_DEFAULT_MODE", default_value = "saas")]
    pub default_mode: String,
}

impl Cli {
    /// An absent `--routes` yields an empty table, which fails kernel construction.
    pub fn route_table(&self) -> Result<RouteTable> {
        match &self.routes {
            Some(path) => RouteTable::load(path)
                .with_context(|| format!("failed to load route table {}", path.display())),
            None => Ok(RouteTable::new()),
        }
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}
