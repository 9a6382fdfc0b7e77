use std::{net::SocketAddr, path::PathBuf, time::Duration};

use typed_builder::TypedBuilder;

use crate::net::{BACKEND_PORT, FRONTEND_PORT};

/// How PHOTONDATA replies relate to the simulation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Simulate on receipt and reply with the hits.
    #[default]
    Sync,
    /// Acknowledge on receipt, simulate in batches and write hits to the run
    /// file opened by RUN_BEGIN.
    Async,
}

/// Startup options shared by the broker and workers.
#[derive(TypedBuilder, Clone, Debug)]
pub struct Config {
    /// Where the broker listens for clients.
    #[builder(default = SocketAddr::from(([0, 0, 0, 0], FRONTEND_PORT)))]
    pub frontend_addr: SocketAddr,
    /// Where the broker listens for workers.
    #[builder(default = SocketAddr::from(([0, 0, 0, 0], BACKEND_PORT)))]
    pub backend_addr: SocketAddr,
    /// Where workers find the broker.
    #[builder(default = SocketAddr::from(([127, 0, 0, 1], BACKEND_PORT)))]
    pub broker_addr: SocketAddr,
    #[builder(default = Duration::from_secs(1))]
    pub heartbeat_interval: Duration,
    /// Heartbeats a peer may miss before it is presumed dead.
    #[builder(default = 3)]
    pub heartbeat_liveness: u32,
    #[builder(default = 3)]
    pub reconnect_attempts: u32,
    /// Pause before a worker reopens a silent connection.
    #[builder(default = Duration::from_secs(2))]
    pub retry_after: Duration,
    /// Buffered PHOTONDATA requests that trigger a flush in async mode.
    #[builder(default = 100)]
    pub flush_threshold: usize,
    #[builder(default = PathBuf::from("."), setter(into))]
    pub output_dir: PathBuf,
    #[builder(default)]
    pub mode: DeliveryMode,
}

impl Config {
    /// How long a silent worker stays registered with the broker.
    pub fn liveness_window(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_liveness
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_deployed_cluster() {
        let config = Config::default();
        assert_eq!(config.frontend_addr.port(), 5555);
        assert_eq!(config.backend_addr.port(), 5556);
        assert_eq!(config.broker_addr, "127.0.0.1:5556".parse::<SocketAddr>().unwrap());
        assert_eq!(config.mode, DeliveryMode::Sync);
        assert_eq!(config.liveness_window(), Duration::from_secs(3));
    }

    #[test]
    fn liveness_window_scales_with_interval() {
        let config = Config::builder()
            .heartbeat_interval(Duration::from_millis(250))
            .heartbeat_liveness(4)
            .output_dir("/tmp/runs")
            .build();
        assert_eq!(config.liveness_window(), Duration::from_secs(1));
        assert_eq!(config.output_dir, PathBuf::from("/tmp/runs"));
    }
}
