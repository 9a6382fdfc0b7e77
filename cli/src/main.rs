use std::{net::SocketAddr, path::PathBuf, process::ExitCode, time::Duration};

use clap::{Args, Parser, Subcommand};
use photon_relay::{
    broker::Broker,
    config::{Config, DeliveryMode},
    net::{
        client::Client,
        wire::{Request, Response},
        Error,
    },
    worker::{
        direct::DirectServer, session::Session, sim::Loopback,
        sink::FileStorage, WorkerAgent,
    },
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "photon-relay", version)]
#[command(about = "Dispatches photon simulation jobs to a pool of workers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Route client requests to registered workers.
    Broker {
        /// Client-facing listen address.
        #[arg(long, env = "PHOTON_FRONTEND", default_value = "0.0.0.0:5555")]
        frontend: SocketAddr,

        /// Worker-facing listen address.
        #[arg(long, env = "PHOTON_BACKEND", default_value = "0.0.0.0:5556")]
        backend: SocketAddr,

        #[command(flatten)]
        heartbeat: HeartbeatArgs,
    },

    /// Connect to a broker and serve jobs from it.
    Worker {
        /// Broker backend address.
        #[arg(long, env = "PHOTON_BROKER", default_value = "127.0.0.1:5556")]
        broker: SocketAddr,

        /// Reconnects allowed before the worker gives up.
        #[arg(long, env = "PHOTON_RECONNECT_ATTEMPTS", default_value_t = 3)]
        reconnect_attempts: u32,

        /// Pause before reopening a silent connection, in milliseconds.
        #[arg(long, env = "PHOTON_RETRY_MS", default_value_t = 2000)]
        retry_ms: u64,

        #[command(flatten)]
        heartbeat: HeartbeatArgs,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Serve clients directly, without a broker.
    Serve {
        #[arg(long, env = "PHOTON_LISTEN", default_value = "0.0.0.0:5557")]
        listen: SocketAddr,

        #[command(flatten)]
        session: SessionArgs,
    },

    /// Check that a broker or direct-mode worker answers.
    Ping {
        addr: SocketAddr,

        /// Seconds to wait for the reply.
        #[arg(long, default_value_t = 5)]
        timeout_secs: u64,
    },
}

#[derive(Debug, Args)]
struct HeartbeatArgs {
    /// Heartbeat interval in milliseconds.
    #[arg(long, env = "PHOTON_HEARTBEAT_MS", default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Heartbeats a peer may miss before it is presumed dead.
    #[arg(long, env = "PHOTON_HEARTBEAT_LIVENESS", default_value_t = 3)]
    liveness: u32,
}

impl HeartbeatArgs {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }
}

#[derive(Debug, Args)]
struct SessionArgs {
    /// Acknowledge PHOTONDATA immediately and write hits to run files.
    #[arg(long, env = "PHOTON_ASYNC_MODE")]
    async_mode: bool,

    /// Buffered requests per flush in async mode.
    #[arg(long, env = "PHOTON_FLUSH_THRESHOLD", default_value_t = 100)]
    flush_threshold: usize,

    /// Where run files are written.
    #[arg(long, env = "PHOTON_OUTPUT_DIR", default_value = ".")]
    output_dir: PathBuf,

    /// Channels of the loopback detector.
    #[arg(long, env = "PHOTON_CHANNELS", default_value_t = 64)]
    channels: usize,
}

impl SessionArgs {
    fn mode(&self) -> DeliveryMode {
        if self.async_mode {
            DeliveryMode::Async
        } else {
            DeliveryMode::Sync
        }
    }

    fn session(&self, config: &Config) -> Session<Loopback, FileStorage> {
        Session::from_config(
            config,
            Loopback::new(self.channels),
            FileStorage::new(&config.output_dir),
        )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run(Cli::parse().command).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command) -> Result<(), Error> {
    match command {
        Command::Broker {
            frontend,
            backend,
            heartbeat,
        } => {
            let config = Config::builder()
                .frontend_addr(frontend)
                .backend_addr(backend)
                .heartbeat_interval(heartbeat.interval())
                .heartbeat_liveness(heartbeat.liveness)
                .build();
            Broker::bind(&config).await?.run().await
        }
        Command::Worker {
            broker,
            reconnect_attempts,
            retry_ms,
            heartbeat,
            session,
        } => {
            let config = Config::builder()
                .broker_addr(broker)
                .heartbeat_interval(heartbeat.interval())
                .heartbeat_liveness(heartbeat.liveness)
                .reconnect_attempts(reconnect_attempts)
                .retry_after(Duration::from_millis(retry_ms))
                .flush_threshold(session.flush_threshold)
                .output_dir(session.output_dir.clone())
                .mode(session.mode())
                .build();
            info!(
                broker = %config.broker_addr,
                mode = ?config.mode,
                "starting worker"
            );
            WorkerAgent::new(&config, session.session(&config)).run().await
        }
        Command::Serve { listen, session } => {
            let config = Config::builder()
                .flush_threshold(session.flush_threshold)
                .output_dir(session.output_dir.clone())
                .mode(session.mode())
                .build();
            DirectServer::bind(listen, session.session(&config))
                .await?
                .run()
                .await
        }
        Command::Ping { addr, timeout_secs } => {
            let mut client = Client::connect(addr)
                .await?
                .with_timeout(Duration::from_secs(timeout_secs));
            match client.request(&Request::Ping).await? {
                Response::Ack => {
                    println!("{} is up", addr);
                    Ok(())
                }
                other => Err(Error::MalformedRequest(format!(
                    "unexpected reply {:?}",
                    other
                ))),
            }
        }
    }
}
