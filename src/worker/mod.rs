use std::{future::Future, net::SocketAddr};

use tokio::{
    select,
    time::{sleep, sleep_until, timeout, timeout_at, Duration, Instant},
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    config::Config,
    net::{
        endpoint::Dealer,
        error::Error,
        wire::{classify, MessageKind},
        Frame, Frames,
    },
};

pub mod direct;
pub mod liveness;
pub mod session;
pub mod sim;
pub mod sink;

use liveness::{LinkState, Liveness, Verdict};
use session::Session;
use sim::Simulation;
use sink::Storage;

/// Answers one job and addresses the reply the way the job arrived.
pub fn respond<S, T>(session: &mut Session<S, T>, frames: &[Frame]) -> Frames
where
    S: Simulation,
    T: Storage,
{
    let envelope = classify(frames);
    let response = session.respond(envelope.body());
    envelope.wrap(response.encode())
}

/// Serves one broker connection from a single task. Each pass of the loop
/// waits at most one heartbeat interval for a message; a silent pass costs a
/// unit of liveness, and running out of liveness reopens the connection.
/// Jobs are answered in arrival order with the simulation running inline, so
/// a long simulation also delays this worker's own heartbeats.
pub struct WorkerAgent<S: Simulation, T: Storage> {
    broker: SocketAddr,
    heartbeat_interval: Duration,
    retry_after: Duration,
    liveness: Liveness,
    session: Session<S, T>,
    link: Option<Dealer>,
    heartbeat_at: Instant,
}

impl<S: Simulation, T: Storage> WorkerAgent<S, T> {
    pub fn new(config: &Config, session: Session<S, T>) -> Self {
        WorkerAgent {
            broker: config.broker_addr,
            heartbeat_interval: config.heartbeat_interval,
            retry_after: config.retry_after,
            liveness: Liveness::new(
                config.heartbeat_liveness,
                config.reconnect_attempts,
            ),
            session,
            link: None,
            heartbeat_at: Instant::now() + config.heartbeat_interval,
        }
    }

    pub fn state(&self) -> LinkState {
        self.liveness.state()
    }

    pub fn session(&self) -> &Session<S, T> {
        &self.session
    }

    /// Runs until interrupted with Ctrl-C or until reconnects are exhausted.
    pub async fn run(self) -> Result<(), Error> {
        self.run_until(tokio::signal::ctrl_c()).await
    }

    /// Runs until `shutdown` completes, closing any open run on the way out.
    /// Fails with [`Error::ReconnectExhausted`] once the broker has been
    /// silent through every reconnect attempt.
    pub async fn run_until<F: Future>(
        mut self,
        shutdown: F,
    ) -> Result<(), Error> {
        tokio::pin!(shutdown);
        self.link = self.connect().await;
        self.heartbeat_at = Instant::now() + self.heartbeat_interval;

        loop {
            let deadline = Instant::now() + self.heartbeat_interval;
            let received = select! {
                _ = &mut shutdown => {
                    info!("interrupted, shutting down");
                    break;
                }
                received = self.wait(deadline) => received,
            };

            match received {
                Some(frames) => self.on_message(frames).await,
                None => match self.liveness.on_silence() {
                    Verdict::Wait => debug!(
                        liveness = self.liveness.liveness(),
                        "broker silent"
                    ),
                    Verdict::Reconnect => {
                        warn!(
                            retries_left = self.liveness.retries_left(),
                            "heartbeat failure, reconnecting in {:?}",
                            self.retry_after
                        );
                        self.link = None;
                        sleep(self.retry_after).await;
                        self.link = self.connect().await;
                        self.liveness.on_reconnected();
                    }
                    Verdict::Terminate => {
                        error!("reconnect attempts exhausted, giving up");
                        self.close_run();
                        return Err(Error::ReconnectExhausted {
                            attempts: self.liveness.max_retries(),
                        });
                    }
                },
            }

            if Instant::now() >= self.heartbeat_at {
                if let Some(link) = self.link.as_mut() {
                    trace!("sending heartbeat");
                    let heartbeat = [MessageKind::Heartbeat.frame()];
                    if let Err(e) = link.send(&heartbeat).await {
                        debug!("heartbeat not sent: {}", e);
                    }
                }
                self.heartbeat_at = Instant::now() + self.heartbeat_interval;
            }
        }

        self.close_run();
        Ok(())
    }

    /// Waits for the next message until `deadline`. A dropped connection
    /// reads as silence until the deadline.
    async fn wait(&mut self, deadline: Instant) -> Option<Frames> {
        if let Some(link) = self.link.as_mut() {
            match timeout_at(deadline, link.recv()).await {
                Ok(Some(frames)) => return Some(frames),
                Ok(None) => {
                    warn!(broker = %self.broker, "connection to broker lost");
                    self.link = None;
                }
                Err(_) => return None,
            }
        }
        sleep_until(deadline).await;
        None
    }

    async fn connect(&self) -> Option<Dealer> {
        let attempt = async {
            let mut dealer = Dealer::connect(self.broker).await?;
            dealer.send(&[MessageKind::Ready.frame()]).await?;
            Ok::<_, Error>(dealer)
        };
        match timeout(self.heartbeat_interval, attempt).await {
            Ok(Ok(dealer)) => {
                info!(broker = %self.broker, "connected, worker ready");
                Some(dealer)
            }
            Ok(Err(e)) => {
                warn!(broker = %self.broker, "could not connect: {}", e);
                None
            }
            Err(_) => {
                warn!(broker = %self.broker, "connect timed out");
                None
            }
        }
    }

    async fn on_message(&mut self, frames: Frames) {
        match frames.len() {
            0 => self.liveness.on_other(),
            1 if MessageKind::Heartbeat.is(&frames[0]) => {
                trace!("heartbeat from broker");
                self.liveness.on_heartbeat();
            }
            1 => {
                warn!(
                    frame = %String::from_utf8_lossy(&frames[0]),
                    "invalid message from broker"
                );
                self.liveness.on_other();
            }
            _ => {
                let reply = respond(&mut self.session, &frames);
                self.send(&reply).await;
                self.liveness.on_job();
                self.session.flush_if_due();
            }
        }
    }

    async fn send(&mut self, frames: &[Frame]) {
        match self.link.as_mut() {
            Some(link) => {
                if let Err(e) = link.send(frames).await {
                    warn!("reply not sent: {}", e);
                }
            }
            None => warn!("no connection, reply dropped"),
        }
    }

    fn close_run(&mut self) {
        if let Err(e) = self.session.end_run() {
            error!("could not close run: {}", e);
        }
    }
}
