use std::{future::Future, net::SocketAddr};

use tokio::{
    select,
    time::{sleep, Duration, Instant},
};
use tracing::{debug, info, trace, warn};

use crate::{
    config::Config,
    net::{
        endpoint::Router,
        error::Error,
        wire::{classify, Envelope, MessageKind, Response},
        Address, Frames,
    },
};

pub mod registry;

use registry::WorkerRegistry;

/// Routes client requests to the least recently ready worker and relays the
/// replies. Runs on a single task; the wait at the top of the loop never
/// exceeds one heartbeat interval, so heartbeats and purges keep running
/// without traffic. Requests handed to a worker that dies are lost.
pub struct Broker {
    frontend: Router,
    backend: Router,
    workers: WorkerRegistry,
    heartbeat_interval: Duration,
    heartbeat_at: Instant,
}

impl Broker {
    /// Binds the client-facing and worker-facing listeners.
    pub async fn bind(config: &Config) -> Result<Self, Error> {
        let frontend = Router::bind(config.frontend_addr).await?;
        let backend = Router::bind(config.backend_addr).await?;
        info!(
            frontend = %frontend.local_addr(),
            backend = %backend.local_addr(),
            "broker listening"
        );
        Ok(Broker {
            frontend,
            backend,
            workers: WorkerRegistry::new(config.liveness_window()),
            heartbeat_interval: config.heartbeat_interval,
            heartbeat_at: Instant::now() + config.heartbeat_interval,
        })
    }

    pub fn frontend_addr(&self) -> SocketAddr {
        self.frontend.local_addr()
    }

    pub fn backend_addr(&self) -> SocketAddr {
        self.backend.local_addr()
    }

    /// Runs until interrupted with Ctrl-C.
    pub async fn run(self) -> Result<(), Error> {
        self.run_until(tokio::signal::ctrl_c()).await
    }

    /// Runs until `shutdown` completes, then closes both channels without
    /// draining.
    pub async fn run_until<F: Future>(
        mut self,
        shutdown: F,
    ) -> Result<(), Error> {
        tokio::pin!(shutdown);
        loop {
            trace!(workers = self.workers.len(), "waiting for activity");
            select! {
                _ = &mut shutdown => {
                    warn!("interrupted, shutting down without draining");
                    break;
                }
                Some(frames) = self.backend.recv() => {
                    self.handle_backend(frames).await
                }
                Some(frames) = self.frontend.recv() => {
                    self.handle_frontend(frames).await
                }
                _ = sleep(self.heartbeat_interval) => {}
            }

            if Instant::now() >= self.heartbeat_at {
                self.send_heartbeats().await;
                self.heartbeat_at = Instant::now() + self.heartbeat_interval;
            }
            self.workers.purge();
        }
        Ok(())
    }

    /// Worker traffic: `[worker, ..msg]`. Any contact refreshes the worker;
    /// single frames are control messages, longer messages are replies for a
    /// client and carry its address up front.
    async fn handle_backend(&mut self, mut frames: Frames) {
        if frames.is_empty() {
            return;
        }
        let worker = Address::from(frames.remove(0));
        self.workers.ready(worker.clone());

        match frames.len() {
            0 => warn!(%worker, "empty message from worker"),
            1 if MessageKind::Ready.is(&frames[0]) => {
                info!(%worker, "worker is ready")
            }
            1 if MessageKind::Heartbeat.is(&frames[0]) => {
                trace!(%worker, "heartbeat")
            }
            1 => warn!(
                %worker,
                frame = %String::from_utf8_lossy(&frames[0]),
                "invalid message from worker"
            ),
            _ => {
                if !self.frontend.send(frames).await {
                    debug!(%worker, "client went away, dropping reply");
                }
            }
        }
    }

    /// Client traffic: `[client, "", kind, ..body]`.
    async fn handle_frontend(&mut self, frames: Frames) {
        let (client, is_ping) = match classify(&frames) {
            Envelope::Routed {
                return_address,
                body,
            } if !body.is_empty() => (
                Address::from(return_address),
                MessageKind::Ping.is(&body[0]),
            ),
            _ => {
                warn!(frames = frames.len(), "malformed client message");
                return;
            }
        };

        if is_ping {
            debug!(%client, "ping");
            self.reply(&frames, Response::Ack).await;
            return;
        }

        match self.workers.next() {
            Some(worker) => {
                debug!(
                    %client,
                    %worker,
                    kind = %String::from_utf8_lossy(&frames[2]),
                    "dispatching request"
                );
                let mut routed = Vec::with_capacity(frames.len() + 1);
                routed.push(worker.into_frame());
                routed.extend(frames);
                if !self.backend.send(routed).await {
                    warn!(%client, "worker gone before dispatch, request lost");
                }
            }
            None => {
                warn!(%client, "no workers available");
                self.reply(&frames, Response::NoWorkers).await;
            }
        }
    }

    async fn reply(&self, request: &Frames, response: Response) {
        let frames = classify(request).wrap(response.encode());
        self.frontend.send(frames).await;
    }

    async fn send_heartbeats(&self) {
        for worker in self.workers.addresses() {
            let heartbeat = vec![
                worker.as_bytes().to_vec(),
                MessageKind::Heartbeat.frame(),
            ];
            self.backend.send(heartbeat).await;
        }
    }
}
