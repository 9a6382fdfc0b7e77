use std::{future::Future, net::SocketAddr};

use tokio::select;
use tracing::{debug, info, warn};

use super::{session::Session, sim::Simulation, sink::Storage};
use crate::net::{endpoint::Router, error::Error, wire::DELIMITER, Frames};

/// Serves clients that connect straight to the worker, one request at a
/// time, with no broker and no heartbeating.
pub struct DirectServer<S: Simulation, T: Storage> {
    router: Router,
    session: Session<S, T>,
}

impl<S: Simulation, T: Storage> DirectServer<S, T> {
    pub async fn bind(
        addr: SocketAddr,
        session: Session<S, T>,
    ) -> Result<Self, Error> {
        let router = Router::bind(addr).await?;
        info!(
            addr = %router.local_addr(),
            mode = ?session.mode(),
            "serving direct requests"
        );
        Ok(DirectServer { router, session })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.router.local_addr()
    }

    pub async fn run(self) -> Result<(), Error> {
        self.run_until(tokio::signal::ctrl_c()).await
    }

    pub async fn run_until<F: Future>(
        mut self,
        shutdown: F,
    ) -> Result<(), Error> {
        tokio::pin!(shutdown);
        loop {
            select! {
                _ = &mut shutdown => {
                    info!("interrupted, shutting down");
                    break;
                }
                Some(frames) = self.router.recv() => self.serve(frames).await,
            }
        }
        if let Err(e) = self.session.end_run() {
            warn!("could not close run: {}", e);
        }
        Ok(())
    }

    /// `[peer, "", body..]` in, `[peer, "", reply..]` out. The delimiter is
    /// optional on the way in. A flush made due by this request starts only
    /// once the reply is on the wire.
    async fn serve(&mut self, mut frames: Frames) {
        if frames.is_empty() {
            return;
        }
        let peer = frames.remove(0);
        let body = match frames.first() {
            Some(first) if first.is_empty() => &frames[1..],
            _ => &frames[..],
        };
        let response = self.session.respond(body);

        let mut reply = vec![peer, DELIMITER.to_vec()];
        reply.extend(response.encode());
        if !self.router.send_written(reply).await {
            debug!("peer went away, dropping reply");
        }
        self.session.flush_if_due();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{mpsc, Mutex},
        time::Duration,
    };

    use tokio::{sync::oneshot, time::timeout};

    use super::*;
    use crate::{
        config::DeliveryMode,
        net::{
            client::Client,
            wire::{
                tests::batch, DetectorInfo, Hits, PhotonBatch, Request,
                Response,
            },
        },
        worker::{
            sim::{Loopback, SimulationFailure},
            sink::{read_run, FileStorage},
        },
    };

    const WAIT: Duration = Duration::from_secs(5);

    /// Blocks inside `simulate` until released, like a long device call.
    struct Gated {
        release: Mutex<mpsc::Receiver<()>>,
        inner: Loopback,
    }

    impl Simulation for Gated {
        fn simulate(
            &mut self,
            photons: &PhotonBatch,
        ) -> Result<Vec<Hits>, SimulationFailure> {
            let release = self
                .release
                .lock()
                .map_err(|_| SimulationFailure("gate poisoned".into()))?;
            release
                .recv_timeout(Duration::from_secs(10))
                .map_err(|_| SimulationFailure("never released".into()))?;
            drop(release);
            self.inner.simulate(photons)
        }

        fn detector(&self) -> &DetectorInfo {
            self.inner.detector()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn async_ack_leaves_before_the_flush_runs() {
        let dir = tempfile::tempdir().unwrap();
        let (release_tx, release_rx) = mpsc::channel();
        let simulation = Gated {
            release: Mutex::new(release_rx),
            inner: Loopback::new(2),
        };
        let session = Session::new(
            DeliveryMode::Async,
            simulation,
            FileStorage::new(dir.path()),
            1,
        );
        let server = DirectServer::bind("127.0.0.1:0".parse().unwrap(), session)
            .await
            .unwrap();
        let addr = server.local_addr();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(server.run_until(stop_rx));

        let mut client =
            Client::connect(addr).await.unwrap().with_timeout(WAIT);
        let begin = Request::RunBegin { name: "gated".into() };
        assert_eq!(client.request(&begin).await.unwrap(), Response::Ack);

        // the flush this request triggers is held until the ack is in hand
        let photons = Request::PhotonData(batch(1, 3));
        assert_eq!(
            client.request(&photons).await.unwrap(),
            Response::SimCompleteAsync { event_id: 1 }
        );
        release_tx.send(()).unwrap();

        assert_eq!(
            client.request(&Request::RunEnd).await.unwrap(),
            Response::Ack
        );
        stop_tx.send(()).unwrap();
        timeout(WAIT, handle).await.unwrap().unwrap().unwrap();

        let run = read_run(&dir.path().join("gated.hits")).unwrap();
        assert_eq!(run.batches.len(), 1);
        assert_eq!(run.batches[0].event_id, vec![1]);
    }
}
