use std::{mem, path::Path};

use tracing::{debug, error, info, warn};

use super::{
    sim::Simulation,
    sink::{schema, EventBatch, RunSink, Storage},
};
use crate::{
    config::{Config, DeliveryMode},
    net::{
        error::Error,
        wire::{Hits, PhotonBatch, Request, Response},
        Frame,
    },
};

/// Suffixes stripped from a RUN_BEGIN name before [`OUTPUT_SUFFIX`] is added.
pub const KNOWN_SUFFIXES: [&str; 4] = [".root", ".hdf5", ".h5", ".hits"];
pub const OUTPUT_SUFFIX: &str = ".hits";

/// Run file name for a RUN_BEGIN name: the file name component with a known
/// suffix swapped for [`OUTPUT_SUFFIX`].
pub fn output_name(requested: &str) -> String {
    let base = Path::new(requested)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("");
    let stem = KNOWN_SUFFIXES
        .iter()
        .find_map(|suffix| base.strip_suffix(suffix))
        .unwrap_or(base);
    let stem = if stem.is_empty() { "run" } else { stem };
    format!("{}{}", stem, OUTPUT_SUFFIX)
}

/// A worker's request state. In async mode PHOTONDATA is acknowledged
/// immediately and queued; the queue is simulated and written out as one
/// batch once `flush_threshold` requests have accumulated, or at RUN_END.
pub struct Session<S: Simulation, T: Storage> {
    mode: DeliveryMode,
    simulation: S,
    storage: T,
    run: Option<T::Sink>,
    pending: Vec<PhotonBatch>,
    buffer: EventBatch,
    fill: usize,
    flush_threshold: usize,
}

impl<S: Simulation, T: Storage> Session<S, T> {
    pub fn new(
        mode: DeliveryMode,
        simulation: S,
        storage: T,
        flush_threshold: usize,
    ) -> Self {
        let flush_threshold = flush_threshold.max(1);
        Session {
            mode,
            simulation,
            storage,
            run: None,
            pending: Vec::with_capacity(flush_threshold),
            buffer: EventBatch::default(),
            fill: 0,
            flush_threshold,
        }
    }

    pub fn from_config(config: &Config, simulation: S, storage: T) -> Self {
        Self::new(config.mode, simulation, storage, config.flush_threshold)
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// PHOTONDATA requests queued since the last flush.
    pub fn fill(&self) -> usize {
        self.fill
    }

    pub fn is_run_open(&self) -> bool {
        self.run.is_some()
    }

    pub fn flush_due(&self) -> bool {
        self.fill >= self.flush_threshold
    }

    /// Decodes and answers a request body. Malformed bodies never reach the
    /// simulation and are answered with UNKNOWN_REQUEST.
    pub fn respond(&mut self, body: &[Frame]) -> Response {
        match Request::decode(body) {
            Ok(request) => self.handle(request),
            Err(e) => {
                warn!("rejecting request: {}", e);
                Response::UnknownRequest
            }
        }
    }

    pub fn handle(&mut self, request: Request) -> Response {
        match request {
            Request::Ping => Response::Ack,
            Request::DetectorInfo => {
                Response::DetectorInfo(self.simulation.detector().clone())
            }
            Request::PhotonData(photons) => match self.mode {
                DeliveryMode::Sync => self.simulate_now(photons),
                DeliveryMode::Async => self.enqueue(photons),
            },
            Request::RunBegin { name } => match self.mode {
                DeliveryMode::Sync => {
                    debug!(%name, "RUN_BEGIN in sync mode, nothing to open");
                    Response::Ack
                }
                DeliveryMode::Async => match self.begin_run(&name) {
                    Ok(()) => Response::Ack,
                    Err(e) => {
                        error!(%name, "could not open run: {}", e);
                        Response::SimFailed { event_id: None }
                    }
                },
            },
            Request::RunEnd => match self.end_run() {
                Ok(_) => Response::Ack,
                Err(e) => {
                    error!("could not finish run: {}", e);
                    Response::SimFailed { event_id: None }
                }
            },
            Request::Unknown(tag) => {
                warn!(tag = %String::from_utf8_lossy(&tag), "unknown request");
                Response::UnknownRequest
            }
        }
    }

    fn simulate_now(&mut self, photons: PhotonBatch) -> Response {
        let event_id = photons.event_id;
        let failed = Response::SimFailed {
            event_id: Some(event_id),
        };
        match self.simulation.simulate(&photons) {
            Ok(mut events) if events.len() == 1 => {
                let hits = events.remove(0);
                if let Err(e) = hits.check() {
                    warn!(event_id, "simulation returned ragged hits: {}", e);
                    return failed;
                }
                debug!(
                    event_id,
                    photons = photons.len(),
                    hits = hits.len(),
                    "simulated event"
                );
                Response::SimComplete { event_id, hits }
            }
            Ok(events) => {
                warn!(event_id, "expected one event, got {}", events.len());
                failed
            }
            Err(e) => {
                warn!(event_id, "{}", e);
                failed
            }
        }
    }

    fn enqueue(&mut self, photons: PhotonBatch) -> Response {
        let event_id = photons.event_id;
        if self.run.is_none() {
            warn!(event_id, "PHOTONDATA before RUN_BEGIN, no run to write to");
            return Response::SimFailed {
                event_id: Some(event_id),
            };
        }
        self.pending.push(photons);
        self.fill += 1;
        Response::SimCompleteAsync { event_id }
    }

    fn begin_run(&mut self, name: &str) -> Result<(), Error> {
        if self.run.is_some() {
            warn!("RUN_BEGIN while a run is open, closing it first");
            self.end_run()?;
        }
        let file_name = output_name(name);
        let mut run = self.storage.create(&file_name)?;
        run.write_detector_info(self.simulation.detector())?;
        run.declare_schema(&schema())?;
        self.buffer.clear();
        self.pending.clear();
        self.fill = 0;
        self.run = Some(run);
        info!(run = %file_name, "run started");
        Ok(())
    }

    /// Flushes what is left and closes the run. Ending with no open run does
    /// nothing and returns `Ok(false)`.
    pub fn end_run(&mut self) -> Result<bool, Error> {
        if self.run.is_none() {
            debug!("RUN_END with no open run");
            return Ok(false);
        }
        let flushed = if self.fill > 0 { self.flush() } else { Ok(()) };
        let closed = match self.run.take() {
            Some(run) => run.close(),
            None => Ok(()),
        };
        flushed.and(closed)?;
        info!("run finished");
        Ok(true)
    }

    /// Runs the flush marked due by the last PHOTONDATA, if any. Errors are
    /// logged; the acknowledgments have already gone out.
    pub fn flush_if_due(&mut self) -> bool {
        if !self.flush_due() {
            return false;
        }
        if let Err(e) = self.flush() {
            error!("flush failed: {}", e);
        }
        true
    }

    /// Simulates every queued request and writes the results as one batch.
    /// A request whose simulation fails contributes no events. The buffer
    /// and the queue are reset even if the write fails.
    pub fn flush(&mut self) -> Result<(), Error> {
        let pending = mem::replace(
            &mut self.pending,
            Vec::with_capacity(self.flush_threshold),
        );
        for photons in &pending {
            match self.simulation.simulate(photons) {
                Ok(events) => {
                    for hits in events {
                        let event_id = photons.event_id;
                        Self::buffer_event(&mut self.buffer, event_id, hits);
                    }
                }
                Err(e) => {
                    warn!(event_id = photons.event_id, "dropping event: {}", e)
                }
            }
        }
        let buffer = mem::take(&mut self.buffer);
        self.fill = 0;

        let run = self.run.as_mut().ok_or(Error::NoOpenRun)?;
        run.write_batch(&buffer)?;
        debug!(
            requests = pending.len(),
            events = buffer.len(),
            "flushed batch"
        );
        Ok(())
    }

    fn buffer_event(buffer: &mut EventBatch, event_id: u32, hits: Hits) {
        match hits.check() {
            Ok(()) => buffer.push(event_id, hits),
            Err(e) => warn!(event_id, "dropping ragged event: {}", e),
        }
    }
}
