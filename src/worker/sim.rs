use std::f32::consts::TAU;

use thiserror::Error;

use crate::net::wire::{DetectorInfo, Hits, PhotonBatch};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("simulation failed: {0}")]
pub struct SimulationFailure(pub String);

/// The photon transport backend. Implementations own whatever device state
/// they need; a worker holds exactly one and never shares it.
pub trait Simulation {
    /// Propagates one batch of photons. A call may complete zero or more
    /// events; a synchronous request expects exactly one.
    fn simulate(
        &mut self,
        photons: &PhotonBatch,
    ) -> Result<Vec<Hits>, SimulationFailure>;

    /// Static geometry of the detector being simulated.
    fn detector(&self) -> &DetectorInfo;
}

/// Exercises the dispatch path without a transport backend: every photon is
/// detected, on channel `index % channels`, with its own direction,
/// polarization, wavelength, time and flags.
pub struct Loopback {
    detector: DetectorInfo,
}

impl Loopback {
    pub const RADIUS: f32 = 1000.0;

    /// A detector of `channels` type-0 channels spaced evenly on a ring.
    pub fn new(channels: usize) -> Self {
        let angle = |i: usize| TAU * i as f32 / channels as f32;
        let ring = |f: fn(f32) -> f32| -> Vec<f32> {
            (0..channels).map(|i| Self::RADIUS * f(angle(i))).collect()
        };
        Loopback {
            detector: DetectorInfo {
                x: ring(f32::cos),
                y: ring(f32::sin),
                z: vec![0.0; channels],
                channel_type: vec![0; channels],
            },
        }
    }
}

impl Simulation for Loopback {
    fn simulate(
        &mut self,
        photons: &PhotonBatch,
    ) -> Result<Vec<Hits>, SimulationFailure> {
        let channels = self.detector.channels();
        if channels == 0 {
            return Err(SimulationFailure("detector has no channels".into()));
        }
        Ok(vec![Hits {
            channel: (0..photons.len())
                .map(|i| (i % channels) as u32)
                .collect(),
            dir: photons.dir.clone(),
            pol: photons.pol.clone(),
            wavelength: photons.wavelength.clone(),
            time: photons.time.clone(),
            flags: photons.flags.clone(),
        }])
    }

    fn detector(&self) -> &DetectorInfo {
        &self.detector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::wire::tests::batch;

    #[test]
    fn loopback_detects_every_photon() {
        let mut sim = Loopback::new(4);
        let photons = batch(9, 6);
        let events = sim.simulate(&photons).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].channel, vec![0, 1, 2, 3, 0, 1]);
        assert_eq!(events[0].time, photons.time);
        assert!(events[0].check().is_ok());
    }

    #[test]
    fn loopback_ring_geometry() {
        let sim = Loopback::new(4);
        let info = sim.detector();
        assert_eq!(info.channels(), 4);
        assert!((info.x[0] - Loopback::RADIUS).abs() < 1e-3);
        assert!((info.y[1] - Loopback::RADIUS).abs() < 1e-3);
    }

    #[test]
    fn empty_detector_fails() {
        let mut sim = Loopback::new(0);
        assert!(sim.simulate(&batch(1, 1)).is_err());
    }
}
