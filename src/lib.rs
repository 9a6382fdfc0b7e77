//! Dispatches photon simulation jobs from clients to a pool of workers.
//!
//! Clients talk to a [`broker::Broker`], which hands each request to the
//! least recently ready worker and relays the reply. Workers run a
//! [`worker::WorkerAgent`] that heartbeats with the broker, reconnects when
//! it goes quiet, and answers requests through a [`worker::session::Session`].

pub mod config;
pub mod net;

#[cfg(feature = "broker")]
pub mod broker;
#[cfg(feature = "worker")]
pub mod worker;
