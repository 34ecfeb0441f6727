//! Connection accounting collector.
//!
//! An event source reports per-flow packet and byte counters. The
//! [`probe::Probe`] fans every event out to independent consumers, each of
//! which feeds a [`sink::Sink`] that batches events and delivers them to a
//! time-series backend.

pub mod agent;
pub mod config;
pub mod export;
pub mod probe;
pub mod sink;
pub mod source;
