//! Storage I/O attribution engine.
//!
//! Kernel probe events flow through the [`tracer`] layer into the event
//! correlator, the [`monitor`] turns completed operations into per-entity
//! snapshots on a timer, and the [`analyzer`] keeps bounded history and
//! derives bottleneck, anomaly and trend results from it.

pub mod agent;
pub mod analyzer;
pub mod config;
pub mod directory;
pub mod export;
pub mod monitor;
pub mod tracer;
