//! encodeforge: distributed adaptive-bitrate transcoding.
//!
//! The library half of the binary: component wiring and the local worker
//! node. The heavy lifting lives in the `ef-*` crates.

pub mod engine;
pub mod worker;

pub use engine::Engine;
pub use worker::{NodeWorker, WorkerPools, WorkerSummary};
