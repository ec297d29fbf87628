// Conveyor - multi-queue background task processor
//
// Clients submit heterogeneous jobs over a small HTTP control surface; the
// kernel stores them durably, schedules them through an in-memory broker with
// per-type worker pools, retries failures with backoff, and records per-attempt
// history and aggregate metrics.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;

pub use config::*;
