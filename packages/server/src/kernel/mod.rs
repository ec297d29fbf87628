//! Kernel - the scheduling and lifecycle core.
//!
//! Everything under here is HTTP-agnostic: the durable store, the in-memory
//! broker, the dispatcher with its per-queue worker pools, the retry engine,
//! and the handler registry. The `server` module is a thin adapter over these.

pub mod handlers;
pub mod jobs;
