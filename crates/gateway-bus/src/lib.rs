#![forbid(unsafe_code)]
//! The Event Bus: a bounded, deduplicating publish/subscribe fan-out used to
//! distribute lifecycle and log events to internal components and, via
//! `gateway-http`, to `/api/logs/stream` clients (§4.10).
//!
//! Every subscriber gets its own bounded queue and its own background task,
//! so a slow or panicking subscriber cannot stall delivery to any other —
//! the same isolation the teacher's `broadcast_codex_event` gets from
//! pruning dead channels, generalized here to bounded queues plus an
//! explicit per-handler timeout.

mod bus;
mod dedup;
mod envelope;

pub use bus::{EventBus, EventBusConfig, Subscription};
pub use envelope::EventEnvelope;
