#![forbid(unsafe_code)]
//! The Adapter Pool (§4.7) and the Dispatcher request pipeline (§4.8) —
//! the two pieces that actually talk a gateway request into a backend
//! exchange and back. Everything upstream of this crate (auth, rate
//! limiting, load balancing, backpressure, the Observation Store) is
//! composed here rather than reimplemented.

mod dispatcher;
mod lifecycle;
mod pool;

pub use dispatcher::{DispatchRequest, Dispatcher, DispatcherConfig};
pub use lifecycle::InstanceLifecycle;
pub use pool::{AdapterPool, AdapterPoolConfig};
