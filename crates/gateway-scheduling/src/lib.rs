#![forbid(unsafe_code)]
//! Instance selection and flow control: the Load Balancer (§4.5), the
//! Backpressure Controller (§4.6), and the Health Prober (§4.4). None of
//! these talk to a transport directly — the prober is generic over an
//! [`AdapterProvider`] so the concrete Adapter Pool (`gateway-dispatch`)
//! can stay downstream of this crate instead of the other way around.

mod backpressure;
mod balancer;
mod health;

pub use backpressure::{BackpressureConfig, BackpressureController, BreakerState, Lease};
pub use balancer::{LoadBalancer, Strategy};
pub use health::{AdapterProvider, HealthProber, HealthProberConfig};
