#![forbid(unsafe_code)]
//! Shared domain types for the MCP gateway: templates, instances, health and
//! load snapshots, the MCP wire frame, the stable error taxonomy, and the
//! environment-derived runtime configuration.
//!
//! Nothing in this crate talks to a process, a socket, or the filesystem —
//! it is the vocabulary every other gateway crate shares.

mod config;
mod error;
mod frame;
mod model;

pub use config::{AuthMode, GatewayConfig};
pub use error::GatewayError;
pub use frame::{is_idempotent_read, FrameId, FrameIdGenerator, McpError, McpFrame};
pub use model::{
    now_millis, HealthSnapshot, Instance, InstanceState, LoadMetric, Template, TemplateAuth,
    TransportKind,
};
