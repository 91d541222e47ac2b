#![forbid(unsafe_code)]
//! Transport adapters: the uniform contract the rest of the gateway uses to
//! talk to a backend instance regardless of how that instance actually
//! speaks MCP (§4.2).
//!
//! `framing` holds the depth-aware JSON object splitter shared by the
//! subprocess and HTTP-stream adapters — the piece that lets either one
//! read a byte stream with no assumption that one JSON object equals one
//! line.

mod adapter;
mod framing;
mod http;
mod http_stream;
mod subprocess;

pub use adapter::TransportAdapter;
pub use framing::JsonObjectSplitter;
pub use http::HttpAdapter;
pub use http_stream::HttpStreamAdapter;
pub use subprocess::SubprocessAdapter;

/// Builds the adapter appropriate for a template's transport kind.
pub fn build_adapter(
    instance_id: impl Into<String>,
    template: &gateway_core::Template,
) -> Result<Box<dyn TransportAdapter>, gateway_core::GatewayError> {
    let instance_id = instance_id.into();
    match template.transport {
        gateway_core::TransportKind::Subprocess => {
            Ok(Box::new(SubprocessAdapter::new(instance_id, template)?))
        }
        gateway_core::TransportKind::Http => {
            Ok(Box::new(HttpAdapter::new(instance_id, template)?))
        }
        gateway_core::TransportKind::HttpStream => {
            Ok(Box::new(HttpStreamAdapter::new(instance_id, template)?))
        }
    }
}
