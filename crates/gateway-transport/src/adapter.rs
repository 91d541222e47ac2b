use std::time::Duration;

use async_trait::async_trait;
use gateway_core::{GatewayError, McpFrame};

/// The uniform contract every backend transport implements (§4.2). The
/// dispatcher and adapter pool only ever see this trait — never the
/// concrete subprocess/HTTP/HTTP-stream type — so adding a fourth
/// transport kind never touches pooling or dispatch logic.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Establishes the underlying connection (spawns the subprocess, builds
    /// the HTTP client, opens the SSE stream). Calling `connect` on an
    /// already-connected adapter is a no-op.
    async fn connect(&self) -> Result<(), GatewayError>;

    /// Writes one frame without waiting for a reply. Used for
    /// notifications and as the first half of `send_and_receive`.
    async fn send(&self, frame: McpFrame) -> Result<(), GatewayError>;

    /// Waits for the next frame this adapter did not already deliver to a
    /// pending `send_and_receive` caller — i.e. a backend-initiated
    /// notification or an orphaned response.
    async fn receive(&self) -> Result<McpFrame, GatewayError>;

    /// Tears down the connection: kills the subprocess, drops the HTTP
    /// client, cancels the SSE listener. Safe to call more than once.
    async fn disconnect(&self) -> Result<(), GatewayError>;

    fn is_connected(&self) -> bool;

    /// Sends a request frame (which must carry an id) and waits for the
    /// correlated response, failing with `GatewayError::Timeout` if none
    /// arrives in time.
    async fn send_and_receive(
        &self,
        frame: McpFrame,
        timeout: Duration,
    ) -> Result<McpFrame, GatewayError>;

    /// Resolves once, when the adapter's underlying connection ends on its
    /// own initiative rather than through `disconnect()` — a backend
    /// process crashing out from under a subprocess transport (§4.2,
    /// §4.3 "lifecycle:exit"). Carries the process exit code when the OS
    /// reported one. Transports with no process to watch (HTTP-based
    /// adapters) never resolve it; `disconnect()` always cancels whatever
    /// is awaiting this call.
    async fn wait_for_exit(&self) -> Option<i32> {
        std::future::pending().await
    }
}
