use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_core::{FrameId, GatewayError, McpFrame, Template, TemplateAuth};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::adapter::TransportAdapter;

const SESSION_ID_HEADER: &str = "mcp-session-id";

type Pending = Arc<Mutex<HashMap<FrameId, oneshot::Sender<Result<McpFrame, GatewayError>>>>>;

struct Shared {
    connected: AtomicBool,
    pending: Pending,
    inbound_tx: mpsc::UnboundedSender<McpFrame>,
}

/// Streamable-HTTP MCP: requests are POSTed like [`crate::HttpAdapter`], but
/// the response may itself be an `text/event-stream`, and a persistent
/// background GET opens a second SSE stream for server-initiated
/// notifications. Directly grounded on the pack's `stencila` streamable
/// HTTP transport: manual byte-level SSE line parsing (so a multi-byte
/// UTF-8 sequence split across two network reads is never corrupted) and
/// an `Mcp-Session-Id` header the server may assign on first response and
/// the client must echo back on every subsequent request.
pub struct HttpStreamAdapter {
    instance_id: String,
    base_url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    session_id: Arc<RwLock<Option<String>>>,
    shared: Arc<Shared>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<McpFrame>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl HttpStreamAdapter {
    pub fn new(instance_id: String, template: &Template) -> Result<Self, GatewayError> {
        let base_url = template
            .base_url
            .clone()
            .ok_or_else(|| GatewayError::Internal("http-stream template missing baseUrl".into()))?;

        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::ConnectError {
                instance_id: instance_id.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            instance_id,
            base_url,
            headers: auth_headers(template.auth.as_ref()),
            client,
            session_id: Arc::new(RwLock::new(None)),
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                pending: Arc::new(Mutex::new(HashMap::new())),
                inbound_tx,
            }),
            inbound_rx: Mutex::new(inbound_rx),
            listener: Mutex::new(None),
        })
    }

    async fn post_builder(&self, body: Vec<u8>) -> reqwest::RequestBuilder {
        let mut request = self
            .client
            .post(&self.base_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .body(body);
        if let Some(sid) = self.session_id.read().await.clone() {
            request = request.header(SESSION_ID_HEADER, sid);
        }
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        request
    }

    async fn capture_session_id(&self, response: &reqwest::Response) {
        if let Some(sid) = response.headers().get(SESSION_ID_HEADER).and_then(|v| v.to_str().ok()) {
            *self.session_id.write().await = Some(sid.to_string());
        }
    }

    async fn spawn_listener(&self) {
        let url = self.base_url.clone();
        let client = self.client.clone();
        let headers = self.headers.clone();
        let session_id = Arc::clone(&self.session_id);
        let shared = Arc::clone(&self.shared);
        let instance_id = self.instance_id.clone();

        let handle = tokio::spawn(async move {
            loop {
                if !shared.connected.load(Ordering::Acquire) {
                    break;
                }

                let mut request = client.get(&url).header("Accept", "text/event-stream");
                if let Some(sid) = session_id.read().await.clone() {
                    request = request.header(SESSION_ID_HEADER, sid);
                }
                for (key, value) in &headers {
                    request = request.header(key.as_str(), value.as_str());
                }

                match request.send().await {
                    Ok(response) if response.status().is_success() => {
                        read_sse_stream(response, &shared).await;
                    }
                    Ok(response) if response.status() == reqwest::StatusCode::METHOD_NOT_ALLOWED => {
                        debug!(instance_id = %instance_id, "backend does not support GET SSE notifications");
                        break;
                    }
                    Ok(response) => {
                        debug!(instance_id = %instance_id, status = %response.status(), "SSE listener got non-success status");
                    }
                    Err(err) => {
                        debug!(instance_id = %instance_id, "SSE listener connection failed: {err}");
                    }
                }

                if !shared.connected.load(Ordering::Acquire) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        });

        *self.listener.lock().await = Some(handle);
    }
}

fn auth_headers(auth: Option<&TemplateAuth>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    match auth {
        Some(TemplateAuth::Bearer { token }) => {
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
        }
        Some(TemplateAuth::ApiKey { header, value }) => {
            headers.insert(header.clone(), value.clone());
        }
        Some(TemplateAuth::None) | None => {}
    }
    headers
}

/// Reads an SSE response body byte by byte, decoding only complete lines so
/// a multi-byte UTF-8 sequence split across two chunks is never corrupted,
/// and dispatches each complete `data:` event as a JSON-RPC frame.
async fn read_sse_stream(response: reqwest::Response, shared: &Shared) {
    let mut data_buf = String::new();
    let mut line_bytes: Vec<u8> = Vec::new();
    let mut response = response;

    while let Ok(Some(chunk)) = response.chunk().await {
        for &byte in chunk.as_ref() {
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&line_bytes).into_owned();
                let line = line.trim_end_matches('\r').to_string();
                process_sse_line(&line, &mut data_buf, shared).await;
                line_bytes.clear();
            } else {
                line_bytes.push(byte);
            }
        }
    }

    if !data_buf.is_empty() {
        dispatch_sse_data(&data_buf, shared).await;
    }
}

async fn process_sse_line(line: &str, data_buf: &mut String, shared: &Shared) {
    if let Some(rest) = line.strip_prefix("data:") {
        let data = rest.strip_prefix(' ').unwrap_or(rest);
        if !data_buf.is_empty() {
            data_buf.push('\n');
        }
        data_buf.push_str(data);
    } else if line.is_empty() && !data_buf.is_empty() {
        dispatch_sse_data(data_buf, shared).await;
        data_buf.clear();
    }
}

async fn dispatch_sse_data(data: &str, shared: &Shared) {
    let Ok(frame) = serde_json::from_str::<McpFrame>(data) else {
        debug!("ignoring unparseable SSE data");
        return;
    };
    dispatch(frame, &shared.pending, &shared.inbound_tx).await;
}

async fn dispatch(frame: McpFrame, pending: &Pending, inbound_tx: &mpsc::UnboundedSender<McpFrame>) {
    if frame.is_response() {
        if let Some(id) = frame.id.clone() {
            if let Some(tx) = pending.lock().await.remove(&id) {
                let _ = tx.send(Ok(frame));
                return;
            }
        }
    }
    let _ = inbound_tx.send(frame);
}

#[async_trait]
impl TransportAdapter for HttpStreamAdapter {
    async fn connect(&self) -> Result<(), GatewayError> {
        if self.shared.connected.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.spawn_listener().await;
        Ok(())
    }

    async fn send(&self, frame: McpFrame) -> Result<(), GatewayError> {
        if !self.shared.connected.load(Ordering::Acquire) {
            return Err(GatewayError::ConnectError {
                instance_id: self.instance_id.clone(),
                reason: "not connected".into(),
            });
        }

        let body = serde_json::to_vec(&frame)
            .map_err(|e| GatewayError::ProtocolError { reason: e.to_string() })?;
        let request = self.post_builder(body).await;

        let response = request.send().await.map_err(|e| GatewayError::ConnectError {
            instance_id: self.instance_id.clone(),
            reason: e.to_string(),
        })?;

        if !response.status().is_success() {
            return Err(GatewayError::ConnectError {
                instance_id: self.instance_id.clone(),
                reason: format!("http {}", response.status()),
            });
        }
        self.capture_session_id(&response).await;

        let content_type = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if content_type.contains("text/event-stream") {
            let shared = Arc::clone(&self.shared);
            tokio::spawn(async move {
                read_sse_stream(response, &shared).await;
            });
            return Ok(());
        }

        let body_text = response.text().await.map_err(|e| GatewayError::ProtocolError {
            reason: format!("failed to read response body: {e}"),
        })?;
        let reply: McpFrame = serde_json::from_str(&body_text).map_err(|e| GatewayError::ProtocolError {
            reason: format!("invalid JSON-RPC response: {e}"),
        })?;
        dispatch(reply, &self.shared.pending, &self.shared.inbound_tx).await;
        Ok(())
    }

    async fn receive(&self) -> Result<McpFrame, GatewayError> {
        let mut rx = self.inbound_rx.lock().await;
        rx.recv().await.ok_or_else(|| GatewayError::ConnectError {
            instance_id: self.instance_id.clone(),
            reason: "adapter disconnected".into(),
        })
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        self.shared.connected.store(false, Ordering::Release);
        if let Some(handle) = self.listener.lock().await.take() {
            handle.abort();
        }
        let mut pending = self.shared.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(GatewayError::ConnectError {
                instance_id: self.instance_id.clone(),
                reason: "adapter disconnected".into(),
            }));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    async fn send_and_receive(
        &self,
        frame: McpFrame,
        timeout: Duration,
    ) -> Result<McpFrame, GatewayError> {
        let id = frame.id.clone().ok_or_else(|| GatewayError::ProtocolError {
            reason: "send_and_receive requires a frame with an id".into(),
        })?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().await.insert(id.clone(), tx);

        if let Err(err) = self.send(frame).await {
            self.shared.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ConnectError {
                instance_id: self.instance_id.clone(),
                reason: "adapter closed while awaiting response".into(),
            }),
            Err(_) => {
                self.shared.pending.lock().await.remove(&id);
                Err(GatewayError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sse_line_parsing_handles_data_with_and_without_leading_space() {
        let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel();
        let shared = Shared {
            connected: AtomicBool::new(true),
            pending: Arc::new(Mutex::new(HashMap::new())),
            inbound_tx,
        };

        let mut data_buf = String::new();
        process_sse_line(
            r#"data: {"jsonrpc":"2.0","method":"notifications/tools/listChanged"}"#,
            &mut data_buf,
            &shared,
        )
        .await;
        process_sse_line("", &mut data_buf, &shared).await;

        let frame = inbound_rx.recv().await.unwrap();
        assert_eq!(frame.method.as_deref(), Some("notifications/tools/listChanged"));
    }

    #[tokio::test]
    async fn sse_dispatch_resolves_a_pending_request_by_id() {
        let (inbound_tx, _rx) = mpsc::unbounded_channel();
        let pending = Arc::new(Mutex::new(HashMap::new()));
        let shared = Shared {
            connected: AtomicBool::new(true),
            pending: Arc::clone(&pending),
            inbound_tx,
        };

        let (tx, rx) = oneshot::channel();
        pending.lock().await.insert(FrameId::Number(7), tx);

        dispatch_sse_data(
            r#"{"jsonrpc":"2.0","id":7,"result":{"ok":true}}"#,
            &shared,
        )
        .await;

        let response = rx.await.unwrap().unwrap();
        assert_eq!(response.id, Some(FrameId::Number(7)));
    }
}
