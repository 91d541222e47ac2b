use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_core::{FrameId, GatewayError, McpFrame, Template, TemplateAuth};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::adapter::TransportAdapter;

type Pending = Arc<Mutex<HashMap<FrameId, oneshot::Sender<Result<McpFrame, GatewayError>>>>>;

/// Plain request/response MCP over HTTP: one POST per frame, the response
/// body is the JSON-RPC reply (§4.2 "http transport"). No persistent
/// connection — `connect`/`disconnect` only flip a readiness flag and
/// build/drop the `reqwest::Client`.
pub struct HttpAdapter {
    instance_id: String,
    base_url: String,
    headers: HashMap<String, String>,
    client: reqwest::Client,
    pending: Pending,
    inbound_tx: mpsc::UnboundedSender<McpFrame>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<McpFrame>>,
    connected: AtomicBool,
}

impl HttpAdapter {
    pub fn new(instance_id: String, template: &Template) -> Result<Self, GatewayError> {
        let base_url = template
            .base_url
            .clone()
            .ok_or_else(|| GatewayError::Internal("http template missing baseUrl".into()))?;

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
            pending: Arc::new(Mutex::new(HashMap::new())),
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            connected: AtomicBool::new(false),
        })
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

#[async_trait]
impl TransportAdapter for HttpAdapter {
    async fn connect(&self) -> Result<(), GatewayError> {
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    async fn send(&self, frame: McpFrame) -> Result<(), GatewayError> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(GatewayError::ConnectError {
                instance_id: self.instance_id.clone(),
                reason: "not connected".into(),
            });
        }

        let client = self.client.clone();
        let url = self.base_url.clone();
        let headers = self.headers.clone();
        let pending = Arc::clone(&self.pending);
        let inbound_tx = self.inbound_tx.clone();
        let instance_id = self.instance_id.clone();
        let id = frame.id.clone();

        tokio::spawn(async move {
            let mut request = client.post(&url).json(&frame);
            for (key, value) in &headers {
                request = request.header(key, value);
            }

            let outcome = match request.send().await {
                Ok(response) if response.status().is_success() => {
                    response.json::<McpFrame>().await.map_err(|e| GatewayError::ProtocolError {
                        reason: format!("invalid JSON-RPC response body: {e}"),
                    })
                }
                Ok(response) => Err(GatewayError::ConnectError {
                    instance_id: instance_id.clone(),
                    reason: format!("http {}", response.status()),
                }),
                Err(e) => Err(GatewayError::ConnectError {
                    instance_id: instance_id.clone(),
                    reason: e.to_string(),
                }),
            };

            match (id, outcome) {
                (Some(id), result) => {
                    if let Some(tx) = pending.lock().await.remove(&id) {
                        let _ = tx.send(result);
                    }
                }
                (None, Ok(frame)) => {
                    let _ = inbound_tx.send(frame);
                }
                (None, Err(_)) => {}
            }
        });

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
        self.connected.store(false, Ordering::Release);
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(GatewayError::ConnectError {
                instance_id: self.instance_id.clone(),
                reason: "adapter disconnected".into(),
            }));
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
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
        self.pending.lock().await.insert(id.clone(), tx);

        if let Err(err) = self.send(frame).await {
            self.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(GatewayError::ConnectError {
                instance_id: self.instance_id.clone(),
                reason: "adapter closed while awaiting response".into(),
            }),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(GatewayError::Timeout(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateway_core::TransportKind;
    use std::collections::BTreeMap;

    fn http_template(base_url: &str) -> Template {
        Template {
            name: "svc-http".to_string(),
            version: "1.0.0".to_string(),
            transport: TransportKind::Http,
            command: None,
            args: vec![],
            env: BTreeMap::new(),
            base_url: Some(base_url.to_string()),
            auth: Some(TemplateAuth::Bearer { token: "t".to_string() }),
            timeout_ms: Template::default_timeout_ms(),
            retries: 0,
            trust_level: None,
        }
    }

    #[test]
    fn bearer_auth_becomes_an_authorization_header() {
        let headers = auth_headers(Some(&TemplateAuth::Bearer { token: "abc".to_string() }));
        assert_eq!(headers.get("Authorization").map(String::as_str), Some("Bearer abc"));
    }

    #[test]
    fn api_key_auth_uses_the_configured_header_name() {
        let headers = auth_headers(Some(&TemplateAuth::ApiKey {
            header: "X-Api-Key".to_string(),
            value: "secret".to_string(),
        }));
        assert_eq!(headers.get("X-Api-Key").map(String::as_str), Some("secret"));
    }

    #[tokio::test]
    async fn send_and_receive_against_an_unreachable_host_fails_fast() {
        let adapter = HttpAdapter::new("inst-1".to_string(), &http_template("http://127.0.0.1:1")).unwrap();
        adapter.connect().await.unwrap();

        let request = McpFrame::request(FrameId::Number(1), "tools/list", serde_json::json!({}));
        let result = adapter.send_and_receive(request, Duration::from_secs(3)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn disconnected_adapter_rejects_send() {
        let adapter = HttpAdapter::new("inst-1".to_string(), &http_template("http://127.0.0.1:1")).unwrap();
        let request = McpFrame::request(FrameId::Number(1), "tools/list", serde_json::json!({}));
        let result = adapter.send(request).await;
        assert!(matches!(result, Err(GatewayError::ConnectError { .. })));
    }
}
