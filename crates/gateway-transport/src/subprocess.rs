use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use gateway_core::{FrameId, GatewayError, McpFrame, Template};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::adapter::TransportAdapter;
use crate::framing::JsonObjectSplitter;

type Pending = Arc<Mutex<HashMap<FrameId, oneshot::Sender<Result<McpFrame, GatewayError>>>>>;

struct State {
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Pending,
    inbound_tx: mpsc::UnboundedSender<McpFrame>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<McpFrame>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    connected: AtomicBool,
    /// `Some(code)` once the child has exited without us calling
    /// `disconnect()`; `None` until then. Written once by
    /// `exit_watch_task`, observed by `wait_for_exit`.
    exit: watch::Sender<Option<Option<i32>>>,
}

/// Speaks MCP over a backend's stdin/stdout, one JSON-RPC frame at a time
/// (§4.2 "subprocess transport"). Directly grounded on the teacher's
/// `JsonRpcTransport`: a writer task owns stdin, a reader task owns
/// stdout, and the child is killed on drop so a crashed gateway never
/// leaves an orphaned backend process behind.
pub struct SubprocessAdapter {
    instance_id: String,
    command: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    next_id: std::sync::atomic::AtomicU64,
    state: Arc<State>,
}

impl SubprocessAdapter {
    pub fn new(instance_id: String, template: &Template) -> Result<Self, GatewayError> {
        let command = template
            .command
            .clone()
            .ok_or_else(|| GatewayError::Internal("subprocess template missing command".into()))?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (exit, _) = watch::channel(None);
        Ok(Self {
            instance_id,
            command,
            args: template.args.clone(),
            env: template.env.clone(),
            next_id: std::sync::atomic::AtomicU64::new(1),
            state: Arc::new(State {
                writer: Mutex::new(None),
                pending: Arc::new(Mutex::new(HashMap::new())),
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                tasks: Mutex::new(Vec::new()),
                connected: AtomicBool::new(false),
                exit,
            }),
        })
    }

    pub fn next_id(&self) -> FrameId {
        FrameId::Number(self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl TransportAdapter for SubprocessAdapter {
    async fn connect(&self) -> Result<(), GatewayError> {
        if self.state.connected.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut command = Command::new(&self.command);
        command
            .args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut backoff = Duration::from_millis(2);
        let mut child = None;
        for attempt in 0..5 {
            match command.spawn() {
                Ok(spawned) => {
                    child = Some(spawned);
                    break;
                }
                Err(source) => {
                    let busy = matches!(source.kind(), std::io::ErrorKind::ExecutableFileBusy)
                        || source.raw_os_error() == Some(26);
                    if busy && attempt < 4 {
                        tokio::time::sleep(backoff).await;
                        backoff = std::cmp::min(backoff * 2, Duration::from_millis(50));
                        continue;
                    }
                    return Err(GatewayError::ConnectError {
                        instance_id: self.instance_id.clone(),
                        reason: format!("failed to spawn `{}`: {source}", self.command),
                    });
                }
            }
        }
        let mut child = child.expect("spawn loop returns or early-returns an error");

        let stdout = child.stdout.take().ok_or_else(|| GatewayError::ConnectError {
            instance_id: self.instance_id.clone(),
            reason: "child stdout unavailable".into(),
        })?;
        let stdin = child.stdin.take().ok_or_else(|| GatewayError::ConnectError {
            instance_id: self.instance_id.clone(),
            reason: "child stdin unavailable".into(),
        })?;
        let stderr = child.stderr.take();

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let writer_handle = tokio::spawn(writer_task(stdin, writer_rx));
        let reader_handle = tokio::spawn(reader_task(
            self.instance_id.clone(),
            stdout,
            Arc::clone(&self.state.pending),
            self.state.inbound_tx.clone(),
        ));
        let stderr_handle = stderr.map(|s| tokio::spawn(stderr_task(self.instance_id.clone(), s)));
        let exit_handle = tokio::spawn(exit_watch_task(
            self.instance_id.clone(),
            child,
            Arc::clone(&self.state),
        ));

        let mut tasks = vec![writer_handle, reader_handle, exit_handle];
        tasks.extend(stderr_handle);

        *self.state.writer.lock().await = Some(writer_tx);
        *self.state.tasks.lock().await = tasks;
        self.state.connected.store(true, Ordering::Release);

        Ok(())
    }

    async fn send(&self, frame: McpFrame) -> Result<(), GatewayError> {
        let text = serde_json::to_string(&frame)
            .map_err(|e| GatewayError::ProtocolError { reason: e.to_string() })?;
        let guard = self.state.writer.lock().await;
        match guard.as_ref() {
            Some(tx) => tx.send(text).map_err(|_| GatewayError::ConnectError {
                instance_id: self.instance_id.clone(),
                reason: "writer task has stopped".into(),
            }),
            None => Err(GatewayError::ConnectError {
                instance_id: self.instance_id.clone(),
                reason: "not connected".into(),
            }),
        }
    }

    async fn receive(&self) -> Result<McpFrame, GatewayError> {
        let mut rx = self.state.inbound_rx.lock().await;
        rx.recv().await.ok_or_else(|| GatewayError::ConnectError {
            instance_id: self.instance_id.clone(),
            reason: "adapter disconnected".into(),
        })
    }

    async fn disconnect(&self) -> Result<(), GatewayError> {
        self.state.connected.store(false, Ordering::Release);

        // Aborting `exit_watch_task` drops its owned `Child` mid-`.wait()`;
        // the command was spawned with `kill_on_drop(true)`, so the process
        // is killed and reaped without `wait_for_exit` ever reporting it as
        // an unexpected exit.
        for task in self.state.tasks.lock().await.drain(..) {
            task.abort();
        }
        *self.state.writer.lock().await = None;

        let mut pending = self.state.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(GatewayError::ConnectError {
                instance_id: self.instance_id.clone(),
                reason: "adapter disconnected".into(),
            }));
        }

        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Acquire)
    }

    async fn wait_for_exit(&self) -> Option<i32> {
        let mut rx = self.state.exit.subscribe();
        loop {
            if let Some(code) = *rx.borrow() {
                return code;
            }
            if rx.changed().await.is_err() {
                // Sender dropped without ever reporting an exit, which only
                // happens if this adapter itself is being torn down.
                return None;
            }
        }
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
        self.state.pending.lock().await.insert(id.clone(), tx);

        if let Err(err) = self.send(frame).await {
            self.state.pending.lock().await.remove(&id);
            return Err(err);
        }

        match tokio::time::timeout(timeout, rx).await {
            // `result` may itself carry an error the reader/disconnect path
            // sent deliberately (e.g. "adapter disconnected") — propagate
            // it as-is rather than re-wrapping it.
            Ok(Ok(result)) => result,
            // The sender was dropped without ever sending (task panicked).
            Ok(Err(_)) => Err(GatewayError::ConnectError {
                instance_id: self.instance_id.clone(),
                reason: "adapter closed while awaiting response".into(),
            }),
            Err(_) => {
                self.state.pending.lock().await.remove(&id);
                Err(GatewayError::Timeout(timeout))
            }
        }
    }
}

async fn writer_task(mut stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(message) = rx.recv().await {
        if stdin.write_all(message.as_bytes()).await.is_err() {
            break;
        }
        if stdin.write_all(b"\n").await.is_err() {
            break;
        }
        if stdin.flush().await.is_err() {
            break;
        }
    }
    let _ = stdin.shutdown().await;
}

/// Reads raw bytes off stdout (not lines — a backend is never required to
/// newline-delimit its frames) and feeds them through the depth-aware
/// splitter, dispatching each completed frame to either a pending waiter
/// or the inbound notification queue.
async fn reader_task(
    instance_id: String,
    mut stdout: ChildStdout,
    pending: Pending,
    inbound_tx: mpsc::UnboundedSender<McpFrame>,
) {
    let mut splitter = JsonObjectSplitter::new();
    let mut buf = [0u8; 8192];

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        for object in splitter.push(&buf[..n]) {
            match serde_json::from_slice::<McpFrame>(&object) {
                Ok(frame) => dispatch(frame, &pending, &inbound_tx).await,
                Err(err) => warn!("malformed MCP frame from subprocess stdout: {err}"),
            }
        }
    }

    let mut guard = pending.lock().await;
    for (_, tx) in guard.drain() {
        let _ = tx.send(Err(GatewayError::ConnectError {
            instance_id: instance_id.clone(),
            reason: "subprocess stdout closed".into(),
        }));
    }
}

async fn dispatch(frame: McpFrame, pending: &Pending, inbound_tx: &mpsc::UnboundedSender<McpFrame>) {
    if frame.is_response() {
        if let Some(id) = frame.id.clone() {
            let sender = pending.lock().await.remove(&id);
            if let Some(tx) = sender {
                let _ = tx.send(Ok(frame));
                return;
            }
        }
    }
    let _ = inbound_tx.send(frame);
}

/// Owns the child exclusively for its whole lifetime and reaps it, the way
/// `writer_task`/`reader_task` each own one I/O handle. Reports an
/// unprompted exit through `state.exit`; an intentional `disconnect()`
/// instead aborts this task, dropping `child` and relying on
/// `kill_on_drop(true)` to actually kill the process, so nothing is ever
/// reported here in that case.
async fn exit_watch_task(instance_id: String, mut child: Child, state: Arc<State>) {
    let status = child.wait().await;
    let exit_code = status.ok().and_then(|status| status.code());
    warn!(instance_id = %instance_id, ?exit_code, "subprocess exited unexpectedly");

    state.connected.store(false, Ordering::Release);
    let _ = state.exit.send(Some(exit_code));

    let mut pending = state.pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(GatewayError::ConnectError {
            instance_id: instance_id.clone(),
            reason: "subprocess exited unexpectedly".into(),
        }));
    }
}

async fn stderr_task(instance_id: String, stderr: ChildStderr) {
    let mut reader = tokio::io::BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        use tokio::io::AsyncBufReadExt;
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => debug!(instance_id = %instance_id, "subprocess stderr: {}", line.trim_end()),
        }
    }
}
