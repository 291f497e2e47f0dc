//! MCP client: request/response routing over a line-delimited transport.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, info, trace, warn};

use linkscout_core::config::McpServerConfig;

use crate::error::{McpError, Result};
use crate::protocol::{
    CallToolParams, CallToolResult, Implementation, Incoming, InitializeParams, InitializeResult,
    JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, ListToolsResult, METHOD_NOT_FOUND,
    McpTool, PROTOCOL_VERSION,
};

/// Longest line accepted from a server. Page snapshots can be large.
const MAX_LINE_BYTES: usize = 64 * 1024 * 1024;

/// How long a server gets to exit after stdin closes.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;

fn lock(pending: &Pending) -> MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<Value>>>> {
    pending.lock().unwrap_or_else(|e| e.into_inner())
}

/// A connected MCP client.
pub struct McpClient {
    name: String,
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Pending,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    request_timeout: Duration,
    shutdown_grace: Duration,
    server_info: OnceLock<InitializeResult>,
    child: tokio::sync::Mutex<Option<Child>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl McpClient {
    /// Wrap an already-open transport. No handshake is performed.
    pub fn connect<R, W>(name: impl Into<String>, reader: R, writer: W, request_timeout: Duration) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let name = name.into();
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::unbounded_channel::<String>();

        let writer_task = tokio::spawn(write_loop(name.clone(), writer, rx));
        let reader_task = tokio::spawn(read_loop(
            name.clone(),
            reader,
            pending.clone(),
            closed.clone(),
            tx.downgrade(),
        ));

        Self {
            name,
            outgoing: Mutex::new(Some(tx)),
            pending,
            closed,
            next_id: AtomicU64::new(1),
            request_timeout,
            shutdown_grace: SHUTDOWN_GRACE,
            server_info: OnceLock::new(),
            child: tokio::sync::Mutex::new(None),
            tasks: Mutex::new(vec![writer_task, reader_task]),
        }
    }

    /// Spawn the configured server process and complete the `initialize` handshake.
    pub async fn spawn(config: &McpServerConfig) -> Result<Self> {
        info!(server = %config.name, command = %config.command_line(), "Starting MCP server");

        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = config.resolved_cwd() {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|source| McpError::Spawn {
            server: config.name.clone(),
            source,
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Protocol("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Protocol("child stdout unavailable".into()))?;

        let client = Self::connect(
            config.name.clone(),
            stdout,
            stdin,
            Duration::from_millis(config.request_timeout_ms),
        );

        if let Some(stderr) = child.stderr.take() {
            let server = config.name.clone();
            let task = tokio::spawn(async move {
                drain_stderr(&server, stderr).await;
            });
            client.track(task);
        }
        *client.child.lock().await = Some(child);

        match client.initialize().await {
            Ok(result) => {
                info!(
                    server = %config.name,
                    remote = %result.server_info.name,
                    version = %result.server_info.version,
                    "MCP server initialized"
                );
                Ok(client)
            }
            Err(e) => {
                client.shutdown().await;
                Err(e)
            }
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// How long [`shutdown`](Self::shutdown) waits for the server to exit before killing it.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Server details from the handshake, once `initialize` has succeeded.
    pub fn server_info(&self) -> Option<&InitializeResult> {
        self.server_info.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Perform the `initialize` handshake and announce `notifications/initialized`.
    pub async fn initialize(&self) -> Result<InitializeResult> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION,
            capabilities: json!({}),
            client_info: Implementation {
                name: env!("CARGO_PKG_NAME").into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };
        let value = self
            .request("initialize", Some(serde_json::to_value(params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(value)?;

        if result.protocol_version != PROTOCOL_VERSION {
            debug!(
                server = %self.name,
                requested = PROTOCOL_VERSION,
                negotiated = %result.protocol_version,
                "Server negotiated a different protocol version"
            );
        }

        self.notify("notifications/initialized", None)?;
        let _ = self.server_info.set(result.clone());
        Ok(result)
    }

    /// List every tool, following pagination cursors.
    pub async fn list_tools(&self) -> Result<Vec<McpTool>> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.as_ref().map(|c| json!({ "cursor": c }));
            let value = self.request("tools/list", params).await?;
            let page: ListToolsResult = serde_json::from_value(value)?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }
        debug!(server = %self.name, count = tools.len(), "Listed MCP tools");
        Ok(tools)
    }

    /// Invoke a tool on the server.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<CallToolResult> {
        let arguments = if arguments.is_null() { json!({}) } else { arguments };
        let params = serde_json::to_value(CallToolParams { name, arguments })?;
        let value = self.request("tools/call", Some(params)).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a request and wait for the matching response.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        if self.is_closed() {
            return Err(McpError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(id, tx);

        // The reader may have drained pending requests between the check above and the insert.
        if self.is_closed() {
            lock(&self.pending).remove(&id);
            return Err(McpError::Closed);
        }

        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))?;
        trace!(server = %self.name, id, method, "-> request");
        if let Err(e) = self.send_line(line) {
            lock(&self.pending).remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(McpError::Closed),
            Err(_) => {
                lock(&self.pending).remove(&id);
                warn!(server = %self.name, method, "MCP request timed out");
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a notification (no response expected).
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let line = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        trace!(server = %self.name, method, "-> notification");
        self.send_line(line)
    }

    fn send_line(&self, line: String) -> Result<()> {
        let outgoing = self.outgoing.lock().unwrap_or_else(|e| e.into_inner());
        match outgoing.as_ref() {
            Some(tx) => tx.send(line).map_err(|_| McpError::Closed),
            None => Err(McpError::Closed),
        }
    }

    fn track(&self, task: JoinHandle<()>) {
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    /// Close the connection: close stdin, give the server a grace period to exit, then kill it.
    pub async fn shutdown(&self) {
        // Dropping the sender ends the writer task, which closes the server's stdin.
        self.outgoing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        if let Some(mut child) = self.child.lock().await.take() {
            match tokio::time::timeout(self.shutdown_grace, child.wait()).await {
                Ok(Ok(status)) => debug!(server = %self.name, %status, "MCP server exited"),
                Ok(Err(e)) => warn!(server = %self.name, %e, "Failed waiting for MCP server"),
                Err(_) => {
                    warn!(server = %self.name, "MCP server did not exit, killing it");
                    if let Err(e) = child.kill().await {
                        warn!(server = %self.name, %e, "Failed to kill MCP server");
                    }
                }
            }
        }

        self.closed.store(true, Ordering::SeqCst);
        fail_pending(&self.pending);
        for task in self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
        info!(server = %self.name, "Disconnected from MCP server");
    }
}

impl Drop for McpClient {
    fn drop(&mut self) {
        for task in self
            .tasks
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
        {
            task.abort();
        }
    }
}

fn fail_pending(pending: &Pending) {
    for (_, tx) in lock(pending).drain() {
        let _ = tx.send(Err(McpError::Closed));
    }
}

async fn write_loop<W>(name: String, writer: W, mut rx: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut sink = FramedWrite::new(writer, LinesCodec::new());
    while let Some(line) = rx.recv().await {
        if let Err(e) = sink.send(line).await {
            warn!(server = %name, %e, "Failed writing to MCP server");
            break;
        }
    }
    let _ = SinkExt::<String>::close(&mut sink).await;
}

/// Forward a server's stderr to the log until the pipe closes.
///
/// Lines are decoded lossily so one bad byte never stops the drain; a server
/// whose stderr is not read eventually blocks on a full pipe. Returns the
/// number of lines forwarded.
async fn drain_stderr<R>(server: &str, stderr: R) -> usize
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end();
                if !line.is_empty() {
                    debug!(server = %server, "{line}");
                    count += 1;
                }
            }
            Err(e) => {
                debug!(server = %server, %e, "Stopped reading MCP server stderr");
                break;
            }
        }
    }
    count
}

async fn read_loop<R>(
    name: String,
    reader: R,
    pending: Pending,
    closed: Arc<AtomicBool>,
    outgoing: mpsc::WeakUnboundedSender<String>,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_BYTES));

    while let Some(next) = lines.next().await {
        let line = match next {
            Ok(line) => line,
            Err(e) => {
                warn!(server = %name, %e, "Failed reading from MCP server");
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message = match Incoming::parse(line) {
            Ok(m) => m,
            Err(e) => {
                // Some servers print banners to stdout; skip anything that is not JSON-RPC.
                debug!(server = %name, %e, "Ignoring non-protocol line");
                continue;
            }
        };

        match message {
            Incoming::Response { id, outcome } => {
                let waiter = lock(&pending).remove(&id);
                match waiter {
                    Some(tx) => {
                        let result = outcome.map_err(|e| McpError::Rpc {
                            code: e.code,
                            message: e.message,
                        });
                        let _ = tx.send(result);
                    }
                    None => debug!(server = %name, id, "Response for unknown request"),
                }
            }
            Incoming::Request { id, method, .. } => {
                let response = if method == "ping" {
                    JsonRpcResponse::result(id, json!({}))
                } else {
                    debug!(server = %name, %method, "Rejecting server request");
                    JsonRpcResponse::error(id, METHOD_NOT_FOUND, format!("Method not found: {method}"))
                };
                let sent = match (outgoing.upgrade(), serde_json::to_string(&response)) {
                    (Some(tx), Ok(line)) => tx.send(line).is_ok(),
                    _ => false,
                };
                if !sent {
                    debug!(server = %name, "Could not answer server request");
                }
            }
            Incoming::Notification { method, params } => {
                trace!(server = %name, %method, ?params, "<- notification");
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
    fail_pending(&pending);
    debug!(server = %name, "MCP server closed its output");
}
