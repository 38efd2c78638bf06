//! MCP client — child-process connections and tool registration.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::McpServerConfig;
use crate::error::{McpError, ToolError};
use crate::mcp::protocol::{
    CallToolResult, JsonRpcRequest, JsonRpcResponse, McpToolInfo, ToolsListResult, CLIENT_NAME,
    CLIENT_VERSION, PROTOCOL_VERSION,
};
use crate::tools::{Tool, ToolContext, ToolRegistry};

type PendingMap = Arc<StdMutex<HashMap<i64, oneshot::Sender<JsonRpcResponse>>>>;

/// Cap on one response line from a server. A line that exceeds this kills
/// the connection's reader rather than growing the buffer without bound.
const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// A JSON-RPC connection over a pair of byte streams.
///
/// Holds the request-id counter, the pending-response map, and the reader
/// task that dispatches each incoming line by id. Separated from the child
/// process so tests can drive it over in-process pipes.
pub struct Connection {
    writer: Mutex<Box<dyn AsyncWrite + Send + Unpin>>,
    pending: PendingMap,
    next_id: AtomicI64,
    reader_task: JoinHandle<()>,
}

impl Connection {
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        name: impl Into<String>,
    ) -> Self {
        let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
        let reader_pending = Arc::clone(&pending);
        let name = name.into();
        let reader_task = tokio::spawn(async move {
            read_responses(reader, reader_pending, name).await;
        });
        Self {
            writer: Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicI64::new(0),
            reader_task,
        }
    }

    /// Send a request and wait for the matching response.
    ///
    /// If the caller is cancelled before a response arrives, the pending
    /// entry is removed and a late response is discarded.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending map poisoned").insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let request = JsonRpcRequest::new(id, method, params);
        self.write_frame(&request).await?;

        let response = rx.await.map_err(|_| McpError::ConnectionClosed)?;
        if let Some(err) = response.error {
            return Err(McpError::Protocol {
                code: err.code,
                message: err.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Send a notification (no id, no response expected).
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.write_frame(&JsonRpcRequest::notification(method, params))
            .await
    }

    async fn write_frame(&self, request: &JsonRpcRequest) -> Result<(), McpError> {
        let mut data = serde_json::to_vec(request).map_err(|e| McpError::Write(e.to_string()))?;
        data.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer
            .write_all(&data)
            .await
            .map_err(|e| McpError::Write(e.to_string()))?;
        writer
            .flush()
            .await
            .map_err(|e| McpError::Write(e.to_string()))?;
        Ok(())
    }

    /// Invoke a tool on the server by its raw (un-namespaced) name.
    pub async fn call_tool(&self, name: &str, args: Value) -> Result<Value, McpError> {
        let result = self
            .request("tools/call", Some(json!({"name": name, "arguments": args})))
            .await?;

        let parsed: CallToolResult = match serde_json::from_value(result.clone()) {
            Ok(parsed) => parsed,
            // Unexpected shape: hand the raw result through.
            Err(_) => return Ok(result),
        };

        if parsed.is_error {
            let message = parsed
                .content
                .first()
                .map(|c| c.text.clone())
                .unwrap_or_else(|| "tool returned error".to_string());
            return Err(McpError::Tool(message));
        }

        match parsed.content.first() {
            Some(item) if item.kind == "text" => Ok(Value::String(item.text.clone())),
            _ => Ok(result),
        }
    }

    /// Close the writer side and stop the reader task.
    pub async fn shutdown(&self) {
        if let Ok(mut writer) = self.writer.try_lock() {
            let _ = writer.shutdown().await;
        }
        self.reader_task.abort();
        self.pending.lock().expect("pending map poisoned").clear();
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Removes the pending entry when the request future completes or is
/// cancelled, so no orphan entries survive a caller timeout.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    id: i64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.id);
        }
    }
}

async fn read_responses(
    reader: impl AsyncRead + Send + Unpin + 'static,
    pending: PendingMap,
    name: String,
) {
    let mut reader = BufReader::new(reader);
    let mut line: Vec<u8> = Vec::new();
    loop {
        match read_capped_line(&mut reader, &mut line, MAX_LINE_BYTES).await {
            Ok(true) => {
                if line.is_empty() {
                    continue;
                }
                let response: JsonRpcResponse = match serde_json::from_slice(&line) {
                    Ok(resp) => resp,
                    Err(e) => {
                        error!(server = %name, error = %e, "Failed to parse MCP response");
                        continue;
                    }
                };
                if let Some(id) = response.id {
                    let sender = pending.lock().expect("pending map poisoned").remove(&id);
                    match sender {
                        // A send error means the caller gave up; discard.
                        Some(tx) => {
                            let _ = tx.send(response);
                        }
                        None => debug!(server = %name, id, "Discarding late MCP response"),
                    }
                }
            }
            Ok(false) => break,
            Err(e) => {
                error!(server = %name, error = %e, "Error reading from MCP server");
                break;
            }
        }
    }
    // Dropping the senders resolves any waiting callers with an error.
    pending.lock().expect("pending map poisoned").clear();
    debug!(server = %name, "MCP reader finished");
}

/// Read one newline-terminated line into `buf`, capping growth at `max`
/// bytes. Returns `Ok(false)` at EOF; an over-long line is an error.
async fn read_capped_line<R>(
    reader: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
) -> std::io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            // EOF; a final unterminated line still counts.
            return Ok(!buf.is_empty());
        }
        match chunk.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if buf.len() + pos > max {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "response line exceeds buffer limit",
                    ));
                }
                buf.extend_from_slice(&chunk[..pos]);
                reader.consume(pos + 1);
                if buf.last() == Some(&b'\r') {
                    buf.pop();
                }
                return Ok(true);
            }
            None => {
                let len = chunk.len();
                if buf.len() + len > max {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "response line exceeds buffer limit",
                    ));
                }
                buf.extend_from_slice(chunk);
                reader.consume(len);
            }
        }
    }
}

/// A connection to one MCP server child process.
pub struct ServerConnection {
    pub name: String,
    conn: Arc<Connection>,
    child: Mutex<Child>,
    tools: Vec<McpToolInfo>,
}

impl ServerConnection {
    /// Spawn the configured command and perform the MCP handshake.
    pub async fn connect(cfg: &McpServerConfig) -> Result<Self, McpError> {
        let mut child = Command::new(&cfg.command)
            .args(&cfg.args)
            .envs(&cfg.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| McpError::Spawn(e.to_string()))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::Spawn("failed to get stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::Spawn("failed to get stdout".into()))?;

        let conn = Arc::new(Connection::new(stdout, stdin, cfg.name.clone()));
        let tools = Self::handshake(&conn).await?;

        Ok(Self {
            name: cfg.name.clone(),
            conn,
            child: Mutex::new(child),
            tools,
        })
    }

    /// `initialize` → `notifications/initialized` → `tools/list`.
    async fn handshake(conn: &Connection) -> Result<Vec<McpToolInfo>, McpError> {
        conn.request(
            "initialize",
            Some(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {"name": CLIENT_NAME, "version": CLIENT_VERSION},
            })),
        )
        .await?;

        conn.notify("notifications/initialized", None).await?;

        let result = conn.request("tools/list", None).await?;
        let list: ToolsListResult = serde_json::from_value(result)
            .map_err(|e| McpError::Write(format!("failed to parse tools: {e}")))?;
        Ok(list.tools)
    }

    /// The tools this server advertised, wrapped for the registry under
    /// `"<server>:<tool>"` names.
    pub fn registry_tools(&self) -> Vec<Arc<McpTool>> {
        self.tools
            .iter()
            .map(|info| {
                Arc::new(McpTool {
                    name: format!("{}:{}", self.name, info.name),
                    mcp_name: info.name.clone(),
                    description: info.description.clone(),
                    parameters: info.input_schema.clone(),
                    conn: Arc::clone(&self.conn),
                })
            })
            .collect()
    }

    /// Tear down: close stdin, stop the reader, terminate the child.
    pub async fn close(&self) {
        self.conn.shutdown().await;
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            debug!(server = %self.name, error = %e, "MCP child already exited");
        }
    }
}

/// An MCP server tool exposed through the tool registry.
pub struct McpTool {
    name: String,
    mcp_name: String,
    description: String,
    parameters: Value,
    conn: Arc<Connection>,
}

#[async_trait]
impl Tool for McpTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> String {
        self.description.clone()
    }

    fn parameters(&self) -> Value {
        self.parameters.clone()
    }

    async fn execute(&self, _ctx: &ToolContext, args: Value) -> Result<Value, ToolError> {
        self.conn
            .call_tool(&self.mcp_name, args)
            .await
            .map_err(|e| ToolError::Execution(e.to_string()))
    }
}

/// Manages the set of connected MCP servers.
pub struct McpClient {
    servers: Mutex<HashMap<String, ConnectedServer>>,
}

struct ConnectedServer {
    connection: ServerConnection,
    registered_tools: Vec<String>,
}

impl McpClient {
    pub fn new() -> Self {
        Self {
            servers: Mutex::new(HashMap::new()),
        }
    }

    /// Connect every configured server. A server that fails to initialize is
    /// logged and skipped; the others continue.
    pub async fn connect_all(&self, configs: &[McpServerConfig], registry: &ToolRegistry) {
        for cfg in configs {
            if let Err(e) = self.connect_server(cfg, registry).await {
                error!(server = %cfg.name, error = %e, "Failed to connect to MCP server");
            }
        }
    }

    /// Connect one server, replacing any previous connection (and its
    /// registry entries) under the same name.
    pub async fn connect_server(
        &self,
        cfg: &McpServerConfig,
        registry: &ToolRegistry,
    ) -> Result<(), McpError> {
        let mut servers = self.servers.lock().await;

        if let Some(previous) = servers.remove(&cfg.name) {
            for name in &previous.registered_tools {
                registry.unregister(name).await;
            }
            previous.connection.close().await;
        }

        let connection = ServerConnection::connect(cfg).await?;
        let tools = connection.registry_tools();
        let mut registered_tools = Vec::with_capacity(tools.len());
        for tool in tools {
            registered_tools.push(tool.name().to_string());
            registry.register(tool).await;
        }

        info!(
            server = %cfg.name,
            tools = registered_tools.len(),
            "Connected to MCP server"
        );
        servers.insert(
            cfg.name.clone(),
            ConnectedServer {
                connection,
                registered_tools,
            },
        );
        Ok(())
    }

    /// Shut down every connected server.
    pub async fn close_all(&self) {
        let mut servers = self.servers.lock().await;
        for (name, server) in servers.drain() {
            warn!(server = %name, "Closing MCP server");
            server.connection.close().await;
        }
    }
}

impl Default for McpClient {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{duplex, AsyncReadExt};

    /// Stub MCP server over in-process pipes: reads request lines, replies
    /// per the provided handler.
    fn stub_server(
        mut server_reader: impl AsyncRead + Send + Unpin + 'static,
        mut server_writer: impl AsyncWrite + Send + Unpin + 'static,
        reply: impl Fn(&JsonRpcRequestEcho) -> Option<String> + Send + 'static,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                match server_reader.read(&mut byte).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {}
                }
                if byte[0] != b'\n' {
                    buf.push(byte[0]);
                    continue;
                }
                let line = String::from_utf8_lossy(&buf).into_owned();
                buf.clear();
                let request: JsonRpcRequestEcho = match serde_json::from_str(&line) {
                    Ok(req) => req,
                    Err(_) => continue,
                };
                if let Some(response) = reply(&request) {
                    let _ = server_writer.write_all(response.as_bytes()).await;
                    let _ = server_writer.write_all(b"\n").await;
                    let _ = server_writer.flush().await;
                }
            }
        })
    }

    #[derive(Debug, serde::Deserialize)]
    struct JsonRpcRequestEcho {
        #[serde(default)]
        id: Option<i64>,
        method: String,
        #[serde(default)]
        params: Option<Value>,
    }

    fn echo_handler(request: &JsonRpcRequestEcho) -> Option<String> {
        let id = request.id?;
        let result = match request.method.as_str() {
            "initialize" => json!({"protocolVersion": PROTOCOL_VERSION}),
            "tools/list" => json!({
                "tools": [{
                    "name": "echo",
                    "description": "Echoes input",
                    "inputSchema": {"type": "object"}
                }]
            }),
            "tools/call" => {
                let input = request
                    .params
                    .as_ref()
                    .and_then(|p| p.get("arguments"))
                    .and_then(|a| a.get("input"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                json!({"content": [{"type": "text", "text": input}], "isError": false})
            }
            _ => return None,
        };
        Some(json!({"jsonrpc": "2.0", "id": id, "result": result}).to_string())
    }

    #[tokio::test]
    async fn handshake_and_tool_call_round_trip() {
        let (client_io, server_io) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let _server = stub_server(server_read, server_write, echo_handler);

        let conn = Connection::new(client_read, client_write, "srv");
        let tools = ServerConnection::handshake(&conn).await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");

        let result = conn
            .call_tool("echo", json!({"input": "hello"}))
            .await
            .unwrap();
        assert_eq!(result, Value::String("hello".into()));
        assert_eq!(conn.pending_len(), 0);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn tool_error_surfaces_first_text() {
        let (client_io, server_io) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let _server = stub_server(server_read, server_write, |req| {
            let id = req.id?;
            Some(
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {"content": [{"type": "text", "text": "boom"}], "isError": true}
                })
                .to_string(),
            )
        });

        let conn = Connection::new(client_read, client_write, "srv");
        let err = conn.call_tool("broken", json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "tool error: boom");
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn protocol_error_is_reported() {
        let (client_io, server_io) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);
        let _server = stub_server(server_read, server_write, |req| {
            let id = req.id?;
            Some(
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {"code": -32601, "message": "no such method"}
                })
                .to_string(),
            )
        });

        let conn = Connection::new(client_read, client_write, "srv");
        let err = conn.request("bogus/method", None).await.unwrap_err();
        assert!(matches!(err, McpError::Protocol { code: -32601, .. }));
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn cancelled_request_leaves_no_orphan_entry() {
        // A server that never answers.
        let (client_io, server_io) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (_server_read, _server_write) = tokio::io::split(server_io);

        let conn = Arc::new(Connection::new(client_read, client_write, "srv"));
        let request_conn = Arc::clone(&conn);
        let outcome = tokio::time::timeout(Duration::from_millis(50), async move {
            request_conn.request("tools/list", None).await
        })
        .await;

        assert!(outcome.is_err(), "request should have timed out");
        assert_eq!(conn.pending_len(), 0);
        conn.shutdown().await;
    }

    #[tokio::test]
    async fn capped_line_reader_splits_lines_and_strips_crlf() {
        let data: &[u8] = b"first\r\nsecond\nunterminated";
        let mut reader = BufReader::new(data);
        let mut buf = Vec::new();

        assert!(read_capped_line(&mut reader, &mut buf, 64).await.unwrap());
        assert_eq!(buf, b"first");
        assert!(read_capped_line(&mut reader, &mut buf, 64).await.unwrap());
        assert_eq!(buf, b"second");
        assert!(read_capped_line(&mut reader, &mut buf, 64).await.unwrap());
        assert_eq!(buf, b"unterminated");
        assert!(!read_capped_line(&mut reader, &mut buf, 64).await.unwrap());
    }

    #[tokio::test]
    async fn over_long_line_errors_instead_of_growing() {
        // No newline at all: the buffer must stop at the cap, not grow.
        let data = vec![b'x'; 100];
        let mut reader = BufReader::new(data.as_slice());
        let mut buf = Vec::new();
        let err = read_capped_line(&mut reader, &mut buf, 16)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);

        // Same for a terminated line that exceeds the cap.
        let data: &[u8] = b"this line is too long\n";
        let mut reader = BufReader::new(data);
        let err = read_capped_line(&mut reader, &mut buf, 8)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn request_ids_are_monotonic() {
        let (client_io, server_io) = duplex(64 * 1024);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        // Record the ids the server sees, answering each.
        let _server = stub_server(server_read, server_write, |req| {
            let id = req.id?;
            Some(json!({"jsonrpc": "2.0", "id": id, "result": {"seen": id}}).to_string())
        });

        let conn = Connection::new(client_read, client_write, "srv");
        let first = conn.request("a", None).await.unwrap();
        let second = conn.request("b", None).await.unwrap();
        assert_eq!(first["seen"], 1);
        assert_eq!(second["seen"], 2);
        conn.shutdown().await;
    }
}
