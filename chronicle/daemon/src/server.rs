//! Daemon Server Implementation
//!
//! - Accepts connections on a Unix socket (mode `0600`, same-user peers only)
//! - Spawns a handler task per connection
//! - Reads one JSON request per line and answers in order
//! - Supports graceful shutdown
//!
//! ```text
//!   client ──request line──▶ handler ──▶ Engine::dispatch
//!          ◀─response line──         ◀── Reply::Response
//!          ◀─envelope lines─         ◀── Reply::Stream
//! ```
//!
//! While a request is running or a stream is being forwarded the handler
//! keeps reading the socket. End of input at that point counts as a
//! disconnect and drops the pending work, which stops its producer or tool
//! process. Lines that arrive meanwhile are answered afterwards.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use dashmap::DashMap;
use futures::StreamExt;
use tokio::io::AsyncReadExt;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};

use chronicle_core::transport::{EnvelopeStream, NdjsonDecoder, NdjsonWriter};
use chronicle_core::{Engine, ErrorKind, Reply, Request, Response};

const READ_BUFFER_SIZE: usize = 8192;

/// Connection state tracking
struct ConnectionState {
    /// When the connection was established
    connected_at: Instant,
    /// Remote peer UID
    peer_uid: Option<u32>,
    /// Handle to abort the connection task
    abort_handle: tokio::task::AbortHandle,
}

/// Configuration for the daemon server
pub struct ServerConfig {
    /// Maximum number of concurrent connections
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
        }
    }
}

/// The main daemon server
pub struct DaemonServer {
    /// Path to the Unix socket
    socket_path: PathBuf,
    /// Engine shared by every connection
    engine: Engine,
    /// Server configuration
    server_config: ServerConfig,
    /// Active connections
    connection_states: Arc<DashMap<u64, ConnectionState>>,
    next_conn_id: AtomicU64,
}

impl DaemonServer {
    /// Create a new daemon server
    pub fn new(socket_path: PathBuf, engine: Engine) -> Self {
        Self {
            socket_path,
            engine,
            server_config: ServerConfig::default(),
            connection_states: Arc::new(DashMap::new()),
            next_conn_id: AtomicU64::new(1),
        }
    }

    /// Prepare the socket path (create directory, remove stale socket)
    async fn prepare_socket(&self) -> Result<()> {
        if let Some(parent) = self.socket_path.parent() {
            if !tokio::fs::try_exists(parent).await.unwrap_or(false) {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create socket directory: {parent:?}"))?;
                info!(path = ?parent, "Created socket directory");
            }
        }

        if tokio::fs::try_exists(&self.socket_path).await.unwrap_or(false) {
            warn!(path = ?self.socket_path, "Removing stale socket file");
            tokio::fs::remove_file(&self.socket_path)
                .await
                .with_context(|| format!("Failed to remove stale socket: {:?}", self.socket_path))?;
        }
        Ok(())
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.prepare_socket().await?;

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind to {:?}", self.socket_path))?;
        info!(path = ?self.socket_path, "Listening for connections");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.socket_path, perms)
                .await
                .context("Failed to restrict socket permissions")?;
        }

        let our_uid = nix::unistd::getuid().as_raw();

        loop {
            let stream = tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping accept loop");
                    break;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => stream,
                    Err(e) => {
                        error!(error = %e, "Accept failed");
                        continue;
                    }
                },
            };

            if self.connection_states.len() >= self.server_config.max_connections {
                warn!("Connection limit reached, rejecting new connection");
                drop(stream);
                continue;
            }

            let peer_uid = stream.peer_cred().ok().map(|cred| cred.uid());
            if let Some(uid) = peer_uid {
                if uid != our_uid && uid != 0 {
                    warn!(
                        peer_uid = uid,
                        our_uid = our_uid,
                        "Rejecting connection from different user"
                    );
                    drop(stream);
                    continue;
                }
            }

            let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
            info!(
                conn_id,
                peer_uid = ?peer_uid,
                active_connections = self.connection_states.len() + 1,
                "New connection accepted"
            );

            let engine = self.engine.clone();
            let connection_states = Arc::clone(&self.connection_states);
            let task = tokio::spawn(
                async move {
                    handle_connection(engine, stream).await;
                    connection_states.remove(&conn_id);
                    info!(
                        active_connections = connection_states.len(),
                        "Connection handler finished"
                    );
                }
                .instrument(tracing::info_span!("connection", conn_id)),
            );
            self.connection_states.insert(
                conn_id,
                ConnectionState {
                    connected_at: Instant::now(),
                    peer_uid,
                    abort_handle: task.abort_handle(),
                },
            );
        }

        self.shutdown().await
    }

    /// Graceful shutdown
    async fn shutdown(&self) -> Result<()> {
        info!("Initiating graceful shutdown");

        let cancelled = self.engine.shutdown();
        if cancelled > 0 {
            info!(cancelled, "Cancelled running tool processes");
        }

        let conn_ids: Vec<u64> = self.connection_states.iter().map(|r| *r.key()).collect();
        for conn_id in conn_ids {
            if let Some((_, state)) = self.connection_states.remove(&conn_id) {
                info!(
                    conn_id,
                    peer_uid = ?state.peer_uid,
                    uptime_secs = state.connected_at.elapsed().as_secs(),
                    "Aborting connection"
                );
                state.abort_handle.abort();
            }
        }

        if tokio::fs::try_exists(&self.socket_path).await.unwrap_or(false) {
            tokio::fs::remove_file(&self.socket_path)
                .await
                .with_context(|| format!("Failed to remove socket: {:?}", self.socket_path))?;
            info!(path = ?self.socket_path, "Socket file removed");
        }

        info!("Shutdown complete");
        Ok(())
    }
}

// =============================================================================
// Connections
// =============================================================================

struct Connection {
    engine: Engine,
    reader: OwnedReadHalf,
    writer: NdjsonWriter<OwnedWriteHalf>,
    decoder: NdjsonDecoder,
    buf: Vec<u8>,
}

/// Serve one client until it disconnects
async fn handle_connection(engine: Engine, stream: UnixStream) {
    let (reader, writer) = stream.into_split();
    let mut conn = Connection {
        engine,
        reader,
        writer: NdjsonWriter::new(writer),
        decoder: NdjsonDecoder::new(),
        buf: vec![0u8; READ_BUFFER_SIZE],
    };
    if let Err(e) = conn.serve().await {
        debug!(error = %e, "Connection closed");
    }
}

impl Connection {
    async fn serve(&mut self) -> Result<()> {
        loop {
            while let Some(line) = self.decoder.next_line() {
                if !self.answer(line).await? {
                    return Ok(());
                }
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                if let Some(line) = self.decoder.finish() {
                    self.answer(line).await?;
                }
                info!("Client disconnected (EOF)");
                return Ok(());
            }
            self.decoder.push(&self.buf[..n]);
        }
    }

    /// Answer one request line; `false` when the client went away
    async fn answer(
        &mut self,
        line: std::result::Result<serde_json::Value, chronicle_core::LineParseError>,
    ) -> Result<bool> {
        let request = match line {
            Ok(value) => serde_json::from_value::<Request>(value).map_err(|e| e.to_string()),
            Err(e) => Err(format!("line {}: {}", e.line, e.message)),
        };
        let reply = match request {
            Ok(request) => {
                debug!(op = request.op(), streaming = request.is_streaming(), "Request");
                match self.dispatch(request).await {
                    Some(reply) => reply,
                    None => return Ok(false),
                }
            }
            Err(message) => {
                warn!(error = %message, "Malformed request");
                Reply::Response(Response::failure(ErrorKind::InvalidRequest, message))
            }
        };

        match reply {
            Reply::Response(response) => {
                self.writer.write_record(&response).await?;
                Ok(true)
            }
            Reply::Stream(stream) => self.forward(stream).await,
        }
    }

    /// Run a request while watching the socket; `None` on disconnect
    ///
    /// Returning early drops the dispatch future, which cancels its work.
    async fn dispatch(&mut self, request: Request) -> Option<Reply> {
        let Self {
            engine,
            reader,
            decoder,
            buf,
            ..
        } = self;
        let dispatch = engine.dispatch(request);
        tokio::pin!(dispatch);

        loop {
            tokio::select! {
                reply = &mut dispatch => return Some(reply),
                read = reader.read(&mut buf[..]) => match read {
                    Ok(0) | Err(_) => {
                        info!("Client disconnected while a request was running");
                        return None;
                    }
                    Ok(n) => decoder.push(&buf[..n]),
                },
            }
        }
    }

    /// Write envelopes until the stream ends; `false` on disconnect
    ///
    /// Returning early drops `stream`, which cancels its producer.
    async fn forward(&mut self, mut stream: EnvelopeStream) -> Result<bool> {
        loop {
            tokio::select! {
                envelope = stream.next() => match envelope {
                    Some(envelope) => self.writer.write_record(&envelope).await?,
                    None => return Ok(true),
                },
                read = self.reader.read(&mut self.buf) => match read {
                    Ok(0) | Err(_) => {
                        info!("Client disconnected mid-stream");
                        return Ok(false);
                    }
                    Ok(n) => self.decoder.push(&self.buf[..n]),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use chronicle_core::{EngineConfig, OrchestratorConfig};
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
    use tokio::task::JoinHandle;
    use tokio::time::Duration;

    struct Harness {
        _root: TempDir,
        _run: TempDir,
        socket: PathBuf,
        engine: Engine,
        token: CancellationToken,
        server: JoinHandle<Result<()>>,
    }

    async fn start() -> Harness {
        start_with(|_| {}).await
    }

    async fn start_with(configure: impl FnOnce(&mut EngineConfig)) -> Harness {
        let root = TempDir::new().unwrap();
        let run = TempDir::new().unwrap();
        let socket = run.path().join("nested").join("daemon.sock");
        let mut config = EngineConfig::with_root(root.path());
        configure(&mut config);
        let engine = Engine::open(&config).await.unwrap();

        let server = DaemonServer::new(socket.clone(), engine.clone());
        let token = CancellationToken::new();
        let server = tokio::spawn({
            let token = token.clone();
            async move { server.run(token).await }
        });

        for _ in 0..200 {
            if UnixStream::connect(&socket).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        Harness {
            _root: root,
            _run: run,
            socket,
            engine,
            token,
            server,
        }
    }

    async fn connect(socket: &Path) -> (Lines<BufReader<OwnedReadHalf>>, OwnedWriteHalf) {
        let (read, write) = UnixStream::connect(socket).await.unwrap().into_split();
        (BufReader::new(read).lines(), write)
    }

    async fn next_json(lines: &mut Lines<BufReader<OwnedReadHalf>>) -> Value {
        let line = lines.next_line().await.unwrap().unwrap();
        serde_json::from_str(&line).unwrap()
    }

    #[tokio::test]
    async fn test_buffered_requests_answered_in_order() {
        let harness = start().await;
        harness
            .engine
            .create_log("demo", "abc", &[json!({"type": "user"})])
            .await
            .unwrap();

        let (mut lines, mut write) = connect(&harness.socket).await;
        write
            .write_all(b"{\"op\":\"list_collections\"}\nnot json\n{\"op\":\"cache_clear\"}\n")
            .await
            .unwrap();

        let first = next_json(&mut lines).await;
        assert_eq!(first["ok"], json!(true));
        assert_eq!(first["data"][0]["name"], json!("demo"));

        let second = next_json(&mut lines).await;
        assert_eq!(second["ok"], json!(false));
        assert_eq!(second["error"]["kind"], json!("invalid_request"));

        let third = next_json(&mut lines).await;
        assert_eq!(third["ok"], json!(true));

        harness.token.cancel();
        harness.server.await.unwrap().unwrap();
        assert!(!harness.socket.exists());
    }

    #[tokio::test]
    async fn test_streamed_query_ends_with_end_envelope() {
        let harness = start().await;
        harness
            .engine
            .create_log(
                "demo",
                "abc",
                &[json!({"type": "user"}), json!({"type": "assistant"})],
            )
            .await
            .unwrap();

        let (mut lines, mut write) = connect(&harness.socket).await;
        let request = json!({
            "op": "query",
            "expression": ".[] | .type",
            "targets": ["demo/abc"],
            "stream": true,
        });
        write
            .write_all(format!("{request}\n").as_bytes())
            .await
            .unwrap();

        let mut kinds = Vec::new();
        loop {
            let envelope = next_json(&mut lines).await;
            let kind = envelope["kind"].as_str().unwrap().to_string();
            let terminal = kind == "end" || kind == "error";
            kinds.push(kind);
            if terminal {
                break;
            }
        }
        assert_eq!(kinds, vec!["start", "data", "data", "end"]);

        harness.token.cancel();
        harness.server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_during_buffered_chat_stops_the_tool() {
        let harness = start_with(|config| {
            config.process = OrchestratorConfig::default().with_program(
                "/bin/sh",
                vec!["-c".to_string(), "sleep 30".to_string(), "sh".to_string()],
            );
            config.process.buffered_args = Vec::new();
            config.process.kill_grace = Duration::from_millis(200);
        })
        .await;

        let (_lines, mut write) = connect(&harness.socket).await;
        write
            .write_all(b"{\"op\":\"chat\",\"message\":\"hello\"}\n")
            .await
            .unwrap();

        let started = async {
            while harness.engine.process_stats().active == 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), started)
            .await
            .expect("tool process never started");

        write.shutdown().await.unwrap();
        drop(write);

        let stopped = async {
            while harness.engine.process_stats().active > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), stopped)
            .await
            .expect("tool process outlived its client");

        harness.token.cancel();
        harness.server.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_socket_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let harness = start().await;
        let mode = || std::fs::metadata(&harness.socket).unwrap().permissions().mode() & 0o777;
        for _ in 0..100 {
            if mode() == 0o600 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(mode(), 0o600);

        harness.token.cancel();
        harness.server.await.unwrap().unwrap();
    }
}
