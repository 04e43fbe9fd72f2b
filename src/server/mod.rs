//! Browser coordination server.
//!
//! One HTTP+WebSocket endpoint shared by every browser agent in the process.
//! It serves the bootstrap page and the in-page runtime, then drives each
//! page over `/socket`: the harness pushes `exec` frames down, the page
//! reports `print`/`execError`/`execDone` back up. Sessions are keyed by the
//! numeric id the page echoes in its handshake.
//!
//! The server is reference counted: the first `start()` binds the listener,
//! the last `stop()` tears it down. Agents hold a clone of the handle, not a
//! process-global.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::error::{HarnessError, Result};
use crate::host::{BROWSER_HTML, BROWSER_RUNTIME, STACK_PARSER_JS};
use crate::inject::inception;
use crate::result::{ExecutionResult, NormalizedError};

/// How long `wait_for_client` gives a freshly launched browser to complete
/// the socket handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Wire protocol ────────────────────────────────────────────────────────────

/// Frames exchanged with the in-page runtime, JSON-encoded, discriminated by
/// a `type` field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum WireEvent {
    /// Page → server handshake, carrying the session id from the page URL.
    ClientId { id: u32 },
    /// Server → page: evaluate this source.
    Exec { source: String },
    /// Page → server: one `print()` call.
    Print { value: String },
    /// Page → server: the script threw; error already normalized in-page.
    ExecError { error: NormalizedError },
    /// Page → server: evaluation finished (possibly after an `execError`).
    ExecDone,
    /// Page → server: a realm's teardown hook ran. Informational.
    Destroy,
}

// ─── Sessions ─────────────────────────────────────────────────────────────────

#[derive(Default)]
struct ClientSession {
    /// Outbound frames to the page. `None` until the handshake arrives.
    sender: Option<mpsc::UnboundedSender<WireEvent>>,
    /// Bumped on every (re)connect so a superseded socket task can tell it
    /// no longer owns the session.
    generation: u64,
    connect_waiter: Option<oneshot::Sender<()>>,
    result_waiter: Option<oneshot::Sender<ExecutionResult>>,
    pending_result: Option<oneshot::Receiver<ExecutionResult>>,
    stdout: String,
    error: Option<NormalizedError>,
}

impl ClientSession {
    /// Resolve the pending evaluation with whatever has accumulated.
    fn complete(&mut self) {
        let result = ExecutionResult {
            stdout: std::mem::take(&mut self.stdout),
            stderr: String::new(),
            error: self.error.take(),
        };
        if let Some(waiter) = self.result_waiter.take() {
            let _ = waiter.send(result);
        }
    }
}

struct ServerInner {
    host: String,
    port: u16,
    refs: AtomicUsize,
    next_id: AtomicU32,
    sessions: StdMutex<HashMap<u32, ClientSession>>,
    state: Mutex<ListenerState>,
}

#[derive(Default)]
struct ListenerState {
    local_addr: Option<SocketAddr>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

// ─── CoordinationServer ───────────────────────────────────────────────────────

#[derive(Clone)]
pub struct CoordinationServer {
    inner: Arc<ServerInner>,
}

impl CoordinationServer {
    /// Server bound per the agent's web endpoint configuration; unset fields
    /// fall back to loopback and an ephemeral port.
    pub fn from_config(config: &crate::config::AgentConfig) -> Self {
        Self::new(
            config
                .web_host
                .clone()
                .unwrap_or_else(|| "127.0.0.1".to_string()),
            config.web_port.unwrap_or(0),
        )
    }

    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                host: host.into(),
                port,
                refs: AtomicUsize::new(0),
                next_id: AtomicU32::new(1),
                sessions: StdMutex::new(HashMap::new()),
                state: Mutex::new(ListenerState::default()),
            }),
        }
    }

    /// Take a reference; the first caller binds the listener. Binding to
    /// port 0 picks a free port, readable afterwards via [`local_addr`].
    ///
    /// [`local_addr`]: CoordinationServer::local_addr
    pub async fn start(&self) -> Result<()> {
        if self.inner.refs.fetch_add(1, Ordering::SeqCst) > 0 {
            return Ok(());
        }

        let bind = format!("{}:{}", self.inner.host, self.inner.port);
        let listener = tokio::net::TcpListener::bind(&bind).await?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "coordination server listening");

        let router = build_router(self.inner.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            });
            if let Err(err) = serve.await {
                warn!(%err, "coordination server exited with error");
            }
        });

        let mut state = self.inner.state.lock().await;
        state.local_addr = Some(local_addr);
        state.shutdown = Some(shutdown_tx);
        state.task = Some(task);
        Ok(())
    }

    /// Drop a reference; the last caller shuts the listener down and fails
    /// every pending waiter. The count saturates at zero, so a stray stop
    /// (an agent destroyed before it ever initialized) cannot push it
    /// negative and wedge the next `start()`.
    pub async fn stop(&self) -> Result<()> {
        let was_last = self
            .inner
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            == Ok(1);
        if !was_last {
            return Ok(());
        }

        let mut state = self.inner.state.lock().await;
        if let Some(shutdown) = state.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(mut task) = state.task.take() {
            // A page may still hold its socket open; give the graceful drain
            // a moment, then cut it.
            if tokio::time::timeout(Duration::from_millis(500), &mut task)
                .await
                .is_err()
            {
                task.abort();
            }
        }
        state.local_addr = None;

        // Dropping the sessions drops their waiters, which resolves every
        // pending wait as cancelled.
        if let Ok(mut sessions) = self.inner.sessions.lock() {
            sessions.clear();
        }
        info!("coordination server stopped");
        Ok(())
    }

    pub async fn local_addr(&self) -> Result<SocketAddr> {
        self.inner
            .state
            .lock()
            .await
            .local_addr
            .ok_or(HarnessError::ServerNotStarted)
    }

    /// Reserve a session id for one browser agent.
    pub fn allocate_session(&self) -> u32 {
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(id, ClientSession::default());
        id
    }

    pub fn release_session(&self, id: u32) {
        self.inner
            .sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&id);
    }

    /// The URL a browser must navigate to for session `id`.
    pub async fn url_for(&self, id: u32) -> Result<String> {
        let addr = self.local_addr().await?;
        Ok(format!("http://{addr}/?{id}"))
    }

    /// Resolve once the page for `id` completes its socket handshake.
    pub async fn wait_for_client(&self, id: u32, timeout: Duration) -> Result<()> {
        let rx = {
            let mut sessions = self
                .inner
                .sessions
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            let session = sessions
                .get_mut(&id)
                .ok_or(HarnessError::UnknownSession { id })?;
            if session.sender.is_some() {
                return Ok(());
            }
            let (tx, rx) = oneshot::channel();
            session.connect_waiter = Some(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            _ => Err(HarnessError::HandshakeTimeout {
                id,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Push one evaluation to the page: reset the session's buffers, install
    /// the result waiter, send `exec`. Pair with [`wait_for_result`].
    ///
    /// [`wait_for_result`]: CoordinationServer::wait_for_result
    pub fn exec(&self, id: u32, source: String) -> Result<()> {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let session = sessions
            .get_mut(&id)
            .ok_or(HarnessError::UnknownSession { id })?;
        let sender = session
            .sender
            .as_ref()
            .ok_or(HarnessError::ServerNotStarted)?;

        session.stdout.clear();
        session.error = None;
        let (tx, rx) = oneshot::channel();
        session.result_waiter = Some(tx);
        session.pending_result = Some(rx);

        sender
            .send(WireEvent::Exec { source })
            .map_err(|_| HarnessError::ServerNotStarted)?;
        Ok(())
    }

    /// Await the `execDone` of the evaluation pushed by the last [`exec`].
    /// A session torn down mid-flight resolves as an empty result, matching
    /// cancellation semantics everywhere else.
    ///
    /// [`exec`]: CoordinationServer::exec
    pub async fn wait_for_result(&self, id: u32) -> Result<ExecutionResult> {
        let rx = {
            let mut sessions = self
                .inner
                .sessions
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            sessions
                .get_mut(&id)
                .ok_or(HarnessError::UnknownSession { id })?
                .pending_result
                .take()
                .ok_or(HarnessError::ServerNotStarted)?
        };
        Ok(rx.await.unwrap_or_else(|_| ExecutionResult::empty()))
    }

    /// The browser behind `id` was stopped out from under its page. Behaves
    /// like a synthetic `execDone`: whatever buffered is delivered, so the
    /// waiting caller resolves instead of hanging.
    pub fn client_id_stopped(&self, id: u32) {
        let mut sessions = self
            .inner
            .sessions
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if let Some(session) = sessions.get_mut(&id) {
            session.sender = None;
            session.complete();
        }
    }
}

impl ServerInner {
    /// Register a fresh socket as the transport for session `id`. A page
    /// reload supersedes the previous socket.
    fn attach(&self, id: u32, sender: mpsc::UnboundedSender<WireEvent>) -> Option<u64> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        let session = sessions.get_mut(&id)?;
        session.generation += 1;
        session.sender = Some(sender);
        if let Some(waiter) = session.connect_waiter.take() {
            let _ = waiter.send(());
        }
        Some(session.generation)
    }

    /// Drop the socket for `id`, but only if `generation` still owns it.
    fn detach(&self, id: u32, generation: u64) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(session) = sessions.get_mut(&id) {
            if session.generation == generation {
                session.sender = None;
            }
        }
    }

    /// Apply one page-originated event to its session.
    fn handle_event(&self, id: u32, event: WireEvent) {
        let mut sessions = self.sessions.lock().unwrap_or_else(|p| p.into_inner());
        let Some(session) = sessions.get_mut(&id) else {
            warn!(id, "event for unknown session");
            return;
        };

        match event {
            WireEvent::Print { value } => {
                session.stdout.push_str(&value);
                session.stdout.push('\n');
            }
            WireEvent::ExecError { error } => {
                session.error = Some(error);
            }
            WireEvent::ExecDone => {
                session.complete();
            }
            WireEvent::Destroy => {
                trace!(id, "page realm destroyed");
            }
            WireEvent::ClientId { .. } | WireEvent::Exec { .. } => {
                warn!(id, ?event, "unexpected event direction");
            }
        }
    }
}

// ─── Routes ───────────────────────────────────────────────────────────────────

fn build_router(inner: Arc<ServerInner>) -> Router {
    Router::new()
        .route("/", get(serve_page))
        .route("/runtime.js", get(serve_runtime))
        .route("/error-stack-parser.js", get(serve_stack_parser))
        .route("/socket", get(upgrade_socket))
        .with_state(inner)
}

async fn serve_page() -> Html<&'static str> {
    Html(BROWSER_HTML)
}

/// The in-page runtime, with its own escaped source embedded so iframe
/// realms can bootstrap. Served verbatim otherwise: line numbers in browser
/// stacks should point into readable source.
async fn serve_runtime() -> impl IntoResponse {
    (
        [("content-type", "application/javascript")],
        inception(BROWSER_RUNTIME),
    )
}

async fn serve_stack_parser() -> impl IntoResponse {
    ([("content-type", "application/javascript")], STACK_PARSER_JS)
}

async fn upgrade_socket(
    State(inner): State<Arc<ServerInner>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(inner, socket))
}

async fn handle_socket(inner: Arc<ServerInner>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    // First frame must be the clientId handshake; anything else is not one
    // of our pages.
    let id = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => match serde_json::from_str(text.as_str()) {
                Ok(WireEvent::ClientId { id }) => break id,
                Ok(other) => {
                    warn!(?other, "expected clientId handshake");
                    return;
                }
                Err(err) => {
                    warn!(%err, "unparseable handshake frame");
                    return;
                }
            },
            Some(Ok(Message::Ping(_))) => continue,
            _ => return,
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<WireEvent>();
    let Some(generation) = inner.attach(id, tx) else {
        warn!(id, "handshake for unallocated session");
        return;
    };
    debug!(id, generation, "browser client connected");

    loop {
        tokio::select! {
            outbound = rx.recv() => {
                let Some(event) = outbound else { break };
                let json = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(err) => {
                        warn!(%err, "unencodable outbound event");
                        continue;
                    }
                };
                if sink.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<WireEvent>(text.as_str()) {
                            Ok(event) => inner.handle_event(id, event),
                            Err(err) => warn!(id, %err, "unparseable frame"),
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        warn!(id, %err, "socket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    inner.detach(id, generation);
    debug!(id, "browser client disconnected");
}

// ─── Tests ────────────────────────────────────────────────────────────────────
