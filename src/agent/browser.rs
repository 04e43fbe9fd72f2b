//! Browser-driven agents.
//!
//! Both flavors evaluate through the shared [`CoordinationServer`]: the page
//! holds a WebSocket open, the agent pushes compiled source down it and
//! collects the buffered result. What differs is who owns the browser —
//! [`BrowserAgent`] spawns a local binary and points it at the session URL;
//! [`WebdriverAgent`] drives a remote browser through a classic WebDriver
//! endpoint and never spawns anything itself.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::agent::{compile_source, Agent};
use crate::config::{AgentConfig, EvalInput, EvalOptions};
use crate::error::{HarnessError, Result};
use crate::host::HostKind;
use crate::result::ExecutionResult;
use crate::server::{CoordinationServer, DEFAULT_HANDSHAKE_TIMEOUT};

// ─── Shared session plumbing ──────────────────────────────────────────────────

/// State both browser agent flavors keep per session.
struct BrowserSession {
    server: CoordinationServer,
    config: AgentConfig,
    session_id: Mutex<Option<u32>>,
    evaluating: AtomicBool,
    cancelled: AtomicBool,
}

impl BrowserSession {
    fn new(server: CoordinationServer, config: AgentConfig) -> Self {
        Self {
            server,
            config,
            session_id: Mutex::new(None),
            evaluating: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    async fn open(&self) -> Result<u32> {
        self.server.start().await?;
        let id = self.server.allocate_session();
        *self.session_id.lock().await = Some(id);
        Ok(id)
    }

    async fn session_id(&self) -> Result<u32> {
        self.session_id
            .lock()
            .await
            .ok_or(HarnessError::ServerNotStarted)
    }

    fn compile(&self, code: &str, options: &EvalOptions) -> String {
        // No shim splice: the page loads /runtime.js itself.
        compile_source(&self.config, None, code, options)
    }

    fn prepare(&self, input: EvalInput, options: &EvalOptions) -> String {
        match input {
            EvalInput::Source(source) => self.compile(&source, options),
            EvalInput::Record(record) => {
                if record.attrs.flags.raw {
                    record.contents
                } else {
                    self.compile(&record.contents, options)
                }
            }
        }
    }

    async fn eval(&self, input: EvalInput, options: EvalOptions) -> Result<ExecutionResult> {
        self.cancelled.store(false, Ordering::SeqCst);
        let id = self.session_id().await?;
        let compiled = self.prepare(input, &options);

        self.evaluating.store(true, Ordering::SeqCst);
        self.server.exec(id, compiled)?;
        let result = self.server.wait_for_result(id).await;
        self.evaluating.store(false, Ordering::SeqCst);

        if self.cancelled.load(Ordering::SeqCst) {
            debug!(id, "browser evaluation cancelled");
            return Ok(ExecutionResult::empty());
        }
        result
    }

    /// Mark the in-flight evaluation cancelled and unblock its waiter.
    /// Returns whether anything was actually interrupted.
    fn interrupt(&self, id: u32) -> bool {
        self.cancelled.store(true, Ordering::SeqCst);
        let interrupted = self.evaluating.load(Ordering::SeqCst);
        self.server.client_id_stopped(id);
        interrupted
    }

    /// Release the server reference taken by `open`. Destroying an agent
    /// that never initialized (or destroying twice) must not decrement a
    /// reference it does not hold.
    async fn close(&self) -> Result<()> {
        if let Some(id) = self.session_id.lock().await.take() {
            self.server.client_id_stopped(id);
            self.server.release_session(id);
            self.server.stop().await?;
        }
        Ok(())
    }
}

fn require_browser_kind(kind: HostKind) -> Result<()> {
    if kind.is_browser() {
        Ok(())
    } else {
        Err(HarnessError::NotABrowserHost {
            name: kind.profile().name.to_string(),
        })
    }
}

// ─── BrowserAgent ─────────────────────────────────────────────────────────────

/// Drives a locally installed browser binary. The browser process is crude
/// state: stopping an evaluation means killing and relaunching it, since a
/// page stuck in `while(true)` never yields to a socket frame.
pub struct BrowserAgent {
    session: BrowserSession,
    child: Mutex<Option<Child>>,
}

impl BrowserAgent {
    pub fn new(kind: HostKind, config: AgentConfig, server: CoordinationServer) -> Result<Self> {
        require_browser_kind(kind)?;
        if config.host_path.as_os_str().is_empty() {
            return Err(HarnessError::MissingConfig("host_path"));
        }
        Ok(Self {
            session: BrowserSession::new(server, config),
            child: Mutex::new(None),
        })
    }

    fn launch(&self, url: &str) -> Result<Child> {
        let config = &self.session.config;
        trace!(path = %config.host_path.display(), url, "launching browser");
        Command::new(&config.host_path)
            .args(&config.host_arguments)
            .arg(url)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HarnessError::Spawn {
                path: config.host_path.clone(),
                source,
            })
    }

    /// Kill the current browser, relaunch it at the session URL, and wait
    /// for the fresh page to complete its handshake.
    async fn restart(&self, id: u32) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Some(mut proc) = child.take() {
            if let Err(err) = proc.start_kill() {
                trace!(%err, "browser kill raced with exit");
            }
            let _ = proc.wait().await;
        }

        let url = self.session.server.url_for(id).await?;
        *child = Some(self.launch(&url)?);
        drop(child);
        self.session
            .server
            .wait_for_client(id, DEFAULT_HANDSHAKE_TIMEOUT)
            .await
    }
}

#[async_trait::async_trait]
impl Agent for BrowserAgent {
    async fn initialize(&self) -> Result<()> {
        let id = self.session.open().await?;
        self.restart(id).await
    }

    fn compile(&self, code: &str, options: &EvalOptions) -> String {
        self.session.compile(code, options)
    }

    async fn eval_script(&self, input: EvalInput, options: EvalOptions) -> Result<ExecutionResult> {
        self.session.eval(input, options).await
    }

    async fn stop(&self) -> Result<bool> {
        let id = match *self.session.session_id.lock().await {
            Some(id) => id,
            None => return Ok(false),
        };
        let interrupted = self.session.interrupt(id);
        self.restart(id).await?;
        Ok(interrupted)
    }

    async fn destroy(&self) -> Result<()> {
        let mut child = self.child.lock().await;
        if let Some(mut proc) = child.take() {
            if let Err(err) = proc.start_kill() {
                trace!(%err, "browser kill raced with exit");
            }
            let _ = proc.wait().await;
        }
        drop(child);
        self.session.close().await
    }
}

// ─── WebDriver ────────────────────────────────────────────────────────────────

/// Minimal classic-WebDriver client: create a session, navigate it, delete
/// it. Anything richer belongs to a real client crate; these three calls are
/// all this harness needs.
pub struct WebDriverClient {
    http: reqwest::Client,
    endpoint: String,
    session: Mutex<Option<String>>,
}

impl WebDriverClient {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            session: Mutex::new(None),
        }
    }

    pub async fn create_session(&self, capabilities: serde_json::Value) -> Result<()> {
        let body = serde_json::json!({ "capabilities": { "alwaysMatch": capabilities } });
        let response: serde_json::Value = self
            .http
            .post(format!("{}/session", self.endpoint))
            .json(&body)
            .send()
            .await
            .map_err(|err| HarnessError::WebDriver(err.to_string()))?
            .json()
            .await
            .map_err(|err| HarnessError::WebDriver(err.to_string()))?;

        let session_id = response
            .pointer("/value/sessionId")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| {
                HarnessError::WebDriver(format!("no sessionId in response: {response}"))
            })?;
        *self.session.lock().await = Some(session_id.to_string());
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<()> {
        let session = self.session_id().await?;
        self.http
            .post(format!("{}/session/{session}/url", self.endpoint))
            .json(&serde_json::json!({ "url": url }))
            .send()
            .await
            .map_err(|err| HarnessError::WebDriver(err.to_string()))?
            .error_for_status()
            .map_err(|err| HarnessError::WebDriver(err.to_string()))?;
        Ok(())
    }

    pub async fn delete_session(&self) -> Result<()> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        self.http
            .delete(format!("{}/session/{session}", self.endpoint))
            .send()
            .await
            .map_err(|err| HarnessError::WebDriver(err.to_string()))?;
        Ok(())
    }

    async fn session_id(&self) -> Result<String> {
        self.session
            .lock()
            .await
            .clone()
            .ok_or_else(|| HarnessError::WebDriver("no active webdriver session".to_string()))
    }
}

/// Standard capabilities for a browser kind. `Remote` supplies nothing; the
/// caller's capabilities decide everything.
pub fn default_capabilities(kind: HostKind) -> serde_json::Value {
    let browser = match kind {
        HostKind::Chrome => Some("chrome"),
        HostKind::Firefox => Some("firefox"),
        HostKind::Safari => Some("safari"),
        HostKind::Edge => Some("MicrosoftEdge"),
        _ => None,
    };
    match browser {
        Some(name) => serde_json::json!({ "browserName": name }),
        None => serde_json::json!({}),
    }
}

// ─── WebdriverAgent ───────────────────────────────────────────────────────────

/// Browser agent over a WebDriver endpoint. Stop does not kill anything:
/// re-navigating to the session URL discards the stuck page, and the fresh
/// page handshakes again.
pub struct WebdriverAgent {
    session: BrowserSession,
    driver: WebDriverClient,
    capabilities: serde_json::Value,
}

impl WebdriverAgent {
    pub fn new(
        kind: HostKind,
        config: AgentConfig,
        server: CoordinationServer,
        endpoint: impl Into<String>,
        capabilities: Option<serde_json::Value>,
    ) -> Result<Self> {
        require_browser_kind(kind)?;
        let capabilities = capabilities.unwrap_or_else(|| default_capabilities(kind));
        Ok(Self {
            session: BrowserSession::new(server, config),
            driver: WebDriverClient::new(endpoint),
            capabilities,
        })
    }

    async fn reload(&self, id: u32) -> Result<()> {
        let url = self.session.server.url_for(id).await?;
        self.driver.navigate(&url).await?;
        self.session
            .server
            .wait_for_client(id, DEFAULT_HANDSHAKE_TIMEOUT)
            .await
    }
}

#[async_trait::async_trait]
impl Agent for WebdriverAgent {
    async fn initialize(&self) -> Result<()> {
        let id = self.session.open().await?;
        self.driver.create_session(self.capabilities.clone()).await?;
        self.reload(id).await
    }

    fn compile(&self, code: &str, options: &EvalOptions) -> String {
        self.session.compile(code, options)
    }

    async fn eval_script(&self, input: EvalInput, options: EvalOptions) -> Result<ExecutionResult> {
        self.session.eval(input, options).await
    }

    async fn stop(&self) -> Result<bool> {
        let id = match *self.session.session_id.lock().await {
            Some(id) => id,
            None => return Ok(false),
        };
        let interrupted = self.session.interrupt(id);
        self.reload(id).await?;
        Ok(interrupted)
    }

    async fn destroy(&self) -> Result<()> {
        if let Err(err) = self.driver.delete_session().await {
            warn!(%err, "webdriver session teardown failed");
        }
        self.session.close().await
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> CoordinationServer {
        CoordinationServer::new("127.0.0.1", 0)
    }

    #[test]
    fn console_kind_is_rejected() {
        let result = BrowserAgent::new(HostKind::Node, AgentConfig::new("/bin/true"), server());
        assert!(matches!(result, Err(HarnessError::NotABrowserHost { .. })));
    }

    #[test]
    fn browser_agent_requires_a_binary_path() {
        let result = BrowserAgent::new(HostKind::Chrome, AgentConfig::default(), server());
        assert!(matches!(result, Err(HarnessError::MissingConfig("host_path"))));
    }

    #[test]
    fn compile_appends_teardown_but_no_shim() {
        let agent =
            BrowserAgent::new(HostKind::Chrome, AgentConfig::new("/bin/true"), server()).unwrap();
        let out = agent.compile("print(1);", &EvalOptions::default());
        assert_eq!(out, "print(1);\n;$262.destroy();");
    }

    #[test]
    fn capability_defaults_name_the_browser() {
        assert_eq!(
            default_capabilities(HostKind::Edge)["browserName"],
            "MicrosoftEdge"
        );
        assert_eq!(default_capabilities(HostKind::Remote), serde_json::json!({}));
    }

    #[tokio::test]
    async fn stop_without_initialize_is_a_no_op() {
        let agent =
            BrowserAgent::new(HostKind::Chrome, AgentConfig::new("/bin/true"), server()).unwrap();
        assert!(!agent.stop().await.unwrap());
    }

    #[tokio::test]
    async fn destroy_without_initialize_leaves_the_server_usable() {
        let server = server();
        let agent = BrowserAgent::new(
            HostKind::Chrome,
            AgentConfig::new("/bin/true"),
            server.clone(),
        )
        .unwrap();
        agent.destroy().await.unwrap();
        agent.destroy().await.unwrap();

        // The stray destroys held no reference, so the count is untouched
        // and the next start still binds a listener.
        server.start().await.unwrap();
        assert!(server.local_addr().await.is_ok());
        server.stop().await.unwrap();
    }
}
