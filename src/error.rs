use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, HarnessError>;

/// Infrastructure failures reject the `eval_script` future; anything the
/// script itself did wrong (uncaught errors, unparseable output, cancellation)
/// resolves with a structured [`ExecutionResult`](crate::ExecutionResult)
/// instead.
#[derive(Debug, Error)]
pub enum HarnessError {
    /// The host subprocess could not be created, even after one retry.
    #[error("failed to spawn host process {path:?}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Staging a source file to the working directory failed.
    #[error("failed to stage source file {path:?}: {source}")]
    Stage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The host name is not in the static registry.
    #[error("unknown host type {name:?} (supported: {supported})")]
    UnknownHost { name: String, supported: String },

    /// A browser-driven host was handed to a console constructor.
    #[error("host {name:?} is browser-driven; construct a browser agent for it")]
    NotAConsoleHost { name: String },

    /// A console-driven host was handed to a browser constructor.
    #[error("host {name:?} is console-driven; construct a console agent for it")]
    NotABrowserHost { name: String },

    /// A required configuration field was absent at construction time.
    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    /// No browser page completed the socket handshake within the bound.
    #[error("browser client {id} did not connect within {timeout_ms}ms")]
    HandshakeTimeout { id: u32, timeout_ms: u64 },

    /// The coordination server has no listener (agent not initialized, or
    /// already torn down).
    #[error("coordination server is not running")]
    ServerNotStarted,

    /// An operation referenced a session id the server never allocated, or
    /// one that was already released.
    #[error("no browser session with id {id}")]
    UnknownSession { id: u32 },

    /// A WebDriver endpoint returned a failure or could not be reached.
    #[error("webdriver request failed: {0}")]
    WebDriver(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
