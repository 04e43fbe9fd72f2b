//! Multi-engine JavaScript execution harness.
//!
//! Runs the same script across disparate JavaScript hosts (console binaries
//! like `d8`, `jsc` and the SpiderMonkey shell, plus browsers) and reports
//! one normalized outcome per run: stdout, stderr, and an uncaught error
//! reconstructed into a structured record.
//!
//! ```no_run
//! use jshost::{Agent, AgentConfig, ConsoleAgent, EvalOptions, HostKind};
//!
//! # async fn run() -> jshost::Result<()> {
//! let agent = ConsoleAgent::new(
//!     HostKind::V8,
//!     AgentConfig::new("/usr/local/bin/d8"),
//! )?;
//! agent.initialize().await?;
//! let result = agent
//!     .eval_script("print('hello');".into(), EvalOptions::default())
//!     .await?;
//! assert_eq!(result.stdout, "hello\n");
//! agent.destroy().await?;
//! # Ok(())
//! # }
//! ```

pub mod agent;
pub mod config;
pub mod deps;
pub mod error;
pub mod host;
pub mod inject;
pub mod parse_error;
pub mod result;
pub mod server;
pub mod stage;

pub use agent::{Agent, BrowserAgent, ConsoleAgent, Phase, WebdriverAgent};
pub use config::{
    AgentConfig, EvalInput, EvalOptions, HostArguments, NegativeExpectation, NegativePhase,
    TestAttrs, TestFlags, TestRecord,
};
pub use error::{HarnessError, Result};
pub use host::{HostKind, HostProfile, SUPPORTED_HOSTS};
pub use result::{ExecutionResult, NormalizedError, StackFrame};
pub use server::{CoordinationServer, WireEvent};
