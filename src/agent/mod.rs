//! The agent capability contract and the shared compile pipeline.
//!
//! An agent owns one host environment and exposes the same five operations
//! regardless of whether the host is a console binary or a browser page:
//! initialize, compile, evaluate, stop, destroy. Engine differences live in
//! [`HostProfile`](crate::host::HostProfile) data, not in per-engine
//! subclasses.

pub mod browser;
pub mod console;

use async_trait::async_trait;

use crate::config::{AgentConfig, EvalInput, EvalOptions};
use crate::error::Result;
use crate::inject;
use crate::result::ExecutionResult;

pub use browser::{BrowserAgent, WebdriverAgent};
pub use console::{ConsoleAgent, Phase};

#[async_trait]
pub trait Agent: Send + Sync {
    /// One-time setup. Console hosts need none; browser hosts start the
    /// coordination server and wait for the page handshake here.
    async fn initialize(&self) -> Result<()>;

    /// Pure source preparation: user transform, environment-teardown call,
    /// runtime-shim splice. No I/O, no state.
    fn compile(&self, code: &str, options: &EvalOptions) -> String;

    /// Evaluate one script. Rejects only on infrastructure failure; whatever
    /// the script itself does (throws, prints, gets cancelled) resolves as an
    /// [`ExecutionResult`].
    async fn eval_script(&self, input: EvalInput, options: EvalOptions) -> Result<ExecutionResult>;

    /// Cancel the in-flight evaluation, if any. Valid in every state; returns
    /// whether an evaluation was actually interrupted.
    async fn stop(&self) -> Result<bool>;

    /// Tear the host environment down. The agent must not be used afterwards.
    async fn destroy(&self) -> Result<()>;
}

/// The one compile pipeline both agent families share.
///
/// Order matters only at the ends: the user transform sees the bare source,
/// and injection happens last so the shim lands ahead of everything else.
/// `prepared_runtime` is a shim already passed through
/// [`inject::prepare_runtime`]; `None` (browser hosts, raw mode) skips the
/// splice.
pub(crate) fn compile_source(
    config: &AgentConfig,
    prepared_runtime: Option<&str>,
    code: &str,
    options: &EvalOptions,
) -> String {
    let code = match &config.transform {
        Some(f) => f(code.to_string()),
        None => code.to_string(),
    };

    // Async-capable code signals completion itself; everything else gets an
    // appended teardown call so the host process exits.
    let code = if options.is_async {
        code
    } else {
        format!("{code}\n;{}.destroy();", config.binding_name())
    };

    match prepared_runtime {
        Some(runtime) => inject::inject(&code, runtime),
        None => code,
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn appends_teardown_with_configured_binding() {
        let config = AgentConfig::new("/bin/true").short_name("$t");
        let out = compile_source(&config, None, "print(1);", &EvalOptions::default());
        assert!(out.ends_with("\n;$t.destroy();"));
    }

    #[test]
    fn async_code_gets_no_teardown() {
        let config = AgentConfig::new("/bin/true");
        let options = EvalOptions {
            is_async: true,
            ..Default::default()
        };
        let out = compile_source(&config, None, "print(1);", &options);
        assert_eq!(out, "print(1);");
    }

    #[test]
    fn transform_runs_before_everything_else() {
        let config = AgentConfig::new("/bin/true")
            .transform(Arc::new(|code| code.replace("AAA", "BBB")));
        let out = compile_source(&config, Some("SHIM;"), "AAA();", &EvalOptions::default());
        assert!(out.starts_with("SHIM;"));
        assert!(out.contains("BBB();"));
        assert!(!out.contains("AAA"));
    }

    #[test]
    fn runtime_lands_ahead_of_the_source() {
        let config = AgentConfig::new("/bin/true");
        let out = compile_source(&config, Some("var $262={};"), "work();", &EvalOptions::default());
        let shim = out.find("var $262={};").unwrap();
        let work = out.find("work();").unwrap();
        assert!(shim < work);
    }
}
