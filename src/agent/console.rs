//! Console-host agent: one subprocess per evaluation.
//!
//! Every call walks an explicit state machine
//! (`Idle → Compiling → Staging → Spawning → Running → Collecting → Idle`)
//! and `stop()` is valid at any point in it. Cancellation never rejects the
//! in-flight call: a stopped evaluation resolves with
//! [`ExecutionResult::empty`], whether the kill landed before or after the
//! process existed.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Mutex as StdMutex;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::agent::{compile_source, Agent};
use crate::config::{AgentConfig, EvalInput, EvalOptions, NegativePhase};
use crate::deps::{has_module_specifier, DependencyResolver};
use crate::error::{HarnessError, Result};
use crate::host::{HostKind, HostProfile};
use crate::inject::prepare_runtime;
use crate::result::ExecutionResult;
use crate::stage::{remove_sources, unique_entry_name, write_sources, SourceSet};

// ─── Phase ────────────────────────────────────────────────────────────────────

/// Where the current evaluation stands. `stop()` consults this to report
/// whether it interrupted anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Compiling = 1,
    Staging = 2,
    Spawning = 3,
    Running = 4,
    Collecting = 5,
}

impl Phase {
    fn from_u8(raw: u8) -> Phase {
        match raw {
            1 => Phase::Compiling,
            2 => Phase::Staging,
            3 => Phase::Spawning,
            4 => Phase::Running,
            5 => Phase::Collecting,
            _ => Phase::Idle,
        }
    }
}

// ─── ConsoleAgent ─────────────────────────────────────────────────────────────

pub struct ConsoleAgent {
    kind: HostKind,
    profile: &'static HostProfile,
    config: AgentConfig,
    /// Shim already comment-stripped, flattened, incepted and renamed.
    runtime: Option<String>,
    out_dir: PathBuf,
    /// Keeps a harness-created working directory alive for the agent's
    /// lifetime. `None` when the caller supplied `out`.
    _owned_out: Option<tempfile::TempDir>,
    resolver: StdMutex<DependencyResolver>,

    /// Serializes evaluations; `stop()` deliberately does not take it.
    eval_lock: Mutex<()>,
    phase: AtomicU8,
    /// Armed by `stop()`, consumed when the cancelled call delivers its
    /// empty result. Arming is independent of the evaluation future's
    /// progress, so a stop issued right after dispatch — before the future
    /// is first polled — still suppresses the spawn.
    cancelled: AtomicBool,
    /// The live subprocess, if one exists. Spawning happens while holding
    /// this lock so `stop()` either suppresses the spawn or finds the child.
    current_child: Mutex<Option<Child>>,
}

impl ConsoleAgent {
    pub fn new(kind: HostKind, config: AgentConfig) -> Result<Self> {
        if kind.is_browser() {
            return Err(HarnessError::NotAConsoleHost {
                name: kind.profile().name.to_string(),
            });
        }
        if config.host_path.as_os_str().is_empty() {
            return Err(HarnessError::MissingConfig("host_path"));
        }

        let profile = kind.profile();
        let runtime = profile
            .runtime
            .map(|raw| prepare_runtime(raw, config.binding_name()));

        let (out_dir, owned_out) = match &config.out {
            Some(dir) => (dir.clone(), None),
            None => {
                let tmp = tempfile::tempdir()?;
                (tmp.path().to_path_buf(), Some(tmp))
            }
        };

        Ok(Self {
            kind,
            profile,
            config,
            runtime,
            out_dir,
            _owned_out: owned_out,
            resolver: StdMutex::new(DependencyResolver::new()),
            eval_lock: Mutex::new(()),
            phase: AtomicU8::new(Phase::Idle as u8),
            cancelled: AtomicBool::new(false),
            current_child: Mutex::new(None),
        })
    }

    pub fn kind(&self) -> HostKind {
        self.kind
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.store(phase as u8, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Resolve and finish a cancelled call: staged files gone, the
    /// cancellation consumed, state reset, empty result out.
    async fn finish_cancelled(&self, sources: &SourceSet) -> Result<ExecutionResult> {
        remove_sources(sources).await;
        self.cancelled.store(false, Ordering::SeqCst);
        self.set_phase(Phase::Idle);
        debug!(host = self.profile.name, "evaluation cancelled");
        Ok(ExecutionResult::empty())
    }

    fn spawn_once(&self, args: &[String]) -> std::io::Result<Child> {
        Command::new(&self.config.host_path)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
    }

    /// Spawn with a single retry. Transient failures (fd exhaustion under a
    /// parallel runner) often clear immediately; a second failure rejects
    /// with the original error.
    fn spawn_with_retry(&self, args: &[String]) -> Result<Child> {
        match self.spawn_once(args) {
            Ok(child) => Ok(child),
            Err(first) => {
                warn!(
                    host = self.profile.name,
                    path = %self.config.host_path.display(),
                    %first,
                    "spawn failed, retrying once"
                );
                self.spawn_once(args).map_err(|_| HarnessError::Spawn {
                    path: self.config.host_path.clone(),
                    source: first,
                })
            }
        }
    }

    /// Stage the entry point plus, in module mode, every transitively
    /// imported same-directory file (resolved against the record's original
    /// location, written next to the entry point).
    fn stage_set(&self, plan: &CallPlan, compiled: String) -> SourceSet {
        let entry = self.out_dir.join(unique_entry_name());
        let mut sources = SourceSet::new(entry, compiled);

        if plan.scan_deps {
            if let Some(file) = &plan.file {
                let mut resolver = match self.resolver.lock() {
                    Ok(resolver) => resolver,
                    Err(poisoned) => poisoned.into_inner(),
                };
                for dep in resolver.resolve(file) {
                    if let Some(raw) = resolver.raw_source(&dep) {
                        sources.push(self.out_dir.join(&dep), raw.to_string());
                    }
                }
            }
        }
        sources
    }

    fn build_args(&self, plan: &CallPlan, options: &EvalOptions, entry: &std::path::Path) -> Vec<String> {
        let eval_options = EvalOptions {
            module: plan.module,
            ..options.clone()
        };
        let mut args = self.config.host_arguments.clone();
        args.extend((self.profile.eval_args)(&eval_options));
        args.extend(options.test_host_args.iter().cloned());
        args.push(entry.to_string_lossy().into_owned());
        args
    }
}

#[async_trait::async_trait]
impl Agent for ConsoleAgent {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn compile(&self, code: &str, options: &EvalOptions) -> String {
        compile_source(&self.config, self.runtime.as_deref(), code, options)
    }

    async fn eval_script(&self, input: EvalInput, options: EvalOptions) -> Result<ExecutionResult> {
        let _guard = self.eval_lock.lock().await;

        self.set_phase(Phase::Compiling);
        let plan = CallPlan::from_input(input, &options);
        let compiled = if plan.raw {
            plan.source.clone()
        } else {
            self.compile(&plan.source, &options)
        };

        self.set_phase(Phase::Staging);
        let sources = self.stage_set(&plan, compiled);
        if self.is_cancelled() {
            return self.finish_cancelled(&sources).await;
        }
        if let Err(err) = write_sources(&sources).await {
            // A partial set may already be on disk.
            remove_sources(&sources).await;
            self.set_phase(Phase::Idle);
            return Err(err);
        }
        if self.is_cancelled() {
            return self.finish_cancelled(&sources).await;
        }

        self.set_phase(Phase::Spawning);
        let args = self.build_args(&plan, &options, sources.entry());
        trace!(host = self.profile.name, ?args, "spawning host");

        // Spawn under the child lock: stop() takes the same lock, so it
        // either sets `cancelled` before we check it here (spawn suppressed)
        // or observes the stored child and kills it.
        let (stdout_pipe, stderr_pipe) = {
            let mut slot = self.current_child.lock().await;
            if self.is_cancelled() {
                drop(slot);
                return self.finish_cancelled(&sources).await;
            }
            let mut child = match self.spawn_with_retry(&args) {
                Ok(child) => child,
                Err(err) => {
                    remove_sources(&sources).await;
                    self.set_phase(Phase::Idle);
                    return Err(err);
                }
            };
            let stdout = child.stdout.take();
            let stderr = child.stderr.take();
            *slot = Some(child);
            (stdout, stderr)
        };

        self.set_phase(Phase::Running);
        let (stdout, stderr) = tokio::join!(drain(stdout_pipe), drain(stderr_pipe));

        // Pipes are at EOF, so the process has exited (or been killed) and
        // the wait below returns immediately without holding up stop().
        self.set_phase(Phase::Collecting);
        let status = {
            let mut slot = self.current_child.lock().await;
            match slot.take() {
                Some(mut child) => Some(child.wait().await?),
                None => None,
            }
        };

        if self.is_cancelled() {
            return self.finish_cancelled(&sources).await;
        }
        remove_sources(&sources).await;

        let mut result = ExecutionResult {
            stdout,
            stderr,
            error: None,
        };

        #[cfg(unix)]
        if let Some(status) = status {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                // SIGKILL is the harness's own stop(); anything else is the
                // host dying unexpectedly and belongs in the diagnostics.
                if signal != libc::SIGKILL {
                    result
                        .stderr
                        .push_str(&format!("\nhost terminated by signal {signal}\n"));
                }
            }
        }
        #[cfg(not(unix))]
        let _ = status;

        self.profile.parser.normalize_result(&mut result);
        result.error = self.profile.parser.parse(&result.stderr);

        self.set_phase(Phase::Idle);
        Ok(result)
    }

    async fn stop(&self) -> Result<bool> {
        self.cancelled.store(true, Ordering::SeqCst);
        let mut slot = self.current_child.lock().await;
        let interrupted = slot.is_some() || self.phase() != Phase::Idle;

        if let Some(child) = slot.as_mut() {
            // Forceful and immediate; the eval task reaps after pipe EOF.
            if let Err(err) = child.start_kill() {
                trace!(%err, "kill raced with process exit");
            }
        }
        Ok(interrupted)
    }

    async fn destroy(&self) -> Result<()> {
        self.stop().await?;
        Ok(())
    }
}

async fn drain<R: AsyncRead + Unpin>(pipe: Option<R>) -> String {
    let mut buf = Vec::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_end(&mut buf).await;
    }
    String::from_utf8_lossy(&buf).into_owned()
}

// ─── CallPlan ─────────────────────────────────────────────────────────────────

/// Everything one evaluation needs, extracted from the input up front.
struct CallPlan {
    source: String,
    file: Option<PathBuf>,
    raw: bool,
    module: bool,
    /// Dependency scanning is pointless for raw sources and wrong for
    /// sources that are expected not to parse.
    scan_deps: bool,
}

impl CallPlan {
    fn from_input(input: EvalInput, options: &EvalOptions) -> CallPlan {
        match input {
            EvalInput::Source(source) => {
                let module = options.module || has_module_specifier(&source);
                CallPlan {
                    source,
                    file: None,
                    raw: false,
                    module,
                    scan_deps: false,
                }
            }
            EvalInput::Record(record) => {
                let raw = record.attrs.flags.raw;
                let module = record.attrs.flags.module || options.module;
                let expected_unparseable = record
                    .attrs
                    .negative
                    .as_ref()
                    .is_some_and(|n| n.phase == NegativePhase::Parse);
                let scan_deps = module
                    && !raw
                    && !expected_unparseable
                    && has_module_specifier(&record.contents);
                CallPlan {
                    source: record.contents,
                    file: Some(record.file),
                    raw,
                    module,
                    scan_deps,
                }
            }
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
