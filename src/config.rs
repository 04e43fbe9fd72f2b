use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Source transformation applied before any other compile step.
pub type TransformFn = Arc<dyn Fn(String) -> String + Send + Sync>;

/// Default name of the reserved binding the runtime shim installs.
pub const DEFAULT_SHORT_NAME: &str = "$262";

// ─── AgentConfig ──────────────────────────────────────────────────────────────

/// Construction-time agent configuration. Immutable once the agent exists.
#[derive(Clone, Default)]
pub struct AgentConfig {
    /// Path to the engine binary. Empty for browser-managed hosts.
    pub host_path: PathBuf,
    /// Arguments passed to the host on every spawn.
    pub host_arguments: Vec<String>,
    /// Name the reserved runtime binding is renamed to.
    pub short_name: String,
    /// Applied to source before any other compile step. Identity if `None`.
    pub transform: Option<TransformFn>,
    /// Working directory for staged sources. A fresh unique temp directory
    /// is created when unset.
    pub out: Option<PathBuf>,
    /// Browser mode only: interface the coordination server binds.
    pub web_host: Option<String>,
    /// Browser mode only: port the coordination server binds.
    pub web_port: Option<u16>,
}

impl AgentConfig {
    pub fn new(host_path: impl Into<PathBuf>) -> Self {
        Self {
            host_path: host_path.into(),
            short_name: DEFAULT_SHORT_NAME.to_string(),
            ..Self::default()
        }
    }

    /// Accepts either a raw whitespace-separated string or a prepared list.
    pub fn host_arguments(mut self, args: impl Into<HostArguments>) -> Self {
        self.host_arguments = args.into().into_vec();
        self
    }

    pub fn short_name(mut self, name: impl Into<String>) -> Self {
        self.short_name = name.into();
        self
    }

    pub fn transform(mut self, f: TransformFn) -> Self {
        self.transform = Some(f);
        self
    }

    pub fn out(mut self, dir: impl Into<PathBuf>) -> Self {
        self.out = Some(dir.into());
        self
    }

    pub fn web_endpoint(mut self, host: impl Into<String>, port: u16) -> Self {
        self.web_host = Some(host.into());
        self.web_port = Some(port);
        self
    }

    /// The short name, falling back to the default when configured empty.
    pub fn binding_name(&self) -> &str {
        if self.short_name.is_empty() {
            DEFAULT_SHORT_NAME
        } else {
            &self.short_name
        }
    }
}

impl fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentConfig")
            .field("host_path", &self.host_path)
            .field("host_arguments", &self.host_arguments)
            .field("short_name", &self.short_name)
            .field("transform", &self.transform.as_ref().map(|_| "<fn>"))
            .field("out", &self.out)
            .field("web_host", &self.web_host)
            .field("web_port", &self.web_port)
            .finish()
    }
}

/// Host arguments as callers hand them over: a raw string that still needs
/// tokenizing, or an already-split list.
#[derive(Debug, Clone)]
pub enum HostArguments {
    Raw(String),
    List(Vec<String>),
}

impl HostArguments {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            HostArguments::Raw(s) => tokenize_host_arguments(&s),
            HostArguments::List(v) => v,
        }
    }
}

impl From<&str> for HostArguments {
    fn from(s: &str) -> Self {
        HostArguments::Raw(s.to_string())
    }
}

impl From<String> for HostArguments {
    fn from(s: String) -> Self {
        HostArguments::Raw(s)
    }
}

impl From<Vec<String>> for HostArguments {
    fn from(v: Vec<String>) -> Self {
        HostArguments::List(v)
    }
}

impl From<&[&str]> for HostArguments {
    fn from(v: &[&str]) -> Self {
        HostArguments::List(v.iter().map(|s| s.to_string()).collect())
    }
}

/// Split a raw argument string on whitespace, dropping empty entries so
/// irregular or repeated spacing is tolerated.
pub fn tokenize_host_arguments(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

// ─── EvalOptions ──────────────────────────────────────────────────────────────

/// Per-call evaluation options.
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    /// The code terminates its own environment (it calls the reserved
    /// binding's `destroy` itself); the harness must not append one.
    pub is_async: bool,
    /// Evaluate as an ES module.
    pub module: bool,
    /// Extra process arguments for this call only.
    pub test_host_args: Vec<String>,
}

// ─── TestRecord ───────────────────────────────────────────────────────────────

/// Alternate input to `eval_script`: a conformance-test file with metadata.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestRecord {
    /// Path of the original test file; dependency resolution starts here.
    pub file: PathBuf,
    pub contents: String,
    #[serde(default)]
    pub attrs: TestAttrs,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestAttrs {
    #[serde(default)]
    pub flags: TestFlags,
    #[serde(default)]
    pub negative: Option<NegativeExpectation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TestFlags {
    /// Skip compilation entirely; stage the contents byte-for-byte.
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub module: bool,
}

/// Expected-failure classification. A `Parse`-phase expectation marks the
/// source as known-unparseable, which disables dependency scanning.
#[derive(Debug, Clone, Deserialize)]
pub struct NegativeExpectation {
    pub phase: NegativePhase,
    #[serde(rename = "type")]
    pub error_type: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NegativePhase {
    Parse,
    Early,
    Resolution,
    Runtime,
}

// ─── EvalInput ────────────────────────────────────────────────────────────────

/// What callers hand to `eval_script`: raw source, or a test record.
#[derive(Debug, Clone)]
pub enum EvalInput {
    Source(String),
    Record(TestRecord),
}

impl From<&str> for EvalInput {
    fn from(s: &str) -> Self {
        EvalInput::Source(s.to_string())
    }
}

impl From<String> for EvalInput {
    fn from(s: String) -> Self {
        EvalInput::Source(s)
    }
}

impl From<TestRecord> for EvalInput {
    fn from(r: TestRecord) -> Self {
        EvalInput::Record(r)
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_item_string() {
        let c = AgentConfig::new("/bin/true").host_arguments("-a");
        assert_eq!(c.host_arguments, vec!["-a"]);
    }

    #[test]
    fn multiple_item_string() {
        let c = AgentConfig::new("/bin/true").host_arguments("-a -b --c --dee");
        assert_eq!(c.host_arguments, vec!["-a", "-b", "--c", "--dee"]);
    }

    #[test]
    fn prepared_list_passes_through() {
        let c = AgentConfig::new("/bin/true")
            .host_arguments(vec!["-a".to_string(), "--b=1".to_string()]);
        assert_eq!(c.host_arguments, vec!["-a", "--b=1"]);
    }

    #[test]
    fn forgiving_of_excessive_spaces() {
        let c = AgentConfig::new("/bin/true").host_arguments("-a     -b --c \t --dee");
        assert_eq!(c.host_arguments, vec!["-a", "-b", "--c", "--dee"]);
    }

    #[test]
    fn empty_string_yields_no_arguments() {
        assert!(tokenize_host_arguments("   \t ").is_empty());
    }

    #[test]
    fn empty_short_name_falls_back_to_default() {
        let c = AgentConfig::new("/bin/true").short_name("");
        assert_eq!(c.binding_name(), DEFAULT_SHORT_NAME);
    }

    #[test]
    fn test_record_attrs_deserialize() {
        let rec: TestRecord = serde_json::from_str(
            r#"{
                "file": "/tests/a.js",
                "contents": "syntax error ===",
                "attrs": {
                    "flags": { "module": true },
                    "negative": { "phase": "parse", "type": "SyntaxError" }
                }
            }"#,
        )
        .unwrap();
        assert!(rec.attrs.flags.module);
        assert!(!rec.attrs.flags.raw);
        let neg = rec.attrs.negative.unwrap();
        assert_eq!(neg.phase, NegativePhase::Parse);
        assert_eq!(neg.error_type, "SyntaxError");
    }

    proptest::proptest! {
        /// Tokenization always equals the whitespace-split, empty-filtered
        /// sequence, for any amount of irregular spacing.
        #[test]
        fn tokenization_matches_whitespace_split(
            parts in proptest::collection::vec("[a-zA-Z0-9=_-]{1,8}", 0..8),
            pads in proptest::collection::vec(" {1,3}|\t", 0..9),
        ) {
            let mut raw = String::new();
            for (i, p) in parts.iter().enumerate() {
                if let Some(pad) = pads.get(i) {
                    raw.push_str(pad);
                }
                raw.push_str(p);
                raw.push(' ');
            }
            proptest::prop_assert_eq!(tokenize_host_arguments(&raw), parts);
        }
    }
}
