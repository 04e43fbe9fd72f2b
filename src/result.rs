use serde::{Deserialize, Serialize};

/// Outcome of one `eval_script` call, normalized across hosts.
///
/// A script that throws is a *successful* harness outcome — the thrown error
/// lands in `error`, never in a rejected future.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<NormalizedError>,
}

impl ExecutionResult {
    /// The result of a cancelled evaluation: no output, no error.
    pub fn empty() -> Self {
        Self::default()
    }
}

/// An uncaught error reconstructed from raw host output or a browser
/// `execError` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedError {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub stack: Vec<StackFrame>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    /// The raw text this frame was parsed from.
    pub source: String,
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_name: Option<String>,
    pub line_number: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column_number: Option<u32>,
}
