//! Error-parser strategies: turn raw host output into a [`NormalizedError`].
//!
//! Each host profile picks a strategy. `None` from [`ErrorParser::parse`]
//! means "no recognizable uncaught-error signature" — a legitimate outcome,
//! not a failure.

use crate::result::{ExecutionResult, NormalizedError, StackFrame};
use once_cell::sync::Lazy;
use regex::Regex;

pub trait ErrorParser: Send + Sync {
    /// Extract an uncaught-error record from raw output, usually stderr.
    fn parse(&self, raw: &str) -> Option<NormalizedError>;

    /// Clean up host quirks before parsing (banner stripping, relocating
    /// error text between streams). Default: no normalization.
    fn normalize_result(&self, _result: &mut ExecutionResult) {}
}

// ─── Generic strategy ─────────────────────────────────────────────────────────

/// Matches the `Name: message\n    at ...` shape most hosts print.
static ERROR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^[\w\d]+(:.*)?(?:(\r?\n\s+at.*)+|\r?\n$)").unwrap());
static ERROR_PROPS_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([\w\d]+)(: (.*))?\r?\n").unwrap());
static FRAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s+at(.*?)\(?([^\s()]+):(\d+):(\d+)\)?").unwrap());

pub struct GenericErrorParser;

impl ErrorParser for GenericErrorParser {
    fn parse(&self, raw: &str) -> Option<NormalizedError> {
        let error_str = ERROR_RE.find(raw)?.as_str();
        let props = ERROR_PROPS_RE.captures(error_str)?;
        let head_len = props.get(0).map(|m| m.end()).unwrap_or(0);

        Some(NormalizedError {
            name: props[1].to_string(),
            message: props.get(3).map(|m| m.as_str().to_string()),
            stack: parse_stack(&error_str[head_len..]),
        })
    }
}

/// Parse `    at func (file:line:col)` frames, one per line. Lines that do
/// not look like frames are skipped.
pub fn parse_stack(stack_str: &str) -> Vec<StackFrame> {
    stack_str
        .lines()
        .filter_map(|entry| {
            let caps = FRAME_RE.captures(entry)?;
            Some(StackFrame {
                source: entry.to_string(),
                function_name: Some(caps[1].trim().to_string()).filter(|f| !f.is_empty()),
                file_name: caps[2].trim_start_matches('(').to_string(),
                line_number: caps[3].parse().ok()?,
                column_number: caps[4].parse().ok(),
            })
        })
        .collect()
}

// ─── V8 strategy ──────────────────────────────────────────────────────────────

/// V8 prefixes uncaught errors with `file:line: Name: message`, echoes the
/// offending source line, then repeats the error text above the stack.
static V8_HEAD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^(.*?):(\d+): (([\w\d]+)(?:: (.*))?)$").unwrap());

const V8_EXPERIMENTAL_NOTICE: &str =
    "V8 is running with experimental features enabled. Stability and security will suffer.\n";

pub struct V8ErrorParser;

impl ErrorParser for V8ErrorParser {
    fn parse(&self, raw: &str) -> Option<NormalizedError> {
        let caps = V8_HEAD_RE.captures(raw)?;
        let error_text = caps.get(3).map(|m| m.as_str()).unwrap_or_default();
        let head_end = caps.get(0).map(|m| m.end()).unwrap_or(0);

        // The error text reappears verbatim right above the stack frames.
        let stack = raw[head_end..]
            .find(error_text)
            .map(|off| parse_stack(&raw[head_end + off + error_text.len()..]))
            .unwrap_or_default();

        let stack = if stack.is_empty() {
            vec![StackFrame {
                source: caps.get(0).map(|m| m.as_str().to_string()).unwrap_or_default(),
                file_name: caps[1].to_string(),
                function_name: None,
                line_number: caps[2].parse().ok()?,
                column_number: None,
            }]
        } else {
            stack
        };

        Some(NormalizedError {
            name: caps[4].to_string(),
            message: caps.get(5).map(|m| m.as_str().to_string()),
            stack,
        })
    }

    /// V8 reports uncaught errors on stdout; move them to stderr so one
    /// parsing path serves both streams, and drop the experimental banner.
    fn normalize_result(&self, result: &mut ExecutionResult) {
        if let Some(rest) = result.stderr.strip_prefix(V8_EXPERIMENTAL_NOTICE) {
            result.stderr = rest.to_string();
        }

        if let Some(m) = V8_HEAD_RE.find(&result.stdout) {
            let start = m.start();
            let moved = result.stdout.split_off(start);
            result.stderr = moved;
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_name_message_and_frames() {
        let raw = "TypeError: x is not a function\n    at foo (/tmp/f.js:3:5)\n    at /tmp/f.js:7:1\n";
        let err = GenericErrorParser.parse(raw).unwrap();
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message.as_deref(), Some("x is not a function"));
        assert_eq!(err.stack.len(), 2);
        assert_eq!(err.stack[0].function_name.as_deref(), Some("foo"));
        assert_eq!(err.stack[0].file_name, "/tmp/f.js");
        assert_eq!(err.stack[0].line_number, 3);
        assert_eq!(err.stack[0].column_number, Some(5));
    }

    #[test]
    fn parses_bare_error_line() {
        let err = GenericErrorParser.parse("SyntaxError: unexpected token\n").unwrap();
        assert_eq!(err.name, "SyntaxError");
        assert_eq!(err.message.as_deref(), Some("unexpected token"));
        assert!(err.stack.is_empty());
    }

    #[test]
    fn parses_error_without_message() {
        let err = GenericErrorParser.parse("Test262Error\n").unwrap();
        assert_eq!(err.name, "Test262Error");
        assert_eq!(err.message, None);
    }

    #[test]
    fn ordinary_output_is_not_an_error() {
        assert!(GenericErrorParser.parse("").is_none());
        assert!(GenericErrorParser.parse("hello world").is_none());
    }

    #[test]
    fn v8_error_with_repeated_text_and_stack() {
        let raw = "/tmp/f.js:3: TypeError: x is not a function\nx();\n^\nTypeError: x is not a function\n    at /tmp/f.js:3:1\n";
        let err = V8ErrorParser.parse(raw).unwrap();
        assert_eq!(err.name, "TypeError");
        assert_eq!(err.message.as_deref(), Some("x is not a function"));
        assert_eq!(err.stack.len(), 1);
        assert_eq!(err.stack[0].line_number, 3);
    }

    #[test]
    fn v8_error_without_stack_synthesizes_frame() {
        let raw = "/tmp/f.js:1: SyntaxError: Unexpected token\n";
        let err = V8ErrorParser.parse(raw).unwrap();
        assert_eq!(err.name, "SyntaxError");
        assert_eq!(err.stack.len(), 1);
        assert_eq!(err.stack[0].file_name, "/tmp/f.js");
        assert_eq!(err.stack[0].line_number, 1);
    }

    #[test]
    fn v8_normalize_moves_stdout_error_to_stderr() {
        let mut result = ExecutionResult {
            stdout: "printed\n/tmp/f.js:2: RangeError: boom\n".to_string(),
            stderr: String::new(),
            error: None,
        };
        V8ErrorParser.normalize_result(&mut result);
        assert_eq!(result.stdout, "printed\n");
        assert!(result.stderr.starts_with("/tmp/f.js:2: RangeError: boom"));
    }

    #[test]
    fn v8_normalize_strips_experimental_banner() {
        let mut result = ExecutionResult {
            stdout: String::new(),
            stderr: format!("{V8_EXPERIMENTAL_NOTICE}TypeError: nope\n"),
            error: None,
        };
        V8ErrorParser.normalize_result(&mut result);
        assert_eq!(result.stderr, "TypeError: nope\n");
    }
}
