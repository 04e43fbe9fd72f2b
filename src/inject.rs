//! Runtime-shim injection.
//!
//! Splices a per-host runtime shim into test source without disturbing the
//! directive prologue, renames the reserved binding to the configured short
//! name, and embeds the shim's own escaped source at the `$SOURCE`
//! placeholder so nested realms can bootstrap an identical environment.

use once_cell::sync::Lazy;
use regex::Regex;

/// Placeholder token in shim source, replaced with the fully-escaped shim
/// text itself.
pub const SOURCE_PLACEHOLDER: &str = "$SOURCE";

/// Name the shims are written against; renamed per-agent.
pub const CANONICAL_BINDING: &str = "$262";

/// The maximal directive-prologue region: string-literal statements,
/// comments, whitespace and semicolons, matched eagerly from the start.
static PROLOGUE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^(?:"[^\r\n"]*"|'[^\r\n']*'|[\s;]+|/\*[\w\W]*?\*/|//[^\n]*\n)*"#).unwrap()
});

static BLOCK_COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"/\*[\w\W]*?\*/").unwrap());
static LINE_COMMENT_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*//[^\n]*\n?").unwrap());

/// Prepare a raw shim for injection: strip comments, flatten line breaks
/// (so the user's own line numbers survive), embed the escaped source at
/// the placeholder, and rename the reserved binding.
pub fn prepare_runtime(raw: &str, short_name: &str) -> String {
    let flat = flatten(&strip_comments(raw));
    let incepted = inception(&flat);
    rename_identifier(&incepted, CANONICAL_BINDING, short_name)
}

/// Splice `runtime` between the source's directive prologue and its first
/// real statement. Sources with no detectable prologue get the runtime
/// prepended unconditionally.
pub fn inject(code: &str, runtime: &str) -> String {
    let split = PROLOGUE_RE
        .find(code)
        .map(|m| m.end())
        .unwrap_or(0);

    let mut out = String::with_capacity(code.len() + runtime.len());
    out.push_str(&code[..split]);
    out.push_str(runtime);
    out.push_str(&code[split..]);
    out
}

/// Remove block comments and whole-line `//` comments. Shims are authored
/// so no string literal ever looks like a comment, which keeps this a
/// plain textual pass.
fn strip_comments(src: &str) -> String {
    let no_blocks = BLOCK_COMMENT_RE.replace_all(src, "");
    LINE_COMMENT_RE.replace_all(&no_blocks, "").into_owned()
}

/// Drop line breaks entirely so the injected shim occupies zero lines.
fn flatten(src: &str) -> String {
    src.replace("\r\n", "").replace('\n', "")
}

/// Replace the first `$SOURCE` occurrence with the JSON-escaped shim text
/// (still containing the placeholder, exactly once removed from recursion).
pub(crate) fn inception(src: &str) -> String {
    match src.find(SOURCE_PLACEHOLDER) {
        Some(_) => {
            let escaped = serde_json::to_string(src).unwrap_or_else(|_| "\"\"".to_string());
            src.replacen(SOURCE_PLACEHOLDER, &escaped, 1)
        }
        None => src.to_string(),
    }
}

/// Identifier-boundary substitution: `from` is replaced only where neither
/// neighbor is an identifier character, so `$262` inside a longer token
/// (`a$262`, `$262x`) is left alone. Blind string replacement would corrupt
/// such tokens.
pub fn rename_identifier(src: &str, from: &str, to: &str) -> String {
    if from == to || from.is_empty() {
        return src.to_string();
    }

    fn is_ident(b: u8) -> bool {
        b == b'$' || b == b'_' || b.is_ascii_alphanumeric()
    }

    let bytes = src.as_bytes();
    let mut out = String::with_capacity(src.len());
    let mut i = 0;
    while let Some(pos) = src[i..].find(from) {
        let start = i + pos;
        let end = start + from.len();
        out.push_str(&src[i..start]);

        let prev_ok = start == 0 || !is_ident(bytes[start - 1]);
        let next_ok = end == src.len() || !is_ident(bytes[end]);
        if prev_ok && next_ok {
            out.push_str(to);
        } else {
            out.push_str(from);
        }
        i = end;
    }
    out.push_str(&src[i..]);
    out
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splices_after_use_strict() {
        let out = inject("\"use strict\";\nvar x = 1;\n", "var $262={};");
        assert!(out.starts_with("\"use strict\";\n"));
        let after = &out["\"use strict\";\n".len()..];
        assert!(after.starts_with("var $262={};"));
    }

    #[test]
    fn splices_after_comments_and_semicolons() {
        let src = "// header\n/* block */ ;; 'use strict';\nreal();";
        let out = inject(src, "SHIM;");
        let idx_shim = out.find("SHIM;").unwrap();
        let idx_real = out.find("real()").unwrap();
        let idx_directive = out.find("'use strict'").unwrap();
        assert!(idx_directive < idx_shim);
        assert!(idx_shim < idx_real);
    }

    #[test]
    fn prepends_when_no_prologue() {
        let out = inject("var x = 1;", "SHIM;");
        assert!(out.starts_with("SHIM;var x = 1;"));
    }

    #[test]
    fn rename_respects_token_boundaries() {
        let src = "var $262 = {}; a$262.foo(); $262x; ($262.destroy());";
        let out = rename_identifier(src, "$262", "$");
        assert_eq!(out, "var $ = {}; a$262.foo(); $262x; ($.destroy());");
    }

    #[test]
    fn rename_at_string_edges() {
        assert_eq!(rename_identifier("$262", "$262", "$t"), "$t");
        assert_eq!(rename_identifier("x $262", "$262", "$t"), "x $t");
        assert_eq!(rename_identifier("$262 x", "$262", "$t"), "$t x");
    }

    #[test]
    fn prepared_runtime_is_single_line() {
        let raw = "// a comment\nvar $262 = {\n  /* doc */\n  destroy() { },\n  source: $SOURCE\n};\n";
        let out = prepare_runtime(raw, "$t");
        assert!(!out.contains('\n'));
        assert!(!out.contains("/*"));
        assert!(out.contains("var $t = {"));
    }

    #[test]
    fn inception_embeds_escaped_source() {
        let raw = "var $262 = { source: $SOURCE };";
        let out = prepare_runtime(raw, "$262");
        // The placeholder is replaced with a JSON string of the flat shim,
        // which itself still names the placeholder.
        assert!(out.starts_with("var $262 = { source: \""));
        assert!(out.contains("source: $SOURCE"));
    }

    #[test]
    fn injection_does_not_shift_line_numbers() {
        let shim = prepare_runtime("var $262 = {\n destroy() {}\n};\n", "$262");
        let code = "'use strict';\nthrow new Error('line 2');\n";
        let out = inject(code, &shim);
        let line_of_throw = out
            .lines()
            .position(|l| l.contains("throw new Error"))
            .unwrap();
        assert_eq!(line_of_throw, code.lines().position(|l| l.contains("throw")).unwrap());
    }
}
