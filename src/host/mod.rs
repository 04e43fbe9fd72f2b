//! Static engine registry.
//!
//! Every supported host resolves to a [`HostProfile`] at startup: its runtime
//! shim, its error-parser strategy, and any per-call argument tweaks. An
//! unknown name fails immediately with the full supported list instead of
//! failing on first use.

use crate::config::EvalOptions;
use crate::error::{HarnessError, Result};
use crate::parse_error::{ErrorParser, GenericErrorParser, V8ErrorParser};

const CONSOLE_RUNTIME: &str = include_str!("../runtimes/console.js");
const D8_RUNTIME: &str = include_str!("../runtimes/d8.js");
const JSSHELL_RUNTIME: &str = include_str!("../runtimes/jsshell.js");
const NODE_RUNTIME: &str = include_str!("../runtimes/node.js");

pub(crate) const BROWSER_RUNTIME: &str = include_str!("../runtimes/browser.js");
pub(crate) const BROWSER_HTML: &str = include_str!("../runtimes/browser.html");
pub(crate) const STACK_PARSER_JS: &str = include_str!("../runtimes/error-stack-parser.js");

/// Every name and alias [`HostKind::parse`] accepts.
pub const SUPPORTED_HOSTS: &[&str] = &[
    "node", "d8", "v8", "jsshell", "sm", "spidermonkey", "jsc", "javascriptcore", "ch", "chakra",
    "qjs", "quickjs", "hermes", "xs", "graaljs", "engine262", "nashorn", "libjs", "chrome",
    "firefox", "safari", "edge", "remote",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostKind {
    Node,
    V8,
    SpiderMonkey,
    JavaScriptCore,
    Chakra,
    QuickJs,
    Hermes,
    Xs,
    GraalJs,
    Engine262,
    Nashorn,
    LibJs,
    Chrome,
    Firefox,
    Safari,
    Edge,
    Remote,
}

impl HostKind {
    /// Resolve a host name or alias. Unknown names fail eagerly with the
    /// full list of supported names.
    pub fn parse(name: &str) -> Result<HostKind> {
        match name.to_ascii_lowercase().as_str() {
            "node" => Ok(HostKind::Node),
            "d8" | "v8" => Ok(HostKind::V8),
            "jsshell" | "sm" | "spidermonkey" => Ok(HostKind::SpiderMonkey),
            "jsc" | "javascriptcore" => Ok(HostKind::JavaScriptCore),
            "ch" | "chakra" => Ok(HostKind::Chakra),
            "qjs" | "quickjs" => Ok(HostKind::QuickJs),
            "hermes" => Ok(HostKind::Hermes),
            "xs" => Ok(HostKind::Xs),
            "graaljs" => Ok(HostKind::GraalJs),
            "engine262" => Ok(HostKind::Engine262),
            "nashorn" => Ok(HostKind::Nashorn),
            "libjs" => Ok(HostKind::LibJs),
            "chrome" => Ok(HostKind::Chrome),
            "firefox" => Ok(HostKind::Firefox),
            "safari" => Ok(HostKind::Safari),
            "edge" => Ok(HostKind::Edge),
            "remote" => Ok(HostKind::Remote),
            _ => Err(HarnessError::UnknownHost {
                name: name.to_string(),
                supported: SUPPORTED_HOSTS.join(", "),
            }),
        }
    }

    /// Browser-driven hosts evaluate through the coordination server, not a
    /// subprocess per call.
    pub fn is_browser(self) -> bool {
        matches!(
            self,
            HostKind::Chrome | HostKind::Firefox | HostKind::Safari | HostKind::Edge | HostKind::Remote
        )
    }

    pub fn profile(self) -> &'static HostProfile {
        match self {
            HostKind::Node => &NODE_PROFILE,
            HostKind::V8 => &V8_PROFILE,
            HostKind::SpiderMonkey => &SPIDERMONKEY_PROFILE,
            HostKind::JavaScriptCore => &JSC_PROFILE,
            HostKind::Chakra => &CHAKRA_PROFILE,
            HostKind::QuickJs => &QUICKJS_PROFILE,
            HostKind::Hermes => &HERMES_PROFILE,
            HostKind::Xs => &XS_PROFILE,
            HostKind::GraalJs => &GRAALJS_PROFILE,
            HostKind::Engine262 => &ENGINE262_PROFILE,
            HostKind::Nashorn => &NASHORN_PROFILE,
            HostKind::LibJs => &LIBJS_PROFILE,
            HostKind::Chrome
            | HostKind::Firefox
            | HostKind::Safari
            | HostKind::Edge
            | HostKind::Remote => &BROWSER_PROFILE,
        }
    }
}

/// Engine-specific behavior supplied as data, not subclassing: the runtime
/// shim to splice in, the error-parser strategy, and per-call arguments.
pub struct HostProfile {
    pub name: &'static str,
    /// Raw shim source; `None` for hosts whose page loads the runtime itself.
    pub runtime: Option<&'static str>,
    /// Name of the host's print-to-stdout function.
    pub print_command: &'static str,
    pub parser: &'static (dyn ErrorParser + Sync),
    /// Per-call extra arguments derived from the evaluation options.
    pub eval_args: fn(&EvalOptions) -> Vec<String>,
}

impl std::fmt::Debug for HostProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostProfile").field("name", &self.name).finish()
    }
}

fn no_extra_args(_options: &EvalOptions) -> Vec<String> {
    Vec::new()
}

/// d8 needs `--module` ahead of the file name in module mode, and the tests
/// rely on an exposed `gc()`.
fn v8_eval_args(options: &EvalOptions) -> Vec<String> {
    let mut args = Vec::new();
    if options.module {
        args.push("--module".to_string());
    }
    args.push("--expose-gc".to_string());
    args
}

fn spidermonkey_eval_args(options: &EvalOptions) -> Vec<String> {
    if options.module {
        vec!["--module".to_string()]
    } else {
        Vec::new()
    }
}

static NODE_PROFILE: HostProfile = HostProfile {
    name: "node",
    runtime: Some(NODE_RUNTIME),
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: no_extra_args,
};

static V8_PROFILE: HostProfile = HostProfile {
    name: "d8",
    runtime: Some(D8_RUNTIME),
    print_command: "print",
    parser: &V8ErrorParser,
    eval_args: v8_eval_args,
};

static SPIDERMONKEY_PROFILE: HostProfile = HostProfile {
    name: "jsshell",
    runtime: Some(JSSHELL_RUNTIME),
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: spidermonkey_eval_args,
};

static JSC_PROFILE: HostProfile = HostProfile {
    name: "jsc",
    runtime: Some(CONSOLE_RUNTIME),
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: no_extra_args,
};

static CHAKRA_PROFILE: HostProfile = HostProfile {
    name: "chakra",
    runtime: Some(CONSOLE_RUNTIME),
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: no_extra_args,
};

static QUICKJS_PROFILE: HostProfile = HostProfile {
    name: "qjs",
    runtime: Some(CONSOLE_RUNTIME),
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: no_extra_args,
};

static HERMES_PROFILE: HostProfile = HostProfile {
    name: "hermes",
    runtime: Some(CONSOLE_RUNTIME),
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: no_extra_args,
};

static XS_PROFILE: HostProfile = HostProfile {
    name: "xs",
    runtime: Some(CONSOLE_RUNTIME),
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: no_extra_args,
};

static GRAALJS_PROFILE: HostProfile = HostProfile {
    name: "graaljs",
    runtime: Some(CONSOLE_RUNTIME),
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: no_extra_args,
};

static ENGINE262_PROFILE: HostProfile = HostProfile {
    name: "engine262",
    runtime: Some(CONSOLE_RUNTIME),
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: no_extra_args,
};

static NASHORN_PROFILE: HostProfile = HostProfile {
    name: "nashorn",
    runtime: Some(CONSOLE_RUNTIME),
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: no_extra_args,
};

static LIBJS_PROFILE: HostProfile = HostProfile {
    name: "libjs",
    runtime: Some(CONSOLE_RUNTIME),
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: no_extra_args,
};

static BROWSER_PROFILE: HostProfile = HostProfile {
    name: "browser",
    // The page loads /runtime.js itself; nothing is spliced into the source.
    runtime: None,
    print_command: "print",
    parser: &GenericErrorParser,
    eval_args: no_extra_args,
};

// ─── Tests ────────────────────────────────────────────────────────────────────
