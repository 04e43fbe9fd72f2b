//! Static module-dependency discovery.
//!
//! Works by line scanning, not parsing: the input may be intentionally
//! unparseable (a negative syntax test), so anything import-shaped whose
//! specifier ends in `.js` counts.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::path::Path;
use tracing::debug;

static IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:import\s*\(|import|from)\s*['"]([^'"]+)['"]"#).unwrap());

static DYNAMIC_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"import\s*\(\s*['"]\./"#).unwrap());
static STATIC_IMPORT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?:import|from)\s+['"]\./"#).unwrap());

/// Cheap check used upstream to decide whether module-mode staging is needed
/// at all: does the source contain a relative static or dynamic import?
pub fn has_module_specifier(source: &str) -> bool {
    DYNAMIC_IMPORT_RE.is_match(source) || STATIC_IMPORT_RE.is_match(source)
}

/// Collect relative `.js` specifiers named by import-like syntax, in source
/// order, deduplicated, with any leading `./` stripped.
pub fn find_import_specifiers(source: &str) -> Vec<String> {
    let mut specifiers = Vec::new();
    for line in source.lines() {
        if !line.contains(".js") {
            continue;
        }
        for caps in IMPORT_RE.captures_iter(line) {
            let spec = &caps[1];
            if !spec.ends_with(".js") {
                continue;
            }
            let spec = spec.trim_start_matches("./").to_string();
            if !specifiers.contains(&spec) {
                specifiers.push(spec);
            }
        }
    }
    specifiers
}

/// Resolves the closed set of same-directory files a module entry point
/// transitively imports. Each physical file is read at most once per
/// resolver instance; contents stay cached for staging.
#[derive(Debug, Default)]
pub struct DependencyResolver {
    /// Raw sources keyed by base name.
    cache: HashMap<String, String>,
}

impl DependencyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transitive dependencies of `entry`, as base names in discovery order.
    /// The entry point itself is never in the result, even when a cycle
    /// leads back to it. Unreadable specifiers are dropped rather than
    /// failing the whole resolution.
    pub fn resolve(&mut self, entry: &Path) -> Vec<String> {
        let entry_base = base_name(entry);
        let mut accum = Vec::new();
        let mut visited = HashSet::new();
        visited.insert(entry_base.clone());

        self.resolve_into(entry, &mut accum, &mut visited);
        accum.retain(|b| *b != entry_base);
        accum
    }

    /// Cached source of a previously resolved file, by base name.
    pub fn raw_source(&self, base_name: &str) -> Option<&str> {
        self.cache.get(base_name).map(String::as_str)
    }

    fn resolve_into(&mut self, file: &Path, accum: &mut Vec<String>, visited: &mut HashSet<String>) {
        let base = base_name(file);
        let source = match self.read_cached(file, &base) {
            Ok(source) => source,
            Err(err) => {
                // Fixture files may exist only conditionally; treat the
                // specifier as not actually resolvable.
                debug!(file = %file.display(), %err, "dropping unreadable dependency");
                accum.retain(|b| *b != base);
                return;
            }
        };

        let dir = file.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        for spec in find_import_specifiers(&source) {
            // The visited check happens before recursing, so self-imports
            // and cycles terminate instead of re-entering.
            if visited.insert(spec.clone()) {
                accum.push(spec.clone());
                self.resolve_into(&dir.join(&spec), accum, visited);
            }
        }
    }

    fn read_cached(&mut self, file: &Path, base: &str) -> io::Result<String> {
        if let Some(cached) = self.cache.get(base) {
            return Ok(cached.clone());
        }
        let contents = std::fs::read_to_string(file)?;
        self.cache.insert(base.to_string(), contents.clone());
        Ok(contents)
    }
}

fn base_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn fixture(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().unwrap();
        for (name, contents) in files {
            fs::write(dir.path().join(name), contents).unwrap();
        }
        dir
    }

    #[test]
    fn finds_static_dynamic_and_bare_imports() {
        let src = r#"
            import { a } from './a.js';
            import './side-effect.js';
            const p = import('./dyn.js');
            import notRelative from 'bare-package';
        "#;
        assert_eq!(
            find_import_specifiers(src),
            vec!["a.js", "side-effect.js", "dyn.js"]
        );
    }

    #[test]
    fn module_specifier_detection() {
        assert!(has_module_specifier("import { x } from './x.js';"));
        assert!(has_module_specifier("import './x.js';"));
        assert!(has_module_specifier("Promise.all([import('./x.js')])"));
        assert!(!has_module_specifier("var x = 'import';"));
        assert!(!has_module_specifier("import { x } from 'pkg';"));
    }

    #[test]
    fn diamond_dependencies_deduplicated() {
        // a -> b, a -> c, b -> d, c -> d
        let dir = fixture(&[
            ("a.js", "import './b.js';\nimport './c.js';\n"),
            ("b.js", "import './d.js';\n"),
            ("c.js", "import './d.js';\n"),
            ("d.js", "export default 1;\n"),
        ]);
        let mut resolver = DependencyResolver::new();
        let deps = resolver.resolve(&dir.path().join("a.js"));
        assert_eq!(deps, vec!["b.js", "d.js", "c.js"]);
    }

    #[test]
    fn self_import_terminates() {
        let dir = fixture(&[("a.js", "import './a.js';\n")]);
        let mut resolver = DependencyResolver::new();
        assert!(resolver.resolve(&dir.path().join("a.js")).is_empty());
    }

    #[test]
    fn cycle_terminates_without_duplicates() {
        let dir = fixture(&[
            ("a.js", "import './b.js';\n"),
            ("b.js", "import './a.js';\n"),
        ]);
        let mut resolver = DependencyResolver::new();
        let deps = resolver.resolve(&dir.path().join("a.js"));
        assert_eq!(deps, vec!["b.js"]);
    }

    #[test]
    fn unreadable_dependency_is_dropped() {
        let dir = fixture(&[("a.js", "import './missing.js';\nimport './b.js';\n"), ("b.js", "")]);
        let mut resolver = DependencyResolver::new();
        let deps = resolver.resolve(&dir.path().join("a.js"));
        assert_eq!(deps, vec!["b.js"]);
    }

    #[test]
    fn files_read_once_and_cached() {
        let dir = fixture(&[
            ("a.js", "import './b.js';\n"),
            ("b.js", "export var b = 1;\n"),
        ]);
        let mut resolver = DependencyResolver::new();
        resolver.resolve(&dir.path().join("a.js"));
        assert_eq!(resolver.raw_source("b.js"), Some("export var b = 1;\n"));
        // Deleting the file does not invalidate the cache.
        fs::remove_file(dir.path().join("b.js")).unwrap();
        let deps = resolver.resolve(&dir.path().join("a.js"));
        assert_eq!(deps, vec!["b.js"]);
    }
}
