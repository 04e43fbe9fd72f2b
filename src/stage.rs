//! Source staging: materialize the files of one evaluation to the working
//! directory, and clean them up afterwards.

use crate::error::{HarnessError, Result};
use std::path::{Path, PathBuf};
use tracing::trace;
use uuid::Uuid;

/// Ordered `(path, content)` pairs written before execution. The first entry
/// is always the entry point; no path ever appears twice.
#[derive(Debug, Clone)]
pub struct SourceSet {
    files: Vec<(PathBuf, String)>,
}

impl SourceSet {
    pub fn new(entry: PathBuf, contents: String) -> Self {
        Self {
            files: vec![(entry, contents)],
        }
    }

    /// Append a file unless that path is already present (the entry point is
    /// never duplicated, even when a dependency re-imports it).
    pub fn push(&mut self, path: PathBuf, contents: String) {
        if self.files.iter().any(|(p, _)| *p == path) {
            return;
        }
        self.files.push((path, contents));
    }

    pub fn entry(&self) -> &Path {
        &self.files[0].0
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.files.iter().map(|(p, c)| (p.as_path(), c.as_str()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// Collision-resistant entry-point file name: `f-<timestamp>-<pid>-<random>.js`.
pub fn unique_entry_name() -> String {
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let random = Uuid::new_v4().simple().to_string();
    format!("f-{millis}-{}-{}.js", std::process::id(), &random[..8])
}

/// Write every file in the set. The entry point's directory is created if
/// missing. Failures here reject the evaluation — unlike cleanup, staging
/// errors are never swallowed.
pub async fn write_sources(sources: &SourceSet) -> Result<()> {
    if let Some(dir) = sources.entry().parent() {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|source| HarnessError::Stage {
                path: dir.to_path_buf(),
                source,
            })?;
    }

    for (path, contents) in sources.iter() {
        trace!(path = %path.display(), bytes = contents.len(), "staging source");
        tokio::fs::write(path, contents)
            .await
            .map_err(|source| HarnessError::Stage {
                path: path.to_path_buf(),
                source,
            })?;
    }
    Ok(())
}

/// Best-effort deletion of every staged file. Another process may already be
/// iterating the directory; failures are swallowed.
pub async fn remove_sources(sources: &SourceSet) {
    for (path, _) in sources.iter() {
        if let Err(err) = tokio::fs::remove_file(path).await {
            trace!(path = %path.display(), %err, "staged file cleanup failed");
        }
    }
}

// ─── Tests ────────────────────────────────────────────────────────────────────
