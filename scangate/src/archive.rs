use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use glob::Pattern;
use tracing::{debug, info};

/// Receives the files a run produced.
#[async_trait]
pub trait ArtifactSink: Send + Sync {
    /// Archives every regular file in `source` whose name matches one of
    /// `patterns`. Returns the archived copies; an empty list is success.
    async fn archive(&self, source: &Path, patterns: &[String]) -> Result<Vec<PathBuf>>;
}

/// Copies matching files into a destination directory.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dest: PathBuf,
}

impl DirectorySink {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self { dest: dest.into() }
    }
}

/// Names of regular files directly inside `dir` matching any of `patterns`,
/// sorted for stable output.
pub fn matching_files(dir: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
    let compiled = patterns
        .iter()
        .map(|p| Pattern::new(p).with_context(|| format!("invalid file pattern {p:?}")))
        .collect::<Result<Vec<_>>>()?;

    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(vec![]),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", dir.display())),
    };

    let mut matched = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to read entry in {}", dir.display()))?;
        if !entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if compiled.iter().any(|p| p.matches(&name)) {
            matched.push(entry.path());
        }
    }
    matched.sort();
    Ok(matched)
}

#[async_trait]
impl ArtifactSink for DirectorySink {
    async fn archive(&self, source: &Path, patterns: &[String]) -> Result<Vec<PathBuf>> {
        let files = matching_files(source, patterns)?;
        if files.is_empty() {
            info!(source = %source.display(), "no artifacts to archive");
            return Ok(vec![]);
        }

        tokio::fs::create_dir_all(&self.dest)
            .await
            .with_context(|| {
                format!("failed to create archive directory {}", self.dest.display())
            })?;

        let mut archived = Vec::with_capacity(files.len());
        for file in files {
            let Some(name) = file.file_name() else { continue };
            let dest = self.dest.join(name);
            tokio::fs::copy(&file, &dest)
                .await
                .with_context(|| format!("failed to archive {}", file.display()))?;
            debug!(file = %file.display(), dest = %dest.display(), "archived");
            archived.push(dest);
        }
        info!(count = archived.len(), dest = %self.dest.display(), "artifacts archived");
        Ok(archived)
    }
}
