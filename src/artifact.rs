//! The shared parameter file every backend reads.
//!
//! A run takes a backup once at start, rewrites the parameter before each
//! trial and writes the original bytes back after each trial and at the end.
//! The on-disk backup survives a crash, and the next run restores it before
//! doing anything else.

use std::path::{Path, PathBuf};

use regex::{Captures, Regex};

use crate::config::ArtifactConfig;
use crate::error::{BenchError, Result};

#[derive(Debug, Clone)]
pub struct ConfigArtifact {
    path: PathBuf,
    backup_path: PathBuf,
    parameter_name: String,
    pattern: Regex,
}

impl ConfigArtifact {
    pub fn new(config: &ArtifactConfig) -> Result<Self> {
        let name = config.parameter_name.trim();
        if name.is_empty() {
            return Err(BenchError::Config("artifact parameter name is empty".to_string()));
        }
        // `%let iter = 10;` or `iter = 10;` at the start of a line; group 2 is the value
        let pattern = Regex::new(&format!(
            r"(?im)^([ \t]*(?:%let\s+)?{}\s*=\s*)(\d+)(\s*;)",
            regex::escape(name)
        ))
        .map_err(|e| BenchError::Config(format!("invalid parameter pattern: {e}")))?;

        let mut backup = config.path.clone().into_os_string();
        backup.push(".backup");

        Ok(Self {
            path: config.path.clone(),
            backup_path: PathBuf::from(backup),
            parameter_name: name.to_string(),
            pattern,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup_path
    }

    /// Replace the first assignment's value, leaving everything else untouched.
    pub fn rewrite(&self, content: &str, value: u64) -> Result<String> {
        if !self.pattern.is_match(content) {
            return Err(self.missing_parameter());
        }
        let rewritten = self
            .pattern
            .replacen(content, 1, |caps: &Captures| format!("{}{}{}", &caps[1], value, &caps[3]));
        Ok(rewritten.into_owned())
    }

    /// Current value of the parameter, if present.
    pub fn current_value(&self, content: &str) -> Option<String> {
        self.pattern
            .captures(content)
            .map(|caps| caps[2].trim().to_string())
    }

    /// Recover from a stale backup, snapshot the original content and write the backup.
    pub async fn begin(&self) -> Result<ArtifactGuard> {
        if tokio::fs::try_exists(&self.backup_path).await? {
            tracing::warn!(
                backup = %self.backup_path.display(),
                "Found backup from an interrupted run, restoring it first"
            );
            tokio::fs::copy(&self.backup_path, &self.path)
                .await
                .map_err(|e| self.io_error("restoring stale backup", e))?;
        }

        let original = tokio::fs::read(&self.path)
            .await
            .map_err(|e| self.io_error("reading", e))?;
        let text = String::from_utf8(original.clone()).map_err(|_| {
            BenchError::Artifact(format!("{} is not valid UTF-8", self.path.display()))
        })?;
        if !self.pattern.is_match(&text) {
            return Err(self.missing_parameter());
        }

        tokio::fs::write(&self.backup_path, &original)
            .await
            .map_err(|e| self.io_error("writing backup", e))?;
        tracing::info!(
            path = %self.path.display(),
            parameter = %self.parameter_name,
            value = self.current_value(&text).as_deref().unwrap_or(""),
            "Config artifact backed up"
        );

        Ok(ArtifactGuard {
            artifact: self.clone(),
            original,
            original_text: text,
            finished: false,
        })
    }

    fn missing_parameter(&self) -> BenchError {
        BenchError::Artifact(format!(
            "no `{}` assignment found in {}",
            self.parameter_name,
            self.path.display()
        ))
    }

    fn io_error(&self, action: &str, e: std::io::Error) -> BenchError {
        BenchError::Artifact(format!("{action} {}: {e}", self.path.display()))
    }
}

/// Holds the original content for the duration of a run.
///
/// Dropping an unfinished guard writes the original back synchronously.
#[derive(Debug)]
pub struct ArtifactGuard {
    artifact: ConfigArtifact,
    original: Vec<u8>,
    original_text: String,
    finished: bool,
}

impl ArtifactGuard {
    pub fn original(&self) -> &[u8] {
        &self.original
    }

    /// Write the artifact with the parameter set to `value` and return the new content.
    ///
    /// The content is written to a sibling file and renamed over the artifact,
    /// so readers see either the old or the new content.
    pub async fn set_parameter(&self, value: u64) -> Result<String> {
        let content = self.artifact.rewrite(&self.original_text, value)?;

        let mut staging = self.artifact.path.clone().into_os_string();
        staging.push(".tmp");
        let staging = PathBuf::from(staging);

        tokio::fs::write(&staging, content.as_bytes())
            .await
            .map_err(|e| self.artifact.io_error("writing", e))?;
        tokio::fs::rename(&staging, &self.artifact.path)
            .await
            .map_err(|e| self.artifact.io_error("replacing", e))?;

        tracing::debug!(path = %self.artifact.path.display(), value, "Config artifact rewritten");
        Ok(content)
    }

    pub async fn restore_original(&self) -> Result<()> {
        tokio::fs::write(&self.artifact.path, &self.original)
            .await
            .map_err(|e| self.artifact.io_error("restoring", e))
    }

    /// Restore the original content and remove the on-disk backup.
    pub async fn finish(mut self) -> Result<()> {
        self.restore_original().await?;
        self.finished = true;
        if let Err(e) = tokio::fs::remove_file(&self.artifact.backup_path).await {
            tracing::warn!(backup = %self.artifact.backup_path.display(), error = %e, "Could not remove backup");
        }
        tracing::info!(path = %self.artifact.path.display(), "Config artifact restored");
        Ok(())
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        match std::fs::write(&self.artifact.path, &self.original) {
            Ok(()) => {
                let _ = std::fs::remove_file(&self.artifact.backup_path);
                tracing::warn!(path = %self.artifact.path.display(), "Config artifact restored on drop");
            }
            Err(e) => {
                tracing::error!(
                    path = %self.artifact.path.display(),
                    backup = %self.artifact.backup_path.display(),
                    error = %e,
                    "Failed to restore config artifact, backup left in place"
                );
            }
        }
    }
}
