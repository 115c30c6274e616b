//! Attempt-indexed storage of candidate code.
//!
//! Layout under the artifact root:
//! - `<session_id>/<target>_parser_attempt<N>.<ext>`: one file per attempt, never overwritten
//! - `<target>_parser.<ext>`: the promoted winner of the latest successful session

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, instrument};

/// A persisted candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
    session_id: String,
    target: String,
    extension: &'static str,
}

impl ArtifactStore {
    pub fn new(
        root: impl Into<PathBuf>,
        session_id: &str,
        target: &str,
        extension: &'static str,
    ) -> Self {
        Self {
            root: root.into(),
            session_id: session_id.to_string(),
            target: target.to_string(),
            extension,
        }
    }

    pub fn attempt_path(&self, index: u32) -> PathBuf {
        self.root.join(&self.session_id).join(format!(
            "{}_parser_attempt{index}.{}",
            self.target, self.extension
        ))
    }

    pub fn promoted_path(&self) -> PathBuf {
        self.root
            .join(format!("{}_parser.{}", self.target, self.extension))
    }

    /// Write the candidate for attempt `index`. Fails if the file already exists.
    #[instrument(skip_all, fields(index))]
    pub fn persist(&self, index: u32, code: &str) -> Result<StoredArtifact> {
        let path = self.attempt_path(index);
        let dir = path
            .parent()
            .with_context(|| format!("artifact path missing parent {}", path.display()))?;
        fs::create_dir_all(dir)
            .with_context(|| format!("create artifact dir {}", dir.display()))?;

        let mut contents = code.to_string();
        if !contents.ends_with('\n') {
            contents.push('\n');
        }

        let mut tmp = NamedTempFile::new_in(dir)
            .with_context(|| format!("create temp artifact in {}", dir.display()))?;
        tmp.write_all(contents.as_bytes())
            .context("write temp artifact")?;
        tmp.as_file().sync_all().context("sync temp artifact")?;
        tmp.persist_noclobber(&path)
            .map_err(|err| err.error)
            .with_context(|| format!("persist artifact {}", path.display()))?;

        let sha256 = hex::encode(Sha256::digest(contents.as_bytes()));
        debug!(path = %path.display(), %sha256, "persisted artifact");
        Ok(StoredArtifact { path, sha256 })
    }

    /// Atomically copy a successful artifact to the stable parser path.
    #[instrument(skip_all)]
    pub fn promote(&self, artifact: &Path) -> Result<PathBuf> {
        let contents =
            fs::read(artifact).with_context(|| format!("read artifact {}", artifact.display()))?;
        fs::create_dir_all(&self.root)
            .with_context(|| format!("create artifact dir {}", self.root.display()))?;

        let target = self.promoted_path();
        let mut tmp = NamedTempFile::new_in(&self.root)
            .with_context(|| format!("create temp artifact in {}", self.root.display()))?;
        tmp.write_all(&contents).context("write temp artifact")?;
        tmp.as_file().sync_all().context("sync temp artifact")?;
        tmp.persist(&target)
            .map_err(|err| err.error)
            .with_context(|| format!("promote artifact to {}", target.display()))?;

        info!(from = %artifact.display(), to = %target.display(), "promoted artifact");
        Ok(target)
    }
}
