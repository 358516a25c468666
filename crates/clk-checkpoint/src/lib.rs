//! Durable checkpoint: the learned binding map persisted under a key derived
//! from the plan, so an interrupted apply can resume where it stopped.
//!
//! Writes are atomic (temp file in the same directory, then rename into
//! place); a crash mid-write never leaves a half-file visible. Files live
//! under `<home>/.clanker/checkpoints/`, mode 0o600 in a 0o755 directory.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointFile {
    #[serde(rename = "updatedAt")]
    pub updated_at: String,
    pub bindings: BTreeMap<String, String>,
}

/// Sanitize a caller-supplied checkpoint key: keep `[a-z0-9_-]` (uppercase is
/// lowered), collapse runs of `-`, trim `-` from the edges.
pub fn sanitize_key(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_dash = false;
    for c in raw.chars() {
        let c = c.to_ascii_lowercase();
        let mapped = if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
            Some(c)
        } else if c == '-' || c.is_whitespace() || c == '/' || c == '.' {
            Some('-')
        } else {
            None
        };
        match mapped {
            Some('-') => {
                if !last_dash && !out.is_empty() {
                    out.push('-');
                    last_dash = true;
                }
            }
            Some(c) => {
                out.push(c);
                last_dash = false;
            }
            None => {}
        }
    }
    out.trim_matches('-').to_string()
}

/// Fingerprint a plan: `aws-` + SHA1 over profile, region, and every command's
/// args. Identical plan + options always resume the same checkpoint.
pub fn plan_fingerprint(profile: &str, region: &str, commands: &[Vec<String>]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(profile.as_bytes());
    hasher.update([0u8]);
    hasher.update(region.as_bytes());
    hasher.update([0u8]);
    for args in commands {
        for arg in args {
            hasher.update(arg.as_bytes());
            hasher.update([0x1f]);
        }
        hasher.update([0u8]);
    }
    format!("aws-{}", hex::encode(hasher.finalize()))
}

/// File-backed checkpoint store rooted at a directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Store under `<home>/.clanker/checkpoints`.
    pub fn default_location() -> Result<Self> {
        let base = directories::BaseDirs::new().context("could not determine home directory")?;
        Ok(Self {
            dir: base.home_dir().join(".clanker").join("checkpoints"),
        })
    }

    pub fn at(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.json"))
    }

    /// Load prior bindings, or `None` when no checkpoint exists. A corrupt
    /// file is treated as absent (and logged); resuming from nothing is safe,
    /// resuming from garbage is not.
    pub fn load(&self, key: &str) -> Result<Option<BTreeMap<String, String>>> {
        let path = self.path_for(key);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("failed to read checkpoint {}", path.display()));
            }
        };
        match serde_json::from_str::<CheckpointFile>(&text) {
            Ok(file) => {
                debug!(key, bindings = file.bindings.len(), "loaded checkpoint");
                Ok(Some(file.bindings))
            }
            Err(e) => {
                warn!(key, error = %e, "ignoring corrupt checkpoint file");
                Ok(None)
            }
        }
    }

    /// Atomically persist the binding map: mkdir -p, write a temp file next
    /// to the target, rename into place.
    pub fn save(&self, key: &str, bindings: &BTreeMap<String, String>) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed to create {}", self.dir.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&self.dir, std::fs::Permissions::from_mode(0o755));
        }

        let file = CheckpointFile {
            updated_at: chrono::Utc::now().to_rfc3339(),
            bindings: bindings.clone(),
        };
        let payload =
            serde_json::to_vec_pretty(&file).context("failed to serialize checkpoint")?;

        let target = self.path_for(key);
        // Temp file must live in the checkpoint directory: rename is only
        // atomic within one filesystem. tempfile creates it 0o600 on unix.
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("failed to create temp file in {}", self.dir.display()))?;
        std::io::Write::write_all(&mut tmp, &payload).context("failed to write temp file")?;
        tmp.persist(&target)
            .with_context(|| format!("failed to persist to {}", target.display()))?;
        debug!(key, bindings = bindings.len(), "checkpoint persisted");
        Ok(())
    }

    /// Remove the checkpoint after a fully successful run.
    pub fn clear(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!(key, "checkpoint cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("failed to remove {}", path.display()))
            }
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).is_file()
    }
}
