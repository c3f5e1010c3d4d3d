//! Workspace state management
//!
//! Each script gets one workspace directory under the cache root. Two small
//! JSON files inside it record what has been built:
//!
//! | File | Written after |
//! |------|---------------|
//! | `kiln.fingerprint.json` | successful materialize + `build_cmd` |
//! | `kiln.built-once.json` | successful `build_once_cmd` |
//!
//! Both are replaced atomically (temp file + rename), so a crash mid-build
//! never leaves a success record for artifacts that are not on disk.

use crate::cache::fingerprint::workspace_key;
use crate::error::{KilnError, KilnResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

/// Metadata file recording the last successful fingerprint
pub const FINGERPRINT_FILE: &str = "kiln.fingerprint.json";

/// Metadata file marking `build_once_cmd` as done
pub const BUILT_ONCE_FILE: &str = "kiln.built-once.json";

/// Record of the last successful build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FingerprintRecord {
    /// Fingerprint the workspace contents correspond to
    pub fingerprint: String,
    /// Canonical script path the workspace belongs to
    pub script: PathBuf,
    /// When the build finished
    pub built_at: DateTime<Utc>,
}

/// Record of a successful `build_once_cmd`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuiltOnceRecord {
    /// When the setup command finished
    pub completed_at: DateTime<Utc>,
}

/// Freshness of a workspace relative to the current script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    /// No successful build recorded
    NeverBuilt,
    /// Recorded fingerprint differs from the current one
    Stale,
    /// Recorded fingerprint matches
    Fresh,
}

impl CacheState {
    /// Whether materialize + build must run
    pub fn needs_build(&self) -> bool {
        !matches!(self, Self::Fresh)
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeverBuilt => write!(f, "never-built"),
            Self::Stale => write!(f, "stale"),
            Self::Fresh => write!(f, "fresh"),
        }
    }
}

/// On-disk build directory for one script
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    dir: PathBuf,
}

/// Outcome of resolving a script against its workspace
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The script's workspace (created)
    pub workspace: Workspace,
    /// Fingerprint of the current script
    pub fingerprint: String,
    /// Last successful build, if any
    pub last_build: Option<FingerprintRecord>,
    /// Whether `build_once_cmd` already succeeded here
    pub built_once: bool,
}

impl Resolution {
    /// Freshness of the workspace
    pub fn state(&self) -> CacheState {
        match &self.last_build {
            None => CacheState::NeverBuilt,
            Some(record) if record.fingerprint == self.fingerprint => CacheState::Fresh,
            Some(_) => CacheState::Stale,
        }
    }

    /// Whether the current fingerprint has not been built yet
    pub fn is_stale(&self) -> bool {
        self.state().needs_build()
    }
}

impl Workspace {
    /// Workspace for a canonical script path under `cache_root`
    pub fn for_script(cache_root: &Path, canonical_script: &Path) -> Self {
        Self {
            dir: cache_root.join(workspace_key(canonical_script)),
        }
    }

    /// Absolute workspace directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the workspace and compare its records with `fingerprint`
    pub async fn resolve(
        cache_root: &Path,
        canonical_script: &Path,
        fingerprint: String,
    ) -> KilnResult<Resolution> {
        let workspace = Self::for_script(cache_root, canonical_script);
        workspace.ensure().await?;

        let last_build = workspace.load_fingerprint().await?;
        let built_once = workspace.is_built_once().await?;

        let resolution = Resolution {
            workspace,
            fingerprint,
            last_build,
            built_once,
        };
        debug!(
            "Workspace {} is {} (built_once: {})",
            resolution.workspace.dir.display(),
            resolution.state(),
            resolution.built_once
        );
        Ok(resolution)
    }

    /// Create the directory; losing a creation race to another process is fine
    pub async fn ensure(&self) -> KilnResult<()> {
        match fs::create_dir_all(&self.dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists && self.dir.is_dir() => Ok(()),
            Err(e) => Err(KilnError::cache_io(
                format!("creating workspace {}", self.dir.display()),
                e,
            )),
        }
    }

    /// Load the last successful build record
    pub async fn load_fingerprint(&self) -> KilnResult<Option<FingerprintRecord>> {
        self.read_record(FINGERPRINT_FILE).await
    }

    /// Whether `build_once_cmd` has succeeded in this workspace
    pub async fn is_built_once(&self) -> KilnResult<bool> {
        Ok(self
            .read_record::<BuiltOnceRecord>(BUILT_ONCE_FILE)
            .await?
            .is_some())
    }

    /// Persist a successful build of `fingerprint`
    pub async fn record_fingerprint(&self, fingerprint: &str, script: &Path) -> KilnResult<()> {
        let record = FingerprintRecord {
            fingerprint: fingerprint.to_string(),
            script: script.to_path_buf(),
            built_at: Utc::now(),
        };
        self.write_record(FINGERPRINT_FILE, &record).await
    }

    /// Persist a successful `build_once_cmd`
    pub async fn record_built_once(&self) -> KilnResult<()> {
        let record = BuiltOnceRecord {
            completed_at: Utc::now(),
        };
        self.write_record(BUILT_ONCE_FILE, &record).await
    }

    /// Delete the workspace; returns false if it did not exist
    pub async fn remove(&self) -> KilnResult<bool> {
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(KilnError::cache_io(
                format!("removing workspace {}", self.dir.display()),
                e,
            )),
        }
    }

    async fn read_record<T>(&self, name: &str) -> KilnResult<Option<T>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let path = self.dir.join(name);
        let content = match fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(KilnError::cache_io(format!("reading {}", path.display()), e));
            }
        };

        match serde_json::from_slice(&content) {
            Ok(record) => Ok(Some(record)),
            Err(e) => {
                warn!("Ignoring unreadable {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    async fn write_record<T: Serialize>(&self, name: &str, record: &T) -> KilnResult<()> {
        let content = serde_json::to_vec_pretty(record)?;
        let target = self.dir.join(name);
        self.write_atomic(&target, &content).await
    }

    /// Write to a unique temp file in the same directory, then rename over `target`
    async fn write_atomic(&self, target: &Path, content: &[u8]) -> KilnResult<()> {
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));

        let result = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(content).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&tmp, target).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(KilnError::cache_io(format!("writing {}", target.display()), e));
        }

        debug!("Wrote {}", target.display());
        Ok(())
    }
}
