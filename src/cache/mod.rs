//! Per-script build cache
//!
//! Every script path owns one workspace directory under the cache root.
//! Staleness is content-addressed: the workspace is rebuilt whenever the
//! fingerprint of the script body + manifest differs from the one recorded
//! after the last successful build.
//!
//! # Cache States
//!
//! | State | Description |
//! |-------|-------------|
//! | never-built | No successful build recorded (new or wiped workspace) |
//! | stale | Script changed since the last successful build |
//! | fresh | Workspace matches the script, build is skipped |

pub mod fingerprint;
pub mod workspace;

pub use fingerprint::{compute_fingerprint, workspace_key};
pub use workspace::{CacheState, FingerprintRecord, Resolution, Workspace};

use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use std::path::PathBuf;

/// Environment variable overriding the cache root
pub const CACHE_HOME_VAR: &str = "KILN_CACHE_HOME";

/// Resolve the cache root: `KILN_CACHE_HOME`, then `cache.root`, then the
/// platform cache directory
pub fn cache_root(config: &Config) -> KilnResult<PathBuf> {
    let root = match std::env::var_os(CACHE_HOME_VAR).filter(|v| !v.is_empty()) {
        Some(value) => PathBuf::from(value),
        None => match &config.cache.root {
            Some(root) => root.clone(),
            None => dirs::cache_dir()
                .ok_or_else(|| KilnError::User("Cannot determine the user cache directory".to_string()))?
                .join("kiln"),
        },
    };

    if root.is_absolute() {
        return Ok(root);
    }

    let cwd = std::env::current_dir().map_err(|e| KilnError::io("getting current directory", e))?;
    Ok(cwd.join(root))
}
