//! Configuration schema for Kiln
//!
//! Configuration is stored at `~/.config/kiln/config.toml`

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General settings
    pub general: GeneralConfig,

    /// Cache settings
    pub cache: CacheConfig,

    /// Build command settings
    pub build: BuildConfig,
}

/// General application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Log at info level without passing -v
    pub verbose: bool,

    /// Log format: "text" or "json"
    pub log_format: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            verbose: false,
            log_format: "text".to_string(),
        }
    }
}

/// Cache configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache root directory (default: platform cache dir + "/kiln").
    /// `KILN_CACHE_HOME` takes precedence.
    pub root: Option<PathBuf>,
}

/// Build command configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Shell used to run build commands as `<shell> -c <cmd>`
    pub shell: String,

    /// Docker CLI used for `docker_build` manifests
    pub docker: String,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            docker: "docker".to_string(),
        }
    }
}
