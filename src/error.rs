//! Error types for Kiln
//!
//! All modules use `KilnResult<T>` as their return type. Every variant is
//! fatal to the current invocation; `exit_code()` maps it to the status the
//! runner exits with.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for Kiln operations
pub type KilnResult<T> = Result<T, KilnError>;

/// All errors that can occur in Kiln
#[derive(Error, Debug)]
pub enum KilnError {
    // Manifest errors
    #[error("No embedded manifest found in {path}: expected a 'kiln-begin' line followed by a 'kiln-end' line")]
    ManifestNotFound { path: PathBuf },

    #[error("Malformed manifest in {path}: {reason}")]
    ManifestMalformed { path: PathBuf, reason: String },

    // Workspace errors
    #[error("Cache error: {context}: {source}")]
    CacheIo {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to materialize {path}: {source}")]
    Materialization {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Build errors
    #[error("build_once_cmd failed ({status}): {command}")]
    BuildOnceFailed { command: String, status: String },

    #[error("build_cmd failed ({status}): {command}")]
    BuildFailed { command: String, status: String },

    #[error("Build interrupted by signal: {command}")]
    BuildInterrupted { command: String },

    // Execution errors
    #[error("Cannot execute target: {0}")]
    Execution(String),

    #[error("Target not found: {program}")]
    TargetNotFound { program: String },

    #[error("Target is not executable: {program}")]
    TargetNotExecutable { program: String },

    // Configuration errors
    #[error("Invalid configuration at {path}: {reason}")]
    ConfigInvalid { path: PathBuf, reason: String },

    #[error("Invalid script path {path}: {reason}")]
    ScriptPath { path: PathBuf, reason: String },

    // IO errors
    #[error("IO error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    // General errors
    #[error("{0}")]
    User(String),
}

impl KilnError {
    /// Create an IO error with context
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Create a cache IO error with context
    pub fn cache_io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::CacheIo {
            context: context.into(),
            source,
        }
    }

    /// Create a malformed manifest error
    pub fn malformed(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::ManifestMalformed {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Process exit code for this error
    ///
    /// Codes follow sysexits(3) where one fits, and the shell conventions
    /// 126/127 for targets that cannot be executed or found.
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::ManifestNotFound { .. } | Self::ManifestMalformed { .. } => 65,
            Self::BuildOnceFailed { .. } | Self::BuildFailed { .. } => 70,
            Self::Materialization { .. } => 73,
            Self::CacheIo { .. } => 74,
            Self::BuildInterrupted { .. } => 130,
            Self::Execution(_) | Self::TargetNotExecutable { .. } => 126,
            Self::TargetNotFound { .. } => 127,
            Self::ScriptPath { .. } => 64,
            _ => 1,
        }
    }

    /// Get actionable hint for the error
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            Self::ManifestNotFound { .. } => {
                Some("Add a commented YAML block between 'kiln-begin' and 'kiln-end' lines")
            }
            Self::BuildFailed { .. } => Some("Fix the build; the next run rebuilds from the same inputs"),
            Self::BuildOnceFailed { .. } => Some("build_once_cmd is retried on the next run"),
            Self::TargetNotFound { .. } => Some("Check target_bin; relative paths resolve against the cache workspace"),
            Self::TargetNotExecutable { .. } => Some("Mark the target executable with a file mode such as 0755"),
            Self::ScriptPath { .. } => Some("Script paths must start with '.' or '/', e.g. ./script.rs"),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = KilnError::BuildFailed {
            command: "cargo build".to_string(),
            status: "exit code 101".to_string(),
        };
        assert!(err.to_string().contains("build_cmd failed"));
        assert!(err.to_string().contains("cargo build"));
    }

    #[test]
    fn io_errors_include_cause() {
        let err = KilnError::io(
            "reading script /tmp/x.sh",
            std::io::Error::new(std::io::ErrorKind::InvalidData, "stream did not contain valid UTF-8"),
        );
        assert_eq!(
            err.to_string(),
            "IO error: reading script /tmp/x.sh: stream did not contain valid UTF-8"
        );

        let err = KilnError::cache_io(
            "creating workspace /c/ws",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied"),
        );
        assert!(err.to_string().ends_with("creating workspace /c/ws: permission denied"));
        assert_eq!(err.exit_code(), 74);
    }

    #[test]
    fn error_hint() {
        let err = KilnError::TargetNotExecutable {
            program: "./script".to_string(),
        };
        assert!(err.hint().unwrap().contains("0755"));
        assert_eq!(KilnError::User("x".to_string()).hint(), None);
    }

    #[test]
    fn exit_codes_distinguish_stages() {
        let not_found = KilnError::ManifestNotFound {
            path: PathBuf::from("./a.rs"),
        };
        assert_eq!(not_found.exit_code(), 65);
        assert_eq!(
            KilnError::TargetNotFound {
                program: "nope".to_string()
            }
            .exit_code(),
            127
        );
        assert_eq!(
            KilnError::TargetNotExecutable {
                program: "nope".to_string()
            }
            .exit_code(),
            126
        );
        let build = KilnError::BuildOnceFailed {
            command: "pip install".to_string(),
            status: "exit code 1".to_string(),
        };
        assert_eq!(build.exit_code(), 70);
        assert_eq!(
            KilnError::BuildInterrupted {
                command: "make".to_string()
            }
            .exit_code(),
            130
        );
    }
}
