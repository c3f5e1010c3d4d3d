//! Manifest schema
//!
//! The embedded block is YAML. Unknown keys are ignored so newer scripts keep
//! working with older runners.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Parsed build manifest embedded in a script
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Path (relative to the workspace) the script body is written to
    pub script_src: String,

    /// Setup command run once per workspace lifetime
    #[serde(default)]
    pub build_once_cmd: Option<String>,

    /// Build command run whenever the fingerprint changes
    #[serde(default)]
    pub build_cmd: Option<String>,

    /// Command line executed after the build; may embed `@@@`
    #[serde(default = "default_target_bin")]
    pub target_bin: String,

    /// Interpreter prefixed onto `target_bin`
    #[serde(default)]
    pub target_interpreter: Option<String>,

    /// Auxiliary files materialized next to the script
    #[serde(default)]
    pub files: Vec<AuxiliaryFile>,

    /// Replacement for a leading `#!` line in the materialized body
    #[serde(default)]
    pub replace_shebang_with: String,

    /// Run `build_cmd` in the script's own directory instead of the workspace
    #[serde(default)]
    pub build_in_script_dir: bool,

    /// Extra files or directories whose contents feed the fingerprint
    #[serde(default)]
    pub extra_src_paths: Vec<String>,

    /// Run `build_cmd` inside a Docker image instead of the host shell
    #[serde(default)]
    pub docker_build: Option<DockerBuild>,
}

impl Manifest {
    /// Docker settings, when they describe an actual image to build
    pub fn docker(&self) -> Option<&DockerBuild> {
        self.docker_build
            .as_ref()
            .filter(|d| d.dockerfile.as_deref().is_some_and(|f| !f.trim().is_empty()))
    }
}

/// Containerized build settings
///
/// The workspace is copied into a named volume, `build_cmd` runs in an
/// image built from `dockerfile`, and the target is copied back out.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DockerBuild {
    /// Dockerfile content for the build image
    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Where the source volume is mounted inside the build container
    #[serde(default)]
    pub src_mount_dir: Option<String>,

    /// Extra `docker run` arguments
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_target_bin() -> String {
    "./script".to_string()
}

/// A file declared in the manifest's `files` list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryFile {
    /// Path relative to the workspace
    pub path: String,

    /// Verbatim file content
    pub content: String,

    /// Permission bits, e.g. `"0755"`
    #[serde(default)]
    pub mode: Option<FileMode>,
}

/// Unix permission bits declared for a materialized file
///
/// Accepts quoted octal strings (`"0755"`, `"0o755"`, `"755"`) or bare
/// numbers whose digits are read as octal (`755`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawMode", into = "String")]
pub struct FileMode(u32);

impl FileMode {
    /// Largest accepted value (setuid/setgid/sticky + rwx for all)
    pub const MAX: u32 = 0o7777;

    /// Create a mode from raw permission bits
    pub fn new(bits: u32) -> Result<Self, String> {
        if bits > Self::MAX {
            return Err(format!("file mode {:o} is out of range (max 7777)", bits));
        }
        Ok(Self(bits))
    }

    /// Raw permission bits
    pub fn bits(&self) -> u32 {
        self.0
    }

    fn parse_octal(digits: &str) -> Result<Self, String> {
        let trimmed = digits.trim();
        let trimmed = trimmed.strip_prefix("0o").unwrap_or(trimmed);
        if trimmed.is_empty() {
            return Err("file mode is empty".to_string());
        }
        let bits = u32::from_str_radix(trimmed, 8)
            .map_err(|_| format!("file mode '{}' is not an octal number", digits))?;
        Self::new(bits)
    }
}

impl fmt::Display for FileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04o}", self.0)
    }
}

impl From<FileMode> for String {
    fn from(mode: FileMode) -> Self {
        mode.to_string()
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawMode {
    Number(u32),
    Text(String),
}

impl TryFrom<RawMode> for FileMode {
    type Error = String;

    fn try_from(raw: RawMode) -> Result<Self, Self::Error> {
        match raw {
            RawMode::Number(n) => Self::parse_octal(&n.to_string()),
            RawMode::Text(s) => Self::parse_octal(&s),
        }
    }
}
