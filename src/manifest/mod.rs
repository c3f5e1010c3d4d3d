//! Embedded manifest parsing
//!
//! A script carries its build manifest in a comment block:
//!
//! ```text
//! // kiln-begin
//! // script_src: src/main.rs
//! // build_cmd: cargo build --release
//! // target_bin: ./target/release/script
//! // kiln-end
//! ```
//!
//! Whatever precedes `kiln-begin` on its line is taken as the comment prefix
//! and stripped from every line of the block, so any comment syntax works.

pub mod schema;

pub use schema::{AuxiliaryFile, DockerBuild, FileMode, Manifest};

use crate::error::{KilnError, KilnResult};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Line marker opening the manifest block
pub const BEGIN_MARKER: &str = "kiln-begin";

/// Line marker closing the manifest block
pub const END_MARKER: &str = "kiln-end";

/// A script split into its manifest and the body to materialize
#[derive(Debug, Clone)]
pub struct ParsedScript {
    /// Decoded manifest
    pub manifest: Manifest,

    /// Raw YAML between the markers, comment prefix removed
    pub manifest_text: String,

    /// Script body as written into the workspace
    pub body: String,
}

impl ParsedScript {
    /// Read and parse a script from disk
    pub async fn from_file(path: &Path) -> KilnResult<Self> {
        let source = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| KilnError::io(format!("reading script {}", path.display()), e))?;
        Self::parse(path, &source)
    }

    /// Parse script source; `path` is only used in error messages
    pub fn parse(path: &Path, source: &str) -> KilnResult<Self> {
        let manifest_text = extract_block(source).ok_or_else(|| KilnError::ManifestNotFound {
            path: path.to_path_buf(),
        })?;

        let manifest: Manifest = serde_yaml::from_str(&manifest_text)
            .map_err(|e| KilnError::malformed(path, e.to_string()))?;
        validate(&manifest).map_err(|reason| KilnError::malformed(path, reason))?;

        debug!("Manifest parsed: {:?}", manifest);

        let body = replace_shebang(source, &manifest.replace_shebang_with);
        Ok(Self {
            manifest,
            manifest_text,
            body,
        })
    }
}

/// Locate the first marker pair and return the enclosed text
fn extract_block(source: &str) -> Option<String> {
    let mut lines = source.lines();

    let prefix = lines.by_ref().find_map(|line| {
        line.find(BEGIN_MARKER)
            .map(|pos| line[..pos].to_string())
    })?;

    let mut block = String::new();
    for line in lines {
        let stripped = strip_comment_prefix(line, &prefix);
        if stripped.trim_start().starts_with(END_MARKER) {
            return Some(block);
        }
        block.push_str(stripped);
        block.push('\n');
    }

    // Begin marker without a matching end
    None
}

fn strip_comment_prefix<'a>(line: &'a str, prefix: &str) -> &'a str {
    if let Some(rest) = line.strip_prefix(prefix) {
        return rest;
    }
    // Blank comment lines usually lose the trailing space ("//" vs "// ")
    let bare = prefix.trim_end();
    if !bare.is_empty() {
        if let Some(rest) = line.strip_prefix(bare) {
            return rest;
        }
    }
    line
}

fn replace_shebang(source: &str, replacement: &str) -> String {
    if !source.starts_with("#!") {
        return source.to_string();
    }
    match source.find('\n') {
        Some(newline) => format!("{}{}", replacement, &source[newline..]),
        None => replacement.to_string(),
    }
}

fn validate(manifest: &Manifest) -> Result<(), String> {
    validate_workspace_path("script_src", &manifest.script_src)?;

    for (idx, file) in manifest.files.iter().enumerate() {
        validate_workspace_path(&format!("files[{}].path", idx), &file.path)?;
        if normalized(&file.path) == normalized(&manifest.script_src) {
            return Err(format!(
                "files[{}].path '{}' collides with script_src",
                idx, file.path
            ));
        }
    }

    if manifest.target_bin.trim().is_empty() {
        return Err("target_bin must not be empty".to_string());
    }

    if let Some(interpreter) = &manifest.target_interpreter {
        if interpreter.trim().is_empty() {
            return Err("target_interpreter must not be empty when set".to_string());
        }
    }

    if let Some(mount) = manifest.docker_build.as_ref().and_then(|d| d.src_mount_dir.as_deref()) {
        if !mount.starts_with('/') {
            return Err(format!(
                "docker_build.src_mount_dir '{}' must be an absolute container path",
                mount
            ));
        }
    }

    Ok(())
}

fn normalized(path: &str) -> PathBuf {
    Path::new(path)
        .components()
        .filter(|c| !matches!(c, Component::CurDir))
        .collect()
}

/// Paths written into the workspace must stay inside it
fn validate_workspace_path(field: &str, value: &str) -> Result<(), String> {
    if value.trim().is_empty() {
        return Err(format!("{} must not be empty", field));
    }

    for component in Path::new(value).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => {
                return Err(format!("{} '{}' must not contain '..'", field, value));
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(format!("{} '{}' must be a relative path", field, value));
            }
        }
    }

    Ok(())
}
