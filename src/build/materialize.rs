//! Writing the script body and auxiliary files into a workspace

use crate::error::{KilnError, KilnResult};
use crate::manifest::{FileMode, ParsedScript};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Files touched by one materialization pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaterializeReport {
    /// Files created or rewritten
    pub written: Vec<PathBuf>,
    /// Files skipped because content and mode already matched
    pub unchanged: Vec<PathBuf>,
}

/// Materialize auxiliary files, then the script body, into `workspace`
///
/// Files whose content and mode already match are left alone so their
/// mtimes do not change and incremental build tools stay warm.
pub async fn materialize(workspace: &Path, parsed: &ParsedScript) -> KilnResult<MaterializeReport> {
    let mut report = MaterializeReport::default();

    let entries = parsed
        .manifest
        .files
        .iter()
        .map(|f| (f.path.as_str(), f.content.as_bytes(), f.mode))
        .chain(std::iter::once((
            parsed.manifest.script_src.as_str(),
            parsed.body.as_bytes(),
            None,
        )));

    for (rel_path, content, mode) in entries {
        let target = workspace.join(rel_path);
        if write_if_changed(&target, content, mode).await? {
            report.written.push(target);
        } else {
            report.unchanged.push(target);
        }
    }

    debug!(
        "Materialized {} file(s), {} unchanged",
        report.written.len(),
        report.unchanged.len()
    );
    Ok(report)
}

/// Returns true if the file was written
async fn write_if_changed(target: &Path, content: &[u8], mode: Option<FileMode>) -> KilnResult<bool> {
    let fail = |source: std::io::Error| KilnError::Materialization {
        path: target.to_path_buf(),
        source,
    };

    let content_matches = match fs::read(target).await {
        Ok(existing) => existing == content,
        Err(e) if e.kind() == ErrorKind::NotFound => false,
        Err(e) => return Err(fail(e)),
    };

    if content_matches && mode_matches(target, mode).await.map_err(fail)? {
        debug!("Unchanged: {}", target.display());
        return Ok(false);
    }

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).await.map_err(fail)?;
    }

    if !content_matches {
        debug!("Writing {} bytes to {}", content.len(), target.display());
        fs::write(target, content).await.map_err(fail)?;
    }

    if let Some(mode) = mode {
        apply_mode(target, mode).await.map_err(fail)?;
    }

    Ok(true)
}

#[cfg(unix)]
async fn mode_matches(target: &Path, mode: Option<FileMode>) -> std::io::Result<bool> {
    use std::os::unix::fs::PermissionsExt;

    let Some(mode) = mode else {
        return Ok(true);
    };
    let meta = fs::metadata(target).await?;
    Ok(meta.permissions().mode() & FileMode::MAX == mode.bits())
}

#[cfg(not(unix))]
async fn mode_matches(_target: &Path, _mode: Option<FileMode>) -> std::io::Result<bool> {
    Ok(true)
}

#[cfg(unix)]
async fn apply_mode(target: &Path, mode: FileMode) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    debug!("Setting mode {} on {}", mode, target.display());
    fs::set_permissions(target, std::fs::Permissions::from_mode(mode.bits())).await
}

#[cfg(not(unix))]
async fn apply_mode(_target: &Path, _mode: FileMode) -> std::io::Result<()> {
    Ok(())
}
