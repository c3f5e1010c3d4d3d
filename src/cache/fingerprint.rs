//! Content fingerprints and workspace keys
//!
//! A script's workspace is keyed by its canonical path, so one script keeps
//! one workspace across edits. Whether that workspace is up to date is
//! decided by the fingerprint: a SHA256 over everything that can change the
//! build output.

use crate::error::{KilnError, KilnResult};
use crate::manifest::ParsedScript;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Bumped whenever the hashed layout changes, to invalidate old workspaces
const FINGERPRINT_VERSION: &[u8] = b"kiln-fingerprint-v1";

/// Number of hex chars of the path hash used in workspace names
const KEY_HASH_LEN: usize = 16;

/// Derive the workspace directory name for a canonical script path
///
/// Format: `{file_name}-{hash}`, where hash is the first 16 hex chars of
/// SHA256 over the path. The file name is only there for humans browsing the
/// cache directory.
pub fn workspace_key(canonical_script: &Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_script.as_os_str().as_encoded_bytes());
    let hash = hex::encode(hasher.finalize());

    let name: String = canonical_script
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();

    format!("{}-{}", name, &hash[..KEY_HASH_LEN])
}

/// Compute the content fingerprint of a parsed script
///
/// Covers the materialized body, the decoded manifest, and the contents of
/// every file under `extra_src_paths` (resolved against `script_dir`).
pub fn compute_fingerprint(parsed: &ParsedScript, script_dir: &Path) -> KilnResult<String> {
    let mut hasher = Sha256::new();
    hasher.update(FINGERPRINT_VERSION);

    hasher.update(parsed.body.as_bytes());
    hasher.update([0u8]);

    let manifest_json = serde_json::to_string(&parsed.manifest)?;
    hasher.update(manifest_json.as_bytes());

    for extra in &parsed.manifest.extra_src_paths {
        hasher.update([0u8]);
        hasher.update(extra.as_bytes());
        hash_extra_path(&mut hasher, &script_dir.join(extra))?;
    }

    let fingerprint = hex::encode(hasher.finalize());
    debug!("Fingerprint: {}", fingerprint);
    Ok(fingerprint)
}

fn hash_extra_path(hasher: &mut Sha256, root: &Path) -> KilnResult<()> {
    if !root.exists() {
        warn!("extra_src_paths entry {} does not exist", root.display());
        hasher.update(b"<missing>");
        return Ok(());
    }

    let mut hashed = 0usize;
    for entry in WalkDir::new(root).follow_links(true).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let context = format!("walking {}", root.display());
            match e.into_io_error() {
                Some(io) => KilnError::cache_io(context, io),
                None => KilnError::User(format!("{}: filesystem loop detected", context)),
            }
        })?;

        if !entry.file_type().is_file() {
            continue;
        }

        let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let contents = fs::read(entry.path())
            .map_err(|e| KilnError::cache_io(format!("reading {}", entry.path().display()), e))?;

        hasher.update(rel.as_os_str().as_encoded_bytes());
        hasher.update((contents.len() as u64).to_le_bytes());
        hasher.update(&contents);
        hashed += 1;
    }

    debug!("Hashed {} extra files under {}", hashed, root.display());
    Ok(())
}
