//! Handing off to the built target
//!
//! `target_interpreter` and `target_bin` are split shell-style, `@@@` is
//! replaced with the workspace path, and the result is exec'd with the
//! forwarded arguments. On unix the runner process is replaced, so the
//! target inherits stdio, pid and exit status directly.

use crate::error::{KilnError, KilnResult};
use crate::manifest::Manifest;
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Command;
use tracing::debug;

/// Placeholder replaced with the absolute workspace path
pub const WORKSPACE_TOKEN: &str = "@@@";

/// Fully resolved command line of the target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetCommand {
    pub program: String,
    pub args: Vec<OsString>,
}

impl TargetCommand {
    /// Build the command line for `manifest` in `workspace`
    pub fn resolve(manifest: &Manifest, workspace: &Path, forwarded: &[OsString]) -> KilnResult<Self> {
        let workspace_str = workspace.to_string_lossy();
        let mut words = Vec::new();

        if let Some(interpreter) = &manifest.target_interpreter {
            words.extend(split_words("target_interpreter", interpreter, &workspace_str)?);
        }

        let mut bin_words = split_words("target_bin", &manifest.target_bin, &workspace_str)?;
        if let Some(first) = bin_words.first_mut() {
            *first = anchor_to_workspace(first, workspace);
        }
        words.extend(bin_words);

        let mut words = words.into_iter();
        let program = words
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| KilnError::Execution("target resolves to an empty command".to_string()))?;

        let args = words
            .map(OsString::from)
            .chain(forwarded.iter().cloned())
            .collect();

        Ok(Self { program, args })
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Replace the current process with the target
    ///
    /// Only returns on failure.
    #[cfg(unix)]
    pub fn exec(self) -> KilnResult<i32> {
        use std::os::unix::process::CommandExt;

        debug!("exec {} {:?}", self.program, self.args);
        let err = self.command().exec();
        Err(self.exec_error(err))
    }

    /// Run the target to completion and return its exit code
    #[cfg(not(unix))]
    pub fn exec(self) -> KilnResult<i32> {
        debug!("spawn {} {:?}", self.program, self.args);
        let status = self.command().status().map_err(|e| self.exec_error(e))?;
        Ok(status.code().unwrap_or(1))
    }

    fn exec_error(&self, err: std::io::Error) -> KilnError {
        match err.kind() {
            ErrorKind::NotFound => KilnError::TargetNotFound {
                program: self.program.clone(),
            },
            ErrorKind::PermissionDenied => KilnError::TargetNotExecutable {
                program: self.program.clone(),
            },
            _ => KilnError::Execution(format!("{}: {}", self.program, err)),
        }
    }
}

fn split_words(field: &str, value: &str, workspace: &str) -> KilnResult<Vec<String>> {
    let words = shell_words::split(value)
        .map_err(|e| KilnError::Execution(format!("cannot split {} {:?}: {}", field, value, e)))?;
    Ok(words
        .into_iter()
        .map(|w| w.replace(WORKSPACE_TOKEN, workspace))
        .collect())
}

/// Relative paths with a separator point into the workspace; bare names use PATH
fn anchor_to_workspace(word: &str, workspace: &Path) -> String {
    let path = Path::new(word);
    if path.is_absolute() || !word.contains(std::path::MAIN_SEPARATOR) {
        return word.to_string();
    }
    let rel = path.strip_prefix(".").unwrap_or(path);
    workspace.join(rel).to_string_lossy().into_owned()
}
