//! Running `build_once_cmd` and `build_cmd` inside a workspace
//!
//! Commands run through the configured shell with stdout and stderr
//! inherited, so compiler output reaches the user's terminal unmodified.
//! Each command gets its own process group. SIGINT and SIGTERM received
//! while a command runs are forwarded to the whole group; the build is then
//! reported as interrupted, the group is swept, and nothing is recorded.

use crate::build::docker;
use crate::build::BuildMode;
use crate::cache::Workspace;
use crate::error::{KilnError, KilnResult};
use crate::manifest::Manifest;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Workspace directory exported to build commands
pub const CACHE_DIR_VAR: &str = "KILN_CACHE_DIR";
/// Directory containing the script, exported to build commands
pub const SOURCE_DIR_VAR: &str = "KILN_SOURCE_DIR";
/// Canonical script path, exported to build commands
pub const SOURCE_VAR: &str = "KILN_SOURCE";

/// Everything needed to bring one workspace up to date
#[derive(Debug)]
pub struct BuildJob<'a> {
    pub manifest: &'a Manifest,
    pub workspace: &'a Workspace,
    /// Canonical path of the script
    pub script: &'a Path,
    /// Fingerprint recorded once the build succeeds
    pub fingerprint: &'a str,
    /// Run `build_once_cmd` (when set)
    pub run_build_once: bool,
    pub mode: BuildMode,
}

impl BuildJob<'_> {
    fn script_dir(&self) -> &Path {
        self.script.parent().unwrap_or_else(|| Path::new("/"))
    }
}

/// What a successful build ran
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BuildReport {
    pub ran_build_once: bool,
    pub ran_build: bool,
}

/// Which manifest command a step belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    BuildOnce,
    Build,
}

impl Step {
    fn failed(self, command: String, status: String) -> KilnError {
        match self {
            Self::BuildOnce => KilnError::BuildOnceFailed { command, status },
            Self::Build => KilnError::BuildFailed { command, status },
        }
    }
}

/// How a command ended
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Success,
    Failed(String),
    Interrupted,
}

/// Runs build commands through a shell, or through Docker when the
/// manifest asks for a containerized build
#[derive(Debug, Clone)]
pub struct BuildOrchestrator {
    shell: String,
    docker: String,
}

impl BuildOrchestrator {
    /// Orchestrator invoking commands as `<shell> -c <cmd>` and containers
    /// through the `docker` CLI
    pub fn new(shell: impl Into<String>, docker: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            docker: docker.into(),
        }
    }

    /// Docker-compatible CLI used for containerized builds
    pub fn docker_cli(&self) -> &str {
        &self.docker
    }

    /// Run the job's commands in order and record success
    ///
    /// The built-once marker is written right after `build_once_cmd`
    /// succeeds, so a later `build_cmd` failure does not repeat setup. The
    /// fingerprint is written only after every command succeeded.
    pub async fn run(&self, job: &BuildJob<'_>) -> KilnResult<BuildReport> {
        let mut report = BuildReport::default();

        if job.run_build_once {
            if let Some(cmd) = &job.manifest.build_once_cmd {
                info!("Running build_once_cmd: {}", cmd);
                let command = self.shell_command(cmd, job.workspace.dir(), job);
                run_step(command, Step::BuildOnce, cmd).await?;
                job.workspace.record_built_once().await?;
                report.ran_build_once = true;
            }
        }

        if let Some(cmd) = &job.manifest.build_cmd {
            match job.manifest.docker() {
                Some(settings) => {
                    info!("Running build_cmd in Docker: {}", cmd);
                    docker::build(&self.docker, job, settings, cmd).await?;
                }
                None => {
                    let cwd = if job.manifest.build_in_script_dir {
                        job.script_dir()
                    } else {
                        job.workspace.dir()
                    };
                    info!("Running build_cmd: {}", cmd);
                    run_step(self.shell_command(cmd, cwd, job), Step::Build, cmd).await?;
                }
            }
            report.ran_build = true;
        }

        job.workspace
            .record_fingerprint(job.fingerprint, job.script)
            .await?;
        debug!("Recorded fingerprint {}", job.fingerprint);
        Ok(report)
    }

    fn shell_command(&self, cmd: &str, cwd: &Path, job: &BuildJob<'_>) -> Command {
        debug!("{} -c {:?} (cwd: {})", self.shell, cmd, cwd.display());

        let mut command = Command::new(&self.shell);
        command
            .arg("-c")
            .arg(cmd)
            .current_dir(cwd)
            .env(CACHE_DIR_VAR, job.workspace.dir())
            .env(SOURCE_DIR_VAR, job.script_dir())
            .env(SOURCE_VAR, job.script);
        command
    }
}

/// Run one build step to completion, streaming its output
///
/// `label` names the step in errors. Stdin is closed: the step runs in a
/// background process group and must not read from the terminal.
pub(crate) async fn run_step(mut command: Command, step: Step, label: &str) -> KilnResult<()> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    // Listen before spawning so an early signal is not lost
    #[cfg(unix)]
    let mut interrupts = Interrupts::listen()?;

    let outcome = match command.spawn() {
        Ok(mut child) => {
            #[cfg(unix)]
            {
                wait_forwarding_signals(&mut child, &mut interrupts).await
            }
            #[cfg(not(unix))]
            {
                wait_interruptible(&mut child).await
            }
        }
        Err(e) => Outcome::Failed(format!(
            "failed to start {}: {}",
            command.as_std().get_program().to_string_lossy(),
            e
        )),
    };

    match outcome {
        Outcome::Success => Ok(()),
        Outcome::Failed(status) => Err(step.failed(label.to_string(), status)),
        Outcome::Interrupted => Err(KilnError::BuildInterrupted {
            command: label.to_string(),
        }),
    }
}

#[cfg(unix)]
struct Interrupts {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Interrupts {
    fn listen() -> KilnResult<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        let listen = |kind: SignalKind| {
            signal(kind).map_err(|e| KilnError::io("installing build signal handler", e))
        };
        Ok(Self {
            sigint: listen(SignalKind::interrupt())?,
            sigterm: listen(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal;

        tokio::select! {
            _ = self.sigint.recv() => Signal::SIGINT,
            _ = self.sigterm.recv() => Signal::SIGTERM,
        }
    }
}

#[cfg(unix)]
async fn wait_forwarding_signals(child: &mut Child, interrupts: &mut Interrupts) -> Outcome {
    use nix::sys::signal::Signal;

    // The child leads its own group; the id is gone once wait() reaps it
    let Some(pgid) = child.id() else {
        return finished(child.wait().await);
    };

    let received = tokio::select! {
        status = child.wait() => {
            let outcome = finished(status);
            if outcome == Outcome::Interrupted {
                signal_group(pgid, Signal::SIGKILL);
            }
            return outcome;
        }
        received = interrupts.recv() => received,
    };

    warn!("Interrupted, forwarding {:?} to build process group {}", received, pgid);
    signal_group(pgid, received);

    tokio::select! {
        _ = child.wait() => {}
        _ = interrupts.recv() => {
            warn!("Second interrupt, killing build process group {}", pgid);
            signal_group(pgid, Signal::SIGKILL);
            if let Err(e) = child.wait().await {
                debug!("Failed to reap build command: {}", e);
            }
        }
    }

    // Nothing started by the build outlives it
    signal_group(pgid, Signal::SIGKILL);
    Outcome::Interrupted
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: nix::sys::signal::Signal) {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pgid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => debug!("killpg({}, {:?}) failed: {}", pgid, signal, e),
    }
}

#[cfg(not(unix))]
async fn wait_interruptible(child: &mut Child) -> Outcome {
    tokio::select! {
        status = child.wait() => finished(status),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping build command");
            if let Err(e) = child.kill().await {
                debug!("Failed to kill build command: {}", e);
            }
            Outcome::Interrupted
        }
    }
}

fn finished(status: std::io::Result<ExitStatus>) -> Outcome {
    match status {
        Ok(status) if status.success() => Outcome::Success,
        Ok(status) if killed_by_interrupt(&status) => Outcome::Interrupted,
        Ok(status) => Outcome::Failed(describe_status(&status)),
        Err(e) => Outcome::Failed(format!("failed to wait for command: {}", e)),
    }
}

#[cfg(unix)]
fn killed_by_interrupt(status: &ExitStatus) -> bool {
    use nix::sys::signal::Signal;
    use std::os::unix::process::ExitStatusExt;

    matches!(
        status.signal().map(Signal::try_from),
        Some(Ok(Signal::SIGINT | Signal::SIGTERM))
    )
}

#[cfg(not(unix))]
fn killed_by_interrupt(_status: &ExitStatus) -> bool {
    false
}

fn describe_status(status: &ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("exit code {}", code);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return format!("killed by signal {}", sig);
        }
    }
    status.to_string()
}
