//! The runner pipeline shared by every command
//!
//! Parser → fingerprint → workspace resolution → (if stale) materialize and
//! build. The caller then hands the prepared workspace to the executor or
//! just reports on it.

use crate::build::docker::{self, DockerNames};
use crate::build::{materialize, BuildJob, BuildMode, BuildOrchestrator, BuildReport};
use crate::cache::{self, compute_fingerprint, CacheState, Resolution, Workspace};
use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::manifest::ParsedScript;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A script whose workspace is ready for execution
#[derive(Debug)]
pub struct Prepared {
    pub parsed: ParsedScript,
    /// Canonical script path
    pub script: PathBuf,
    pub resolution: Resolution,
    /// Cache state found before any build ran
    pub state: CacheState,
    /// What ran, if a build was needed
    pub build: Option<BuildReport>,
}

impl Prepared {
    pub fn workspace_dir(&self) -> &Path {
        self.resolution.workspace.dir()
    }
}

/// Workspace details reported by `kiln cache`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInfo {
    pub cache_path: PathBuf,
    pub fingerprint: String,
    pub stored_fingerprint: Option<String>,
    pub state: CacheState,
    pub built_once: bool,
    pub dir_size: u64,
    /// Image and volume, for scripts built in Docker
    pub docker: Option<DockerNames>,
}

impl CacheInfo {
    /// Item names accepted by `kiln cache get`
    pub const ITEMS: [&'static str; 6] = [
        "cache_path",
        "fingerprint",
        "stored_fingerprint",
        "state",
        "built_once",
        "dir_size",
    ];

    /// Extra items for scripts built in Docker
    pub const DOCKER_ITEMS: [&'static str; 2] = ["docker_image", "docker_src_volume"];

    /// Item names available for this workspace, in display order
    pub fn names(&self) -> Vec<&'static str> {
        let mut names = Self::ITEMS.to_vec();
        if self.docker.is_some() {
            names.extend(Self::DOCKER_ITEMS);
        }
        names
    }

    /// Look up one item by name
    pub fn get(&self, name: &str) -> Option<String> {
        let value = match name {
            "cache_path" => self.cache_path.display().to_string(),
            "fingerprint" => self.fingerprint.clone(),
            "stored_fingerprint" => self.stored_fingerprint.clone().unwrap_or_default(),
            "state" => self.state.to_string(),
            "built_once" => self.built_once.to_string(),
            "dir_size" => self.dir_size.to_string(),
            "docker_image" => self.docker.as_ref()?.image.clone(),
            "docker_src_volume" => self.docker.as_ref()?.volume.clone(),
            _ => return None,
        };
        Some(value)
    }

    /// All items in display order
    pub fn items(&self) -> Vec<(&'static str, String)> {
        self.names()
            .into_iter()
            .filter_map(|name| self.get(name).map(|v| (name, v)))
            .collect()
    }
}

/// What `Pipeline::clean` removed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanReport {
    pub workspace: PathBuf,
    /// Whether the workspace directory existed
    pub removed: bool,
    /// Docker images and volumes removed along with it
    pub docker_removed: Vec<String>,
}

/// Drives scripts through the cache
pub struct Pipeline {
    cache_root: PathBuf,
    orchestrator: BuildOrchestrator,
}

impl Pipeline {
    /// Pipeline using the cache root, shell and Docker CLI from `config`
    pub fn new(config: &Config) -> KilnResult<Self> {
        Ok(Self::with_cache_root(cache::cache_root(config)?, config))
    }

    /// Pipeline with an explicit cache root
    pub fn with_cache_root(cache_root: PathBuf, config: &Config) -> Self {
        Self {
            cache_root,
            orchestrator: BuildOrchestrator::new(
                config.build.shell.clone(),
                config.build.docker.clone(),
            ),
        }
    }

    /// Bring the script's workspace up to date for `mode`
    pub async fn prepare(&self, script: &Path, mode: BuildMode) -> KilnResult<Prepared> {
        let (parsed, canonical) = load(script).await?;
        let fingerprint = fingerprint_of(&parsed, &canonical)?;
        let resolution = Workspace::resolve(&self.cache_root, &canonical, fingerprint).await?;
        let state = resolution.state();

        let needs_setup = !resolution.built_once && parsed.manifest.build_once_cmd.is_some();
        if !resolution.is_stale() && !mode.forces_build() && !needs_setup {
            info!("Cache hit for {}", canonical.display());
            return Ok(Prepared {
                parsed,
                script: canonical,
                resolution,
                state,
                build: None,
            });
        }

        info!(
            "Building {} (state: {}, mode: {})",
            canonical.display(),
            state,
            mode
        );
        let report = materialize(resolution.workspace.dir(), &parsed).await?;
        debug!("Materialize report: {:?}", report);

        let job = BuildJob {
            manifest: &parsed.manifest,
            workspace: &resolution.workspace,
            script: &canonical,
            fingerprint: &resolution.fingerprint,
            run_build_once: !resolution.built_once || mode.forces_build_once(),
            mode,
        };
        let build = self.orchestrator.run(&job).await?;

        Ok(Prepared {
            parsed,
            script: canonical,
            resolution,
            state,
            build: Some(build),
        })
    }

    /// Inspect a script's workspace without building or creating it
    pub async fn inspect(&self, script: &Path) -> KilnResult<CacheInfo> {
        let (parsed, canonical) = load(script).await?;
        let fingerprint = fingerprint_of(&parsed, &canonical)?;
        let workspace = Workspace::for_script(&self.cache_root, &canonical);

        let stored = workspace.load_fingerprint().await?.map(|r| r.fingerprint);
        let state = match &stored {
            None => CacheState::NeverBuilt,
            Some(fp) if *fp == fingerprint => CacheState::Fresh,
            Some(_) => CacheState::Stale,
        };

        Ok(CacheInfo {
            cache_path: workspace.dir().to_path_buf(),
            fingerprint,
            stored_fingerprint: stored,
            state,
            built_once: workspace.is_built_once().await?,
            dir_size: dir_size(workspace.dir()),
            docker: parsed
                .manifest
                .docker()
                .map(|_| DockerNames::for_workspace(workspace.dir())),
        })
    }

    /// Remove a script's workspace; the script itself may already be gone
    ///
    /// When the script still exists and builds in Docker, its image and
    /// source volume are removed too.
    pub async fn clean(&self, script: &Path) -> KilnResult<CleanReport> {
        check_script_path(script)?;
        let canonical = match std::fs::canonicalize(script) {
            Ok(path) => path,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("{} does not exist, cleaning by its absolute path", script.display());
                std::path::absolute(script)
                    .map_err(|e| KilnError::io(format!("resolving {}", script.display()), e))?
            }
            Err(e) => return Err(KilnError::io(format!("resolving {}", script.display()), e)),
        };

        let workspace = Workspace::for_script(&self.cache_root, &canonical);
        let uses_docker = match ParsedScript::from_file(&canonical).await {
            Ok(parsed) => parsed.manifest.docker().is_some(),
            Err(e) => {
                debug!("Not checking Docker artifacts: {}", e);
                false
            }
        };

        let removed = workspace.remove().await?;
        let docker_removed = if uses_docker {
            let names = DockerNames::for_workspace(workspace.dir());
            docker::remove_artifacts(self.orchestrator.docker_cli(), &names).await
        } else {
            Vec::new()
        };

        Ok(CleanReport {
            workspace: workspace.dir().to_path_buf(),
            removed,
            docker_removed,
        })
    }
}

/// Script paths must be explicit so they cannot be mistaken for subcommands
pub fn check_script_path(path: &Path) -> KilnResult<()> {
    let text = path.to_string_lossy();
    if text.starts_with('.') || text.starts_with('/') {
        return Ok(());
    }
    Err(KilnError::ScriptPath {
        path: path.to_path_buf(),
        reason: "must start with '.' or '/'".to_string(),
    })
}

async fn load(script: &Path) -> KilnResult<(ParsedScript, PathBuf)> {
    check_script_path(script)?;
    let canonical = tokio::fs::canonicalize(script)
        .await
        .map_err(|e| KilnError::io(format!("resolving script {}", script.display()), e))?;
    let parsed = ParsedScript::from_file(&canonical).await?;
    Ok((parsed, canonical))
}

fn fingerprint_of(parsed: &ParsedScript, canonical: &Path) -> KilnResult<String> {
    let script_dir = canonical.parent().unwrap_or_else(|| Path::new("/"));
    compute_fingerprint(parsed, script_dir)
}

fn dir_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}
