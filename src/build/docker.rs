//! Containerized builds
//!
//! For a workspace whose manifest carries `docker_build`:
//!
//! 1. `Dockerfile.kiln` is written into the workspace
//! 2. the workspace is copied into a named source volume
//! 3. the image is built from the workspace (`--no-cache` in full mode)
//! 4. `build_cmd` runs in the image, with the volume at `src_mount_dir`
//! 5. the target is copied from the volume back into the workspace
//!
//! Image and volume names derive from the workspace path, so each script
//! keeps its own pair across rebuilds.

use super::orchestrator::{run_step, BuildJob, Step, SOURCE_VAR};
use crate::build::BuildMode;
use crate::error::{KilnError, KilnResult};
use crate::exec::WORKSPACE_TOKEN;
use crate::manifest::{DockerBuild, Manifest};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Dockerfile written into the workspace
pub const DOCKERFILE_NAME: &str = "Dockerfile.kiln";

/// Small image used to move files between the workspace and the volume
const HELPER_IMAGE: &str = "busybox";

/// Image label pointing back at the workspace
const CACHE_PATH_LABEL: &str = "kiln-cache-path";

/// Image and volume owned by one workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerNames {
    pub image: String,
    pub volume: String,
}

impl DockerNames {
    pub fn for_workspace(dir: &Path) -> Self {
        let name: String = dir
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default()
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        let hash = hex::encode(Sha256::digest(dir.to_string_lossy().as_bytes()));
        let prefix = format!("kiln-{}-{}", name.trim_matches('-'), &hash[..16]);

        Self {
            volume: format!("{}-src", prefix),
            image: prefix,
        }
    }
}

/// Run `build_cmd` for `job` inside Docker
pub(crate) async fn build(
    docker: &str,
    job: &BuildJob<'_>,
    settings: &DockerBuild,
    build_cmd: &str,
) -> KilnResult<()> {
    let workspace = job.workspace.dir();
    let names = DockerNames::for_workspace(workspace);

    let dockerfile = workspace.join(DOCKERFILE_NAME);
    tokio::fs::write(&dockerfile, settings.dockerfile.as_deref().unwrap_or_default())
        .await
        .map_err(|source| KilnError::Materialization {
            path: dockerfile.clone(),
            source,
        })?;

    let target = target_artifact(job.manifest);
    for args in plan(&names, job, settings, build_cmd, target.as_deref()) {
        let label = format!("{} {}", docker, shell_words::join(&args));
        info!("{}", label);

        let mut command = Command::new(docker);
        command.args(&args).current_dir(workspace);
        run_step(command, Step::Build, &label).await?;
    }
    Ok(())
}

/// Every `docker` invocation of a build, in order
fn plan(
    names: &DockerNames,
    job: &BuildJob<'_>,
    settings: &DockerBuild,
    build_cmd: &str,
    target: Option<&str>,
) -> Vec<Vec<String>> {
    let workspace = job.workspace.dir().to_string_lossy();
    let volume_mount = format!("{}:/vol", names.volume);
    let workspace_mount = format!("{}:/src", workspace);
    let mut steps = Vec::new();

    steps.push(words(&["volume", "create", &names.volume]));
    steps.push(words(&[
        "run",
        "--rm",
        "-v",
        &volume_mount,
        "-v",
        &workspace_mount,
        HELPER_IMAGE,
        "sh",
        "-c",
        "cp -rf /src/. /vol/",
    ]));

    let mut image = words(&["build"]);
    if job.mode == BuildMode::Full {
        image.push("--no-cache".to_string());
    }
    image.extend(words(&[
        "-t",
        &names.image,
        "--label",
        &format!("{}={}", CACHE_PATH_LABEL, workspace),
        "-f",
        DOCKERFILE_NAME,
        ".",
    ]));
    steps.push(image);

    let mut run = words(&[
        "run",
        "--rm",
        "--env",
        &format!("{}={}", SOURCE_VAR, job.script.display()),
    ]);
    if let Some(mount) = &settings.src_mount_dir {
        run.push("-v".to_string());
        run.push(format!("{}:{}", names.volume, mount));
    }
    run.extend(settings.extra_args.iter().cloned());
    run.extend(words(&[&names.image, "sh", "-c", build_cmd]));
    steps.push(run);

    if let Some(target) = target {
        let dest = format!("/src/{}", target);
        let parent = Path::new(&dest)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "/src".to_string());
        let copy = format!(
            "mkdir -p {} && cp -rf {} {}",
            shell_words::quote(&parent),
            shell_words::quote(&format!("/vol/{}", target)),
            shell_words::quote(&dest)
        );

        let mut back = words(&["run", "--rm"]);
        if let Some(user) = host_user() {
            back.push("-u".to_string());
            back.push(user);
        }
        back.extend(words(&[
            "-v",
            &volume_mount,
            "-v",
            &workspace_mount,
            HELPER_IMAGE,
            "sh",
            "-c",
            &copy,
        ]));
        steps.push(back);
    }

    steps
}

/// Workspace-relative path of the built target, if it lives in the workspace
fn target_artifact(manifest: &Manifest) -> Option<String> {
    let first = shell_words::split(&manifest.target_bin).ok()?.into_iter().next()?;
    let prefix = format!("{}/", WORKSPACE_TOKEN);

    let relative = if let Some(rest) = first.strip_prefix(&prefix) {
        rest.to_string()
    } else if first.contains(WORKSPACE_TOKEN) {
        warn!("Cannot copy target {:?} out of the container", first);
        return None;
    } else if Path::new(&first).is_absolute() || !first.contains('/') {
        debug!("Target {:?} is outside the workspace, nothing to copy back", first);
        return None;
    } else {
        first.trim_start_matches("./").to_string()
    };

    (!relative.is_empty()).then_some(relative)
}

#[cfg(unix)]
fn host_user() -> Option<String> {
    use nix::unistd::{getgid, getuid};
    Some(format!("{}:{}", getuid(), getgid()))
}

#[cfg(not(unix))]
fn host_user() -> Option<String> {
    None
}

/// Remove the image and volume of a workspace, ignoring failures
///
/// Returns the names that were removed.
pub async fn remove_artifacts(docker: &str, names: &DockerNames) -> Vec<String> {
    let mut removed = Vec::new();
    for (kind, name) in [("image", &names.image), ("volume", &names.volume)] {
        let status = Command::new(docker)
            .args([kind, "rm", name.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(status) if status.success() => removed.push(name.clone()),
            Ok(status) => debug!("{} {} rm {} exited with {}", docker, kind, name, status),
            Err(e) => debug!("{} {} rm {} failed: {}", docker, kind, name, e),
        }
    }
    removed
}

fn words(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Workspace;
    use crate::manifest::ParsedScript;
    use std::path::PathBuf;

    fn manifest(lines: &[&str]) -> Manifest {
        let mut source = String::from("# kiln-begin\n# script_src: main.c\n");
        for line in lines {
            source.push_str("# ");
            source.push_str(line);
            source.push('\n');
        }
        source.push_str("# kiln-end\nint main() {}\n");
        ParsedScript::parse(Path::new("./main.c"), &source)
            .unwrap()
            .manifest
    }

    fn target(target_bin: &str) -> Option<String> {
        target_artifact(&manifest(&[&format!("target_bin: \"{}\"", target_bin)]))
    }

    #[test]
    fn names_follow_workspace() {
        let a = DockerNames::for_workspace(Path::new("/cache/My_Tool.c-0123"));
        assert!(a.image.starts_with("kiln-my-tool-c-0123-"));
        assert_eq!(a.volume, format!("{}-src", a.image));
        assert_eq!(a.image.len(), "kiln-my-tool-c-0123-".len() + 16);

        let b = DockerNames::for_workspace(Path::new("/other/My_Tool.c-0123"));
        assert_ne!(a.image, b.image);
    }

    #[test]
    fn target_artifact_only_for_workspace_paths() {
        assert_eq!(target("./out/tool").as_deref(), Some("out/tool"));
        assert_eq!(target("@@@/bin/tool --fast").as_deref(), Some("bin/tool"));
        assert_eq!(target("./script").as_deref(), Some("script"));
        assert_eq!(target("/usr/bin/python3 @@@/main.py"), None);
        assert_eq!(target("python3"), None);
        assert_eq!(target("@@@"), None);
    }

    #[test]
    fn plan_mounts_source_and_forwards_extra_args() {
        let workspace = Workspace::for_script(Path::new("/cache"), Path::new("/src/main.c"));
        let script = PathBuf::from("/src/main.c");
        let m = manifest(&[
            "build_cmd: cc -o out/app main.c",
            "docker_build:",
            "  dockerfile: FROM gcc",
            "  src_mount_dir: /work",
            "  extra_args: [\"--network\", \"none\"]",
        ]);
        let job = BuildJob {
            manifest: &m,
            workspace: &workspace,
            script: &script,
            fingerprint: "fp",
            run_build_once: false,
            mode: BuildMode::Default,
        };
        let names = DockerNames::for_workspace(workspace.dir());
        let settings = m.docker().unwrap();

        let steps = plan(&names, &job, settings, "cc -o out/app main.c", Some("out/app"));

        assert_eq!(steps.len(), 5);
        assert_eq!(steps[0], ["volume", "create", names.volume.as_str()]);
        assert!(!steps[2].contains(&"--no-cache".to_string()));
        assert!(steps[2].contains(&names.image));

        let run = &steps[3];
        let mount = format!("{}:/work", names.volume);
        assert!(run.contains(&mount));
        assert!(run.contains(&"KILN_SOURCE=/src/main.c".to_string()));
        let extra = run.iter().position(|a| a == "--network").unwrap();
        assert_eq!(run[extra + 1], "none");
        assert_eq!(&run[run.len() - 4..], [names.image.as_str(), "sh", "-c", "cc -o out/app main.c"]);

        let copy = steps[4].last().unwrap();
        assert_eq!(copy, "mkdir -p /src/out && cp -rf /vol/out/app /src/out/app");
    }

    #[test]
    fn plan_without_mount_or_target() {
        let workspace = Workspace::for_script(Path::new("/cache"), Path::new("/src/main.c"));
        let script = PathBuf::from("/src/main.c");
        let m = manifest(&["build_cmd: make", "docker_build:", "  dockerfile: FROM gcc"]);
        let job = BuildJob {
            manifest: &m,
            workspace: &workspace,
            script: &script,
            fingerprint: "fp",
            run_build_once: false,
            mode: BuildMode::Full,
        };
        let names = DockerNames::for_workspace(workspace.dir());

        let steps = plan(&names, &job, m.docker().unwrap(), "make", None);

        assert_eq!(steps.len(), 4);
        assert_eq!(steps[2][1], "--no-cache");
        assert!(!steps[3].iter().any(|a| a.ends_with(":/vol") || a == "-v"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn remove_artifacts_ignores_failures() {
        let names = DockerNames::for_workspace(Path::new("/cache/tool-1"));
        assert!(remove_artifacts("/nonexistent/docker", &names).await.is_empty());
        assert_eq!(remove_artifacts("true", &names).await, [names.image.clone(), names.volume.clone()]);
    }
}
