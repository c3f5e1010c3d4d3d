//! Integration tests for Kiln

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    fn kiln(home: &TempDir) -> Command {
        let mut cmd = cargo_bin_cmd!("kiln");
        cmd.env("KILN_CACHE_HOME", home.path().join("cache"))
            .env("KILN_CONFIG", home.path().join("config.toml"))
            .env_remove("KILN_LOG");
        cmd
    }

    #[test]
    fn help_displays() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("single-file programs"));
    }

    #[test]
    fn version_displays() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("kiln"));
    }

    #[test]
    fn config_path_honors_env() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[build]"));
    }

    #[test]
    fn config_set_persists() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .args(["config", "set", "build.shell", "/bin/bash"])
            .assert()
            .success();
        kiln(&home)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("/bin/bash"));
    }

    #[test]
    fn config_set_unknown_key_fails() {
        let home = TempDir::new().unwrap();
        kiln(&home)
            .args(["config", "set", "vm.name", "x"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Unknown config key"));
    }
}

#[cfg(unix)]
mod run_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use std::path::{Path, PathBuf};
    use std::process::Stdio;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct Env {
        home: TempDir,
        dir: TempDir,
    }

    impl Env {
        fn new() -> Self {
            Self {
                home: TempDir::new().unwrap(),
                dir: TempDir::new().unwrap(),
            }
        }

        fn kiln(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("kiln");
            cmd.env("KILN_CACHE_HOME", self.home.path().join("cache"))
                .env("KILN_CONFIG", self.home.path().join("config.toml"))
                .env_remove("KILN_LOG");
            cmd
        }

        /// Write `tool.sh` with the given manifest lines and body
        fn script(&self, manifest: &[&str], body: &str) -> PathBuf {
            let mut source = String::from("#!/usr/bin/env kiln\n# kiln-begin\n# script_src: tool.sh\n");
            for line in manifest {
                source.push_str("# ");
                source.push_str(line);
                source.push('\n');
            }
            source.push_str("# kiln-end\n");
            source.push_str(body);

            let path = self.dir.path().join("tool.sh");
            std::fs::write(&path, source).unwrap();
            path
        }

        fn count(&self, name: &str) -> usize {
            std::fs::read_to_string(self.dir.path().join(name))
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }
    }

    const COUNT_BUILD: &str = "build_cmd: echo x >> \"$KILN_SOURCE_DIR/build.count\"";
    const COUNT_ONCE: &str = "build_once_cmd: echo x >> \"$KILN_SOURCE_DIR/once.count\"";
    const RUN_BODY: &str = "target_bin: /bin/sh @@@/tool.sh";

    fn arg(path: &Path) -> &str {
        path.to_str().unwrap()
    }

    #[test]
    fn builds_once_then_hits_cache() {
        let env = Env::new();
        let script = env.script(
            &[
                "build_cmd: touch built.marker && echo x >> \"$KILN_SOURCE_DIR/counter\"",
                "target_bin: /bin/cat @@@/built.marker",
            ],
            "echo unused\n",
        );

        env.kiln().arg(arg(&script)).assert().success();
        assert_eq!(env.count("counter"), 1);

        env.kiln().arg(arg(&script)).assert().success();
        assert_eq!(env.count("counter"), 1);
    }

    #[test]
    fn edit_triggers_rebuild() {
        let env = Env::new();
        let script = env.script(&[COUNT_BUILD, RUN_BODY], "echo one\n");

        env.kiln()
            .arg(arg(&script))
            .assert()
            .success()
            .stdout("one\n");

        env.script(&[COUNT_BUILD, RUN_BODY], "echo two\n");
        env.kiln()
            .arg(arg(&script))
            .assert()
            .success()
            .stdout("two\n");

        assert_eq!(env.count("build.count"), 2);
    }

    #[test]
    fn setup_runs_exactly_once() {
        let env = Env::new();
        for body in ["echo a\n", "echo b\n", "echo c\n"] {
            let script = env.script(&[COUNT_ONCE, COUNT_BUILD, RUN_BODY], body);
            env.kiln().arg(arg(&script)).assert().success();
        }

        assert_eq!(env.count("once.count"), 1);
        assert_eq!(env.count("build.count"), 3);
    }

    #[test]
    fn failed_build_is_retried() {
        let env = Env::new();
        let script = env.script(
            &["build_cmd: echo x >> \"$KILN_SOURCE_DIR/build.count\"; exit 1", RUN_BODY],
            "echo never\n",
        );

        for _ in 0..2 {
            env.kiln()
                .arg(arg(&script))
                .assert()
                .code(70)
                .stdout(predicate::str::contains("never").not())
                .stderr(predicate::str::contains("Error:").and(predicate::str::contains("build_cmd failed")));
        }

        assert_eq!(env.count("build.count"), 2);
    }

    #[test]
    fn target_exit_codes_pass_through() {
        let env = Env::new();
        let script = env.script(&[RUN_BODY], "exit \"${1:-0}\"\n");

        for code in [0, 1, 42] {
            env.kiln()
                .arg(arg(&script))
                .arg(code.to_string())
                .assert()
                .code(code);
        }
    }

    #[test]
    fn arguments_forwarded_verbatim() {
        let env = Env::new();
        let script = env.script(&[RUN_BODY], "printf '%s\\n' \"$@\"\n");

        env.kiln()
            .args([arg(&script), "--input", "5", "-v"])
            .assert()
            .success()
            .stdout("--input\n5\n-v\n");

        env.kiln()
            .args([arg(&script), "--", "--help"])
            .assert()
            .success()
            .stdout("--help\n");

        env.kiln()
            .args(["run", arg(&script), "--input", "5"])
            .assert()
            .success()
            .stdout("--input\n5\n");
    }

    #[test]
    fn stdin_passes_through() {
        let env = Env::new();
        let script = env.script(&[RUN_BODY], "cat\n");

        env.kiln()
            .arg(arg(&script))
            .write_stdin("hello from stdin\n")
            .assert()
            .success()
            .stdout("hello from stdin\n");
    }

    #[test]
    fn auxiliary_executable_is_default_target() {
        let env = Env::new();
        let script = env.script(
            &[
                "files:",
                "  - path: script",
                "    mode: \"0755\"",
                "    content: |",
                "      #!/bin/sh",
                "      echo from-aux \"$@\"",
            ],
            "echo unused\n",
        );

        env.kiln()
            .args([arg(&script), "x"])
            .assert()
            .success()
            .stdout("from-aux x\n");
    }

    #[test]
    fn missing_manifest_is_runner_error() {
        let env = Env::new();
        let path = env.dir.path().join("plain.sh");
        std::fs::write(&path, "#!/bin/sh\necho hi\n").unwrap();

        env.kiln()
            .arg(arg(&path))
            .assert()
            .code(65)
            .stderr(predicate::str::contains("No embedded manifest"));
    }

    #[test]
    fn malformed_manifest_is_runner_error() {
        let env = Env::new();
        let script = env.script(&["build_cmd: [unclosed"], "echo hi\n");

        env.kiln()
            .arg(arg(&script))
            .assert()
            .code(65)
            .stderr(predicate::str::contains("Malformed manifest"));
    }

    #[test]
    fn missing_target_is_127() {
        let env = Env::new();
        let script = env.script(&["target_bin: ./does-not-exist"], "echo hi\n");

        env.kiln()
            .arg(arg(&script))
            .assert()
            .code(127)
            .stderr(predicate::str::contains("Target not found"));
    }

    #[test]
    fn bare_script_path_rejected() {
        let env = Env::new();
        env.kiln()
            .args(["run", "tool.sh"])
            .current_dir(env.dir.path())
            .assert()
            .code(64)
            .stderr(predicate::str::contains("must start with"));
    }

    #[test]
    fn relative_script_path_works() {
        let env = Env::new();
        env.script(&[RUN_BODY], "echo relative\n");

        env.kiln()
            .arg("./tool.sh")
            .current_dir(env.dir.path())
            .assert()
            .success()
            .stdout("relative\n");
    }

    #[test]
    fn build_command_does_not_run_target() {
        let env = Env::new();
        let script = env.script(&[COUNT_BUILD, RUN_BODY], "touch \"$(dirname \"$0\")/ran\"\n");

        env.kiln()
            .args(["build", arg(&script)])
            .assert()
            .success()
            .stdout(predicate::str::contains("Built"));
        env.kiln()
            .args(["build", arg(&script)])
            .assert()
            .success()
            .stdout(predicate::str::contains("Up to date"));
        env.kiln()
            .args(["build", arg(&script), "--build-mode", "source"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Built"));

        assert_eq!(env.count("build.count"), 2);
        assert!(!env.dir.path().join("ran").exists());
    }

    #[test]
    fn cache_info_get_and_clean() {
        let env = Env::new();
        let script = env.script(&[RUN_BODY], "echo hi\n");

        env.kiln()
            .args(["cache", "get", "state", arg(&script)])
            .assert()
            .success()
            .stdout("never-built\n");

        env.kiln().arg(arg(&script)).assert().success();

        env.kiln()
            .args(["cache", "get", "state", arg(&script)])
            .assert()
            .success()
            .stdout("fresh\n");
        env.kiln()
            .args(["cache", "info", arg(&script)])
            .assert()
            .success()
            .stdout(predicate::str::contains("cache_path").and(predicate::str::contains("dir_size")));
        env.kiln()
            .args(["cache", "get", "bogus", arg(&script)])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Available: cache_path"));

        env.kiln()
            .args(["cache", "clear", arg(&script)])
            .assert()
            .success()
            .stdout(predicate::str::contains("Removed"));
        env.kiln()
            .args(["cache", "get", "state", arg(&script)])
            .assert()
            .success()
            .stdout("never-built\n");
    }

    fn process_alive(pid: i32) -> bool {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        // Zombies waiting for init to reap them count as gone
        if let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            let state = stat.rsplit(')').next().and_then(|rest| rest.trim().chars().next());
            return state != Some('Z');
        }
        kill(Pid::from_raw(pid), None).is_ok()
    }

    fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        done()
    }

    #[test]
    fn sigterm_cancels_build_and_its_children() {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let env = Env::new();
        let script = env.script(
            &[
                "build_cmd: sleep 30 & echo $! > \"$KILN_SOURCE_DIR/sleep.pid\"; wait",
                RUN_BODY,
            ],
            "echo never\n",
        );
        let pid_file = env.dir.path().join("sleep.pid");

        let mut child = std::process::Command::new(env!("CARGO_BIN_EXE_kiln"))
            .arg(arg(&script))
            .env("KILN_CACHE_HOME", env.home.path().join("cache"))
            .env("KILN_CONFIG", env.home.path().join("config.toml"))
            .env_remove("KILN_LOG")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let sleep_pid = || {
            std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse::<i32>().ok())
        };
        assert!(wait_until(Duration::from_secs(20), || sleep_pid().is_some()));
        let sleep_pid = sleep_pid().unwrap();

        kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();

        let mut status = None;
        assert!(wait_until(Duration::from_secs(10), || {
            status = child.try_wait().unwrap();
            status.is_some()
        }));
        assert_eq!(status.unwrap().code(), Some(130));

        assert!(wait_until(Duration::from_secs(5), || !process_alive(sleep_pid)));

        env.kiln()
            .args(["cache", "get", "state", arg(&script)])
            .assert()
            .success()
            .stdout("never-built\n");
    }
}
