//! CLI argument definitions using clap derive

use crate::build::BuildMode;
use clap::{ArgAction, Parser, Subcommand};
use std::ffi::OsString;
use std::path::PathBuf;

/// Kiln - build and run single-file programs
///
/// Scripts embed a build manifest in a comment block. Kiln materializes the
/// script into a cached workspace, builds it when it changed, and execs the
/// result. Use it as a shebang: `#!/usr/bin/env kiln`.
#[derive(Parser, Debug)]
#[command(name = "kiln")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Increase verbosity (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Configuration file path
    #[arg(short, long, global = true, env = "KILN_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Build a script if needed, then run it
    Run(RunArgs),

    /// Build a script without running it
    Build(BuildArgs),

    /// Inspect or remove a script's cache workspace
    Cache(CacheArgs),

    /// Show or edit configuration
    Config(ConfigArgs),
}

/// Arguments for the run command
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Script path (must start with '.' or '/')
    pub script: PathBuf,

    /// Arguments forwarded to the target
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<OsString>,
}

/// Arguments for the build command
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Script path (must start with '.' or '/')
    pub script: PathBuf,

    /// What to rebuild regardless of cache state
    #[arg(short, long, value_enum, default_value_t = BuildMode::Default)]
    pub build_mode: BuildMode,
}

/// Arguments for the cache command
#[derive(Parser, Debug)]
pub struct CacheArgs {
    /// Subcommand for cache
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Subcommand, Debug)]
pub enum CacheAction {
    /// Show cache details for a script
    Info {
        /// Script path
        script: PathBuf,
    },

    /// Print a single cache detail (e.g. cache_path)
    Get {
        /// Item name
        name: String,

        /// Script path
        script: PathBuf,
    },

    /// Remove a script's cache workspace
    #[command(alias = "clear")]
    Clean {
        /// Script path
        script: PathBuf,
    },
}

/// Arguments for the config command
#[derive(Parser, Debug)]
pub struct ConfigArgs {
    /// Subcommand for config
    #[command(subcommand)]
    pub action: Option<ConfigAction>,
}

/// Config subcommands
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Show configuration file path
    Path,

    /// Initialize default configuration
    Init {
        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Set a configuration value
    Set {
        /// Configuration key (e.g., build.shell)
        key: String,
        /// Value to set
        value: String,
    },
}

/// Invocation without a subcommand: `kiln <script> [--] [args...]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectRun {
    pub script: PathBuf,
    pub args: Vec<OsString>,
}

impl DirectRun {
    /// Detect the shebang form from raw argv
    ///
    /// The first argument is taken as a script when it starts with '.' or
    /// '/'. A single `--` right after it is dropped; everything else is
    /// forwarded untouched, including flags clap would otherwise consume.
    pub fn from_args(argv: &[OsString]) -> Option<Self> {
        let first = argv.get(1)?;
        let text = first.to_string_lossy();
        if !(text.starts_with('.') || text.starts_with('/')) {
            return None;
        }

        let mut rest = &argv[2..];
        if rest.first().is_some_and(|a| a == "--") {
            rest = &rest[1..];
        }

        Some(Self {
            script: PathBuf::from(first),
            args: rest.to_vec(),
        })
    }
}
