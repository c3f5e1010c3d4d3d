//! Kiln - build and run single-file programs
//!
//! CLI entry point. `kiln ./script [args]` (the shebang form) skips clap so
//! every argument reaches the target untouched; everything else dispatches
//! to subcommands.

use clap::Parser;
use console::style;
use kiln::cli::{Cli, Commands, DirectRun};
use kiln::config::{Config, ConfigManager};
use kiln::error::KilnResult;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Environment variable overriding the log filter
const LOG_ENV: &str = "KILN_LOG";

/// Environment variable naming the config file
const CONFIG_ENV: &str = "KILN_CONFIG";

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            if let Some(hint) = e.hint() {
                eprintln!("{} {}", style("Hint:").yellow(), hint);
            }
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run() -> KilnResult<u8> {
    let argv: Vec<OsString> = std::env::args_os().collect();

    if let Some(direct) = DirectRun::from_args(&argv) {
        let config_path = std::env::var_os(CONFIG_ENV)
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);
        let (_, config) = load_config(config_path).await?;
        init_logging(0, &config);

        debug!("Direct run of {}", direct.script.display());
        let code = kiln::cli::commands::run_script(&direct.script, &direct.args, &config).await?;
        return Ok(exit_byte(code));
    }

    let cli = Cli::parse_from(argv);
    let (manager, config) = load_config(cli.config.clone()).await?;
    init_logging(cli.verbose, &config);

    match cli.command {
        Commands::Run(args) => {
            let code = kiln::cli::commands::run(args, &config).await?;
            Ok(exit_byte(code))
        }
        Commands::Build(args) => kiln::cli::commands::build(args, &config).await.map(|()| 0),
        Commands::Cache(args) => kiln::cli::commands::cache(args, &config).await.map(|()| 0),
        Commands::Config(args) => kiln::cli::commands::config(args, &manager, &config)
            .await
            .map(|()| 0),
    }
}

async fn load_config(path: Option<PathBuf>) -> KilnResult<(ConfigManager, Config)> {
    let manager = match path {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new(),
    };
    let config = manager.load().await?;
    Ok((manager, config))
}

/// Logs go to stderr so the target's stdout stays clean.
/// `KILN_LOG` wins over -v; 0 = warn, 1 = info, 2+ = debug.
fn init_logging(verbose: u8, config: &Config) {
    let level = match verbose {
        0 if config.general.verbose => "kiln=info",
        0 => "kiln=warn",
        1 => "kiln=info",
        _ => "kiln=debug",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if config.general.log_format == "json" {
        builder.json().init();
    } else {
        builder.without_time().init();
    }
}

fn exit_byte(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(1)
}
