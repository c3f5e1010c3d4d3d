//! Config command - show or edit configuration

use crate::cli::args::{ConfigAction, ConfigArgs};
use crate::config::{Config, ConfigManager};
use crate::error::{KilnError, KilnResult};
use console::style;
use std::path::PathBuf;

/// Keys accepted by `kiln config set`
const VALID_KEYS: [&str; 5] = [
    "general.verbose",
    "general.log_format",
    "cache.root",
    "build.shell",
    "build.docker",
];

/// Execute the config command
pub async fn execute(args: ConfigArgs, manager: &ConfigManager, config: &Config) -> KilnResult<()> {
    match args.action {
        None | Some(ConfigAction::Show) => show_config(config)?,
        Some(ConfigAction::Path) => println!("{}", manager.path().display()),
        Some(ConfigAction::Init { force }) => init_config(manager, force).await?,
        Some(ConfigAction::Set { key, value }) => {
            let mut config = config.clone();
            set_value(&mut config, &key, &value)?;
            manager.save(&config).await?;
            println!("{} {} = {}", style("Set").green(), key, value);
        }
    }

    Ok(())
}

fn show_config(config: &Config) -> KilnResult<()> {
    println!("{}", toml::to_string_pretty(config)?);
    Ok(())
}

async fn init_config(manager: &ConfigManager, force: bool) -> KilnResult<()> {
    let path = manager.path();

    if path.exists() && !force {
        println!(
            "{} Config already exists at {}",
            style("!").yellow(),
            path.display()
        );
        println!("  Use --force to overwrite");
        return Ok(());
    }

    manager.save(&Config::default()).await?;
    println!(
        "{} Configuration initialized at {}",
        style("✓").green(),
        path.display()
    );

    Ok(())
}

/// Apply a dot-separated key to `config`
fn set_value(config: &mut Config, key: &str, value: &str) -> KilnResult<()> {
    let parts: Vec<&str> = key.split('.').collect();

    match parts.as_slice() {
        ["general", "verbose"] => config.general.verbose = parse_bool(value)?,
        ["general", "log_format"] => match value {
            "text" | "json" => config.general.log_format = value.to_string(),
            _ => {
                return Err(KilnError::User(format!(
                    "Invalid log format: {}. Use text or json",
                    value
                )))
            }
        },
        ["cache", "root"] => {
            config.cache.root = if value.is_empty() {
                None
            } else {
                Some(PathBuf::from(value))
            }
        }
        ["build", "shell"] => {
            if value.trim().is_empty() {
                return Err(KilnError::User("build.shell cannot be empty".to_string()));
            }
            config.build.shell = value.to_string()
        }
        ["build", "docker"] => {
            if value.trim().is_empty() {
                return Err(KilnError::User("build.docker cannot be empty".to_string()));
            }
            config.build.docker = value.to_string()
        }
        _ => {
            return Err(KilnError::User(format!(
                "Unknown config key: {}. Valid keys: {}",
                key,
                VALID_KEYS.join(", ")
            )))
        }
    }

    Ok(())
}

fn parse_bool(value: &str) -> KilnResult<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(KilnError::User(format!(
            "Invalid boolean value: {}. Use true/false",
            value
        ))),
    }
}
