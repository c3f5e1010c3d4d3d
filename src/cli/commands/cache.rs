//! Cache command - inspect or remove script workspaces

use crate::cache::CacheState;
use crate::cli::args::{CacheAction, CacheArgs};
use crate::config::Config;
use crate::error::{KilnError, KilnResult};
use crate::pipeline::Pipeline;
use console::style;
use std::path::Path;

/// Execute the cache command
pub async fn execute(args: CacheArgs, config: &Config) -> KilnResult<()> {
    let pipeline = Pipeline::new(config)?;

    match args.action {
        CacheAction::Info { script } => show_info(&pipeline, &script).await,
        CacheAction::Get { name, script } => get_item(&pipeline, &name, &script).await,
        CacheAction::Clean { script } => clean(&pipeline, &script).await,
    }
}

async fn show_info(pipeline: &Pipeline, script: &Path) -> KilnResult<()> {
    let info = pipeline.inspect(script).await?;

    for (name, value) in info.items() {
        let value = match name {
            "state" => match info.state {
                CacheState::Fresh => style(value).green().to_string(),
                CacheState::Stale => style(value).yellow().to_string(),
                CacheState::NeverBuilt => style(value).dim().to_string(),
            },
            _ => value,
        };
        println!("{:<20} {}", style(name).cyan(), value);
    }

    Ok(())
}

async fn get_item(pipeline: &Pipeline, name: &str, script: &Path) -> KilnResult<()> {
    let info = pipeline.inspect(script).await?;

    let value = info.get(name).ok_or_else(|| {
        KilnError::User(format!(
            "Unknown cache item '{}'. Available: {}",
            name,
            info.names().join(", ")
        ))
    })?;
    println!("{}", value);

    Ok(())
}

async fn clean(pipeline: &Pipeline, script: &Path) -> KilnResult<()> {
    let report = pipeline.clean(script).await?;

    if report.removed {
        println!("{} {}", style("Removed").green(), report.workspace.display());
    } else {
        println!("No cache workspace at {}", report.workspace.display());
    }
    for name in &report.docker_removed {
        println!("{} {}", style("Removed").green(), name);
    }

    Ok(())
}
