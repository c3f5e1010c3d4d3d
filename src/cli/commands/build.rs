//! Build command - bring a script's workspace up to date without running it

use crate::cli::args::BuildArgs;
use crate::config::Config;
use crate::error::KilnResult;
use crate::pipeline::Pipeline;
use console::style;

/// Execute the build command
pub async fn execute(args: BuildArgs, config: &Config) -> KilnResult<()> {
    let pipeline = Pipeline::new(config)?;
    let prepared = pipeline.prepare(&args.script, args.build_mode).await?;

    match prepared.build {
        Some(report) => {
            let mut steps = Vec::new();
            if report.ran_build_once {
                steps.push("build_once_cmd");
            }
            if report.ran_build {
                steps.push("build_cmd");
            }
            let detail = if steps.is_empty() {
                "materialized".to_string()
            } else {
                format!("ran {}", steps.join(", "))
            };
            println!(
                "{} {} ({})",
                style("Built").green().bold(),
                prepared.script.display(),
                detail
            );
        }
        None => println!(
            "{} {}",
            style("Up to date").dim(),
            prepared.script.display()
        ),
    }
    println!("  {}", prepared.workspace_dir().display());

    Ok(())
}
