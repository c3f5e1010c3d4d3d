//! Run command - build a script if needed, then exec its target

use crate::build::BuildMode;
use crate::cli::args::RunArgs;
use crate::config::Config;
use crate::error::KilnResult;
use crate::exec::TargetCommand;
use crate::pipeline::Pipeline;
use std::ffi::OsString;
use std::path::Path;
use tracing::debug;

/// Execute the run command
pub async fn execute(args: RunArgs, config: &Config) -> KilnResult<i32> {
    run_script(&args.script, &args.args, config).await
}

/// Shared by `kiln run` and the shebang form
///
/// On unix this only returns on failure; elsewhere it returns the target's
/// exit code.
pub async fn run_script(script: &Path, args: &[OsString], config: &Config) -> KilnResult<i32> {
    let pipeline = Pipeline::new(config)?;
    let prepared = pipeline.prepare(script, BuildMode::Default).await?;

    let target = TargetCommand::resolve(&prepared.parsed.manifest, prepared.workspace_dir(), args)?;
    debug!(
        "Target for {}: {} {:?}",
        prepared.script.display(),
        target.program,
        target.args
    );

    target.exec()
}
