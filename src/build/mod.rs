//! Bringing a workspace up to date
//!
//! A stale workspace is first materialized (script body and auxiliary files
//! written from the manifest), then built (`build_once_cmd` on first use,
//! `build_cmd` every time), either through the host shell or inside Docker.

pub mod docker;
pub mod materialize;
pub mod orchestrator;

pub use docker::DockerNames;
pub use materialize::{materialize, MaterializeReport};
pub use orchestrator::{BuildJob, BuildOrchestrator, BuildReport};

use clap::ValueEnum;
use std::fmt;

/// How much of the build to force regardless of cache state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum BuildMode {
    /// Build only when the script changed
    #[default]
    Default,
    /// Re-materialize and re-run `build_cmd`
    Source,
    /// Also re-run `build_once_cmd`
    Full,
}

impl BuildMode {
    /// Whether the build runs even if the workspace is fresh
    pub fn forces_build(self) -> bool {
        !matches!(self, Self::Default)
    }

    /// Whether `build_once_cmd` runs even if it succeeded before
    pub fn forces_build_once(self) -> bool {
        matches!(self, Self::Full)
    }
}

impl fmt::Display for BuildMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Source => write!(f, "source"),
            Self::Full => write!(f, "full"),
        }
    }
}
