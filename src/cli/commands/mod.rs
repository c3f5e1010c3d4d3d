//! CLI command implementations

pub mod build;
pub mod cache;
pub mod config;
pub mod run;

pub use build::execute as build;
pub use cache::execute as cache;
pub use config::execute as config;
pub use run::execute as run;
pub use run::run_script;
