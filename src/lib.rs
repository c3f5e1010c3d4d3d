//! Kiln - build and run single-file programs
//!
//! A script embeds its build manifest in a comment block. Kiln keeps one
//! cached workspace per script, rebuilds it only when the script's content
//! changes, and then execs the built target with the caller's arguments.

pub mod build;
pub mod cache;
pub mod cli;
pub mod config;
pub mod error;
pub mod exec;
pub mod manifest;
pub mod pipeline;

pub use error::{KilnError, KilnResult};
