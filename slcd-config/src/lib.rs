//! Experiment configuration for the SLCD line detection and matching network.
//!
//! The [Config](config::Config) holds the user-facing hyperparameters. It is
//! aggregated into [Settings](settings::Settings) against a [Workspace](settings::Workspace),
//! which fills in the derived dataset values, the experiment name and the
//! output and checkpoint paths.

mod common;
pub mod config;
pub mod options_log;
pub mod schedule;
pub mod settings;

pub use config::*;
pub use options_log::*;
pub use schedule::*;
pub use settings::*;
