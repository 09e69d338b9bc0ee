pub mod config;
pub mod release;
pub mod update;

pub use config::{Config, Settings};
pub use update::{Outcome, UpdatePipeline, UpdateService};
