//! CLI command implementations

mod config;
mod devices;
mod serve;

pub use config::{ConfigArgs, config};
pub use devices::devices;
pub use serve::{ServeArgs, serve};
