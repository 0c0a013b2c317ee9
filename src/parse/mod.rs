#[allow(clippy::module_inception)]
mod parse;

pub use parse::{parser, split_env_entry, Config, ConfigSource, ServiceConfig};
