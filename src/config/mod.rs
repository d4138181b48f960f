//! Configuration management

mod settings;

pub use settings::{ConfigError, Settings};
