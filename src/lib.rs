//! r-chime library: event-sound playback requests brokered over a callback-driven sound server

pub mod broker;
pub mod config;
pub mod error;
pub mod logging;
pub mod proplist;
pub mod server;
pub mod sound;
pub mod ui;

pub use broker::{FinishCallback, Session, SessionOptions};
pub use error::{ErrorKind, Result};
pub use proplist::Proplist;

/// Initialize the application directories
pub fn init_app_dirs() -> std::io::Result<()> {
    let default_path = config::Settings::default_path();
    if let Some(config_dir) = default_path.parent() {
        if !config_dir.exists() {
            std::fs::create_dir_all(config_dir)?;
        }
    }
    Ok(())
}
