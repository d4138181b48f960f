//! Command-line interface implementation

use crate::config::Settings;
use crate::error::ErrorKind;
use crate::proplist::{self, Proplist};
use clap::Parser;
use std::error::Error;
use std::path::PathBuf;

/// Command-line arguments for r-chime
#[derive(Parser, Debug, Clone, Default)]
#[command(author, about = "Play event sounds through a local sound server", long_about = None)]
pub struct Args {
    /// Event sound id to look up in the sound theme
    #[arg(short, long)]
    pub id: Option<String>,

    /// Sound file to play instead of a theme lookup
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Human readable description of the event
    #[arg(short, long)]
    pub description: Option<String>,

    /// Cache control: never, permanent or volatile
    #[arg(short, long, env = "CHIME_CACHE_CONTROL")]
    pub cache_control: Option<String>,

    /// Volume in dB
    #[arg(short = 'V', long, allow_hyphen_values = true)]
    pub volume: Option<String>,

    /// Number of times to play the sound
    #[arg(short, long = "loop", default_value_t = 1)]
    pub loops: u32,

    /// Additional event property as key=value
    #[arg(long = "property", value_name = "KEY=VALUE")]
    pub properties: Vec<String>,

    /// Only upload the sound into the server cache
    #[arg(long)]
    pub cache: bool,

    /// ALSA device to render to
    #[arg(short = 'D', long, env = "CHIME_ALSA_DEVICE")]
    pub alsa_device: Option<String>,

    /// Server-side output device for new playbacks
    #[arg(long, env = "CHIME_DEVICE")]
    pub device: Option<String>,

    /// Sound theme name
    #[arg(long, env = "CHIME_THEME")]
    pub theme: Option<String>,

    /// Config file path
    #[arg(long, env = "CHIME_CONFIG")]
    pub config: Option<PathBuf>,

    /// Discard audio instead of opening ALSA
    #[arg(long)]
    pub null_output: bool,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,
}

impl Args {
    /// Overlays command-line values on top of persisted settings.
    pub fn apply_to(&self, settings: &mut Settings) {
        if let Some(device) = &self.alsa_device {
            settings.alsa_device = device.clone();
        }
        if let Some(device) = &self.device {
            settings.device = Some(device.clone());
        }
        if let Some(theme) = &self.theme {
            settings.theme = theme.clone();
        }
        if let Some(directive) = &self.cache_control {
            settings.cache_control = Some(directive.clone());
        }
        if self.null_output {
            settings.null_output = true;
        }
    }

    /// Builds the event properties for one request.
    pub fn event_properties(&self, settings: &Settings) -> Result<Proplist, ErrorKind> {
        if self.id.is_none() && self.file.is_none() {
            return Err(ErrorKind::Invalid);
        }

        let mut props = Proplist::new();
        let id = match (&self.id, &self.file) {
            (Some(id), _) => id.clone(),
            (None, Some(file)) => file
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("file")
                .to_string(),
            (None, None) => return Err(ErrorKind::Invalid),
        };
        props.sets(proplist::EVENT_ID, &id)?;
        if let Some(file) = &self.file {
            let path = file.to_str().ok_or(ErrorKind::Invalid)?;
            props.sets(proplist::MEDIA_FILENAME, path)?;
        }
        if let Some(description) = &self.description {
            props.sets(proplist::EVENT_DESCRIPTION, description)?;
        }
        if let Some(volume) = &self.volume {
            props.sets(proplist::VOLUME, volume)?;
        }
        if let Some(directive) = &settings.cache_control {
            props.sets(proplist::CACHE_CONTROL, directive)?;
        }
        props.sets(proplist::THEME_NAME, &settings.theme)?;
        props.sets(proplist::THEME_OUTPUT_PROFILE, &settings.output_profile)?;

        for entry in &self.properties {
            let (key, value) = entry.split_once('=').ok_or(ErrorKind::Invalid)?;
            props.sets(key.trim(), value)?;
        }
        Ok(props)
    }
}

/// CLI user interface for the player
pub struct Cli {
    pub args: Args,
}

impl Default for Cli {
    fn default() -> Self {
        Self::new()
    }
}

impl Cli {
    /// Create a new CLI instance from the process arguments
    pub fn new() -> Self {
        Cli {
            args: Args::parse(),
        }
    }

    /// Line announcing a playback
    pub fn playback_line(event: &Proplist, round: u32, total: u32) -> String {
        let id = event.gets(proplist::EVENT_ID).unwrap_or("?");
        let description = event
            .gets(proplist::EVENT_DESCRIPTION)
            .map(|d| format!(" ({})", d))
            .unwrap_or_default();
        if total > 1 {
            format!("Playing {}{} [{}/{}]", id, description, round, total)
        } else {
            format!("Playing {}{}", id, description)
        }
    }

    /// Display playback information
    pub fn display_playback(&self, event: &Proplist, round: u32) {
        println!("{}", Self::playback_line(event, round, self.args.loops));
    }

    /// Display the outcome of a finished request
    pub fn display_outcome(&self, outcome: Result<(), ErrorKind>) {
        match outcome {
            Ok(()) => println!("Playback finished."),
            Err(ErrorKind::Canceled) => println!("Playback canceled."),
            Err(e) => eprintln!("Playback failed: {}", e),
        }
    }

    pub fn display_cached(&self, event: &Proplist) {
        println!(
            "Cached {}",
            event.gets(proplist::EVENT_ID).unwrap_or("?")
        );
    }

    /// Display error messages
    pub fn display_error(&self, error: &dyn Error) {
        eprintln!("Error: {}", error);
    }
}
