//! Integration tests for configuration management
//!
//! These tests verify that persisted settings and command-line overrides
//! combine into the event properties handed to the broker.

use r_chime::config::Settings;
use r_chime::proplist;
use r_chime::ui::Args;
use std::error::Error;
use tempfile::tempdir;

#[cfg(test)]
mod config_integration_tests {
    use super::*;

    /// Test complete configuration workflow
    #[test]
    fn test_config_lifecycle() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let config_path = dir.path().join("nested").join("config.json");

        let mut settings = Settings::default();
        settings.theme = "ocean".to_string();
        settings.alsa_device = "hw:1".to_string();
        settings.cache_control = Some("volatile".to_string());
        settings.device = Some("speakers".to_string());

        settings.validate()?;
        settings.save(&config_path)?;

        let loaded = Settings::load(&config_path)?;
        assert_eq!(loaded, settings);

        let mut updated = loaded;
        updated.null_output = true;
        updated.save(&config_path)?;

        let reloaded = Settings::load(&config_path)?;
        assert!(reloaded.null_output);
        assert_eq!(reloaded.theme, "ocean");

        Ok(())
    }

    /// Command line wins over the file, and the merged result reaches the event
    #[test]
    fn test_overrides_reach_event_properties() -> Result<(), Box<dyn Error>> {
        let dir = tempdir()?;
        let config_path = dir.path().join("config.json");

        let mut stored = Settings::default();
        stored.theme = "ocean".to_string();
        stored.cache_control = Some("never".to_string());
        stored.save(&config_path)?;

        let args = Args {
            id: Some("message-new-instant".to_string()),
            theme: Some("forest".to_string()),
            cache_control: Some("permanent".to_string()),
            ..Args::default()
        };
        let mut settings = Settings::load(&config_path)?;
        args.apply_to(&mut settings);
        settings.validate()?;

        let event = args.event_properties(&settings)?;
        assert_eq!(event.gets(proplist::EVENT_ID), Some("message-new-instant"));
        assert_eq!(event.gets(proplist::THEME_NAME), Some("forest"));
        assert_eq!(event.gets(proplist::CACHE_CONTROL), Some("permanent"));
        let outgoing = event.strip_internal();
        assert!(outgoing.contains(proplist::EVENT_ID));
        assert!(!outgoing.contains(proplist::THEME_NAME));
        assert!(!outgoing.contains(proplist::CACHE_CONTROL));

        Ok(())
    }

    /// Test invalid configuration handling
    #[test]
    fn test_invalid_config_validation() {
        let bad_driver = Settings {
            driver: Some("pulse".to_string()),
            ..Settings::default()
        };
        let result = bad_driver.validate();
        assert!(result.is_err());
        if let Err(e) = result {
            assert!(e.to_string().contains("Unsupported driver"));
        }

        let bad_directive = Settings {
            cache_control: Some("forever".to_string()),
            ..Settings::default()
        };
        assert!(bad_directive.validate().is_err());

        let empty_theme = Settings {
            theme: String::new(),
            ..Settings::default()
        };
        assert!(empty_theme.validate().is_err());
    }
}
