//! XDG sound-theme lookup.

use super::{decode_file, SoundFile, SoundResolver};
use crate::error::{ErrorKind, Result};
use crate::proplist::{self, Proplist};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

const LOG_TARGET: &str = "r_chime::sound::theme";

pub const DEFAULT_THEME: &str = "freedesktop";
pub const DEFAULT_OUTPUT_PROFILE: &str = "stereo";
const EXTENSIONS: [&str; 4] = ["disabled", "oga", "ogg", "wav"];

/// Parsed `index.theme` data, kept between lookups of one session.
#[derive(Debug, Default)]
pub struct ThemeState {
    inherits: HashMap<String, Vec<String>>,
}

impl ThemeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Themes whose inheritance has been read so far.
    pub fn cached_themes(&self) -> usize {
        self.inherits.len()
    }
}

/// Resolves `event.id` against the sound themes installed under the data directories.
#[derive(Debug, Clone)]
pub struct ThemeResolver {
    data_dirs: Vec<PathBuf>,
}

impl Default for ThemeResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ThemeResolver {
    /// Uses the user data directory followed by `$XDG_DATA_DIRS`.
    pub fn new() -> Self {
        let mut data_dirs = Vec::new();
        if let Some(user) = dirs::data_dir() {
            data_dirs.push(user);
        }
        match std::env::var("XDG_DATA_DIRS") {
            Ok(list) if !list.is_empty() => {
                data_dirs.extend(list.split(':').filter(|s| !s.is_empty()).map(PathBuf::from))
            }
            _ => {
                data_dirs.push(PathBuf::from("/usr/local/share"));
                data_dirs.push(PathBuf::from("/usr/share"));
            }
        }
        ThemeResolver { data_dirs }
    }

    pub fn with_data_dirs(data_dirs: Vec<PathBuf>) -> Self {
        ThemeResolver { data_dirs }
    }

    pub fn data_dirs(&self) -> &[PathBuf] {
        &self.data_dirs
    }

    fn read_inherits(&self, theme: &str) -> Vec<String> {
        for dir in &self.data_dirs {
            let index = dir.join("sounds").join(theme).join("index.theme");
            let Ok(content) = fs::read_to_string(&index) else {
                continue;
            };
            trace!(target: LOG_TARGET, "Reading {}", index.display());
            return parse_inherits(&content);
        }
        Vec::new()
    }

    /// The theme followed by its ancestors, breadth first, ending with the fallback theme.
    fn theme_chain(&self, state: &mut ThemeState, theme: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = VecDeque::from([theme.to_string()]);
        while let Some(name) = queue.pop_front() {
            if !seen.insert(name.clone()) {
                continue;
            }
            let parents = state
                .inherits
                .entry(name.clone())
                .or_insert_with(|| self.read_inherits(&name))
                .clone();
            queue.extend(parents);
            chain.push(name);
        }
        if seen.insert(DEFAULT_THEME.to_string()) {
            chain.push(DEFAULT_THEME.to_string());
        }
        chain
    }

    fn find_in_theme(&self, theme: &str, profile: &str, name: &str) -> Option<PathBuf> {
        for dir in &self.data_dirs {
            let root = dir.join("sounds").join(theme);
            for subdir in [root.join(profile), root.clone()] {
                for ext in EXTENSIONS {
                    let candidate = subdir.join(format!("{}.{}", name, ext));
                    if candidate.is_file() {
                        return Some(candidate);
                    }
                }
            }
        }
        None
    }

    /// Locates the file for `event_id` without decoding it.
    pub fn find(
        &self,
        state: &mut ThemeState,
        theme: &str,
        profile: &str,
        event_id: &str,
    ) -> Result<PathBuf> {
        let chain = self.theme_chain(state, theme);
        let mut name = event_id;
        loop {
            for theme in &chain {
                if let Some(path) = self.find_in_theme(theme, profile, name) {
                    if path.extension().is_some_and(|e| e == "disabled") {
                        debug!(target: LOG_TARGET, "Sound {} disabled by {}", event_id, path.display());
                        return Err(ErrorKind::NotFound);
                    }
                    return Ok(path);
                }
            }
            match name.rfind('-') {
                Some(pos) => name = &name[..pos],
                None => return Err(ErrorKind::NotFound),
            }
        }
    }
}

fn parse_inherits(content: &str) -> Vec<String> {
    let mut in_section = false;
    for line in content.lines().map(str::trim) {
        if line.starts_with('[') {
            in_section = line == "[Sound Theme]";
            continue;
        }
        if !in_section {
            continue;
        }
        if let Some(value) = line.strip_prefix("Inherits=") {
            return value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    Vec::new()
}

fn lookup_key<'a>(base: &'a Proplist, event: &'a Proplist, key: &str) -> Option<&'a str> {
    event.gets(key).or_else(|| base.gets(key))
}

impl SoundResolver for ThemeResolver {
    fn lookup(
        &self,
        state: &mut ThemeState,
        base: &Proplist,
        event: &Proplist,
    ) -> Result<Box<dyn SoundFile>> {
        if let Some(path) = event.gets(proplist::MEDIA_FILENAME) {
            return Ok(Box::new(decode_file(Path::new(path))?));
        }
        let event_id = event.gets(proplist::EVENT_ID).ok_or(ErrorKind::Invalid)?;
        let theme = lookup_key(base, event, proplist::THEME_NAME).unwrap_or(DEFAULT_THEME);
        let profile =
            lookup_key(base, event, proplist::THEME_OUTPUT_PROFILE).unwrap_or(DEFAULT_OUTPUT_PROFILE);

        let path = self.find(state, theme, profile, event_id)?;
        debug!(target: LOG_TARGET, "Resolved {} to {}", event_id, path.display());
        Ok(Box::new(decode_file(&path)?))
    }
}
