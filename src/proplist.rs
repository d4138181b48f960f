//! Ordered property sets exchanged with callers and with the sound server.

use crate::error::{ErrorKind, Result};
use std::fmt;

/// Event identifier; doubles as the cached sample name.
pub const EVENT_ID: &str = "event.id";
pub const EVENT_DESCRIPTION: &str = "event.description";
pub const MEDIA_NAME: &str = "media.name";
/// Absolute path of a sound file, bypassing theme lookup.
pub const MEDIA_FILENAME: &str = "media.filename";
pub const APPLICATION_NAME: &str = "application.name";
pub const APPLICATION_ID: &str = "application.id";
pub const APPLICATION_PROCESS_ID: &str = "application.process.id";
pub const APPLICATION_PROCESS_HOST: &str = "application.process.host";
pub const APPLICATION_PROCESS_BINARY: &str = "application.process.binary";

/// Keys under this prefix are consumed locally and never sent to the server.
pub const INTERNAL_PREFIX: &str = "chime.";
/// Playback volume in decibels, as a decimal string.
pub const VOLUME: &str = "chime.volume";
/// One of `never`, `permanent`, `volatile`.
pub const CACHE_CONTROL: &str = "chime.cache-control";
pub const THEME_NAME: &str = "chime.theme.name";
pub const THEME_OUTPUT_PROFILE: &str = "chime.theme.output-profile";

/// Key/value pairs kept in insertion order. Values are opaque bytes.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Proplist {
    items: Vec<(String, Vec<u8>)>,
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key.bytes().all(|b| b.is_ascii_graphic() && b != b'=');
    if valid {
        Ok(())
    } else {
        Err(ErrorKind::Invalid)
    }
}

impl Proplist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets `key` to raw bytes, replacing an existing value in place.
    pub fn set(&mut self, key: &str, value: impl Into<Vec<u8>>) -> Result<()> {
        validate_key(key)?;
        let value = value.into();
        match self.items.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value,
            None => self.items.push((key.to_string(), value)),
        }
        Ok(())
    }

    /// Sets `key` to a UTF-8 string value.
    pub fn sets(&mut self, key: &str, value: &str) -> Result<()> {
        self.set(key, value.as_bytes().to_vec())
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_slice())
    }

    /// Returns the value as a string if it is valid UTF-8 without NUL bytes.
    pub fn gets(&self, key: &str) -> Option<&str> {
        let raw = self.get(key)?;
        let s = std::str::from_utf8(raw).ok()?;
        if s.contains('\0') {
            None
        } else {
            Some(s)
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.iter().any(|(k, _)| k == key)
    }

    pub fn unset(&mut self, key: &str) -> Option<Vec<u8>> {
        let pos = self.items.iter().position(|(k, _)| k == key)?;
        Some(self.items.remove(pos).1)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.items.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Overlays `other` on top of `self`; keys present in both take `other`'s value.
    pub fn merge(&mut self, other: &Proplist) {
        for (key, value) in &other.items {
            match self.items.iter_mut().find(|(k, _)| k == key) {
                Some((_, v)) => v.clone_from(value),
                None => self.items.push((key.clone(), value.clone())),
            }
        }
    }

    /// Returns a copy without any key under [`INTERNAL_PREFIX`].
    pub fn strip_internal(&self) -> Proplist {
        Proplist {
            items: self
                .items
                .iter()
                .filter(|(k, _)| !k.starts_with(INTERNAL_PREFIX))
                .cloned()
                .collect(),
        }
    }
}

impl fmt::Debug for Proplist {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.items {
            match std::str::from_utf8(value) {
                Ok(s) => map.entry(key, &s),
                Err(_) => map.entry(key, &format_args!("<{} bytes>", value.len())),
            };
        }
        map.finish()
    }
}

impl<K: AsRef<str>, V: AsRef<str>> FromIterator<(K, V)> for Proplist {
    /// Builds a string-valued list; pairs with invalid keys are skipped.
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut list = Proplist::new();
        for (k, v) in iter {
            let _ = list.sets(k.as_ref(), v.as_ref());
        }
        list
    }
}
