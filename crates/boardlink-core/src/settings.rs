//! Persisted tunables – reads/writes a TOML settings file.
//!
//! A missing or unreadable file never fails startup; it simply yields
//! [`Settings::default`].  Saving creates the parent directory as needed.

use std::fs;
use std::path::{Path, PathBuf};

use boardlink_types::{BoardError, Settings};
use tracing::warn;

/// Owns the current [`Settings`] and their on-disk location.
#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: Settings,
}

impl SettingsStore {
    /// Load settings from `path`, falling back to defaults when the file is
    /// missing or malformed.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = match fs::read_to_string(&path) {
            Ok(raw) => match toml::from_str(&raw) {
                Ok(settings) => settings,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "unparseable settings file, using defaults");
                    Settings::default()
                }
            },
            Err(_) => Settings::default(),
        };
        Self { path, current }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> &Settings {
        &self.current
    }

    /// Replace the settings wholesale and persist them.
    pub fn replace(&mut self, settings: Settings) -> Result<(), BoardError> {
        self.current = settings;
        self.save()
    }

    fn save(&self) -> Result<(), BoardError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                BoardError::Settings(format!("create {}: {e}", parent.display()))
            })?;
        }
        let raw = toml::to_string_pretty(&self.current)
            .map_err(|e| BoardError::Settings(format!("serialize: {e}")))?;
        fs::write(&self.path, raw)
            .map_err(|e| BoardError::Settings(format!("write {}: {e}", self.path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let store = SettingsStore::load(dir.path().join("settings.toml"));
        assert_eq!(*store.current(), Settings::default());
    }

    #[test]
    fn malformed_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("settings.toml");
        fs::write(&path, "not toml [[[").expect("write");
        let store = SettingsStore::load(&path);
        assert_eq!(*store.current(), Settings::default());
    }

    #[test]
    fn replace_persists_and_reloads() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("nested").join("settings.toml");

        let mut store = SettingsStore::load(&path);
        let custom = Settings {
            accel_erpm_per_s: 2500.0,
            decel_erpm_per_s: 7500.0,
            max_erpm: 9000.0,
            deadband_erpm: 150.0,
        };
        store.replace(custom.clone()).expect("save");

        let reloaded = SettingsStore::load(&path);
        assert_eq!(*reloaded.current(), custom);
    }

    #[test]
    fn partial_file_fills_remaining_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("settings.toml");
        fs::write(&path, "max_erpm = 8000.0\n").expect("write");
        let store = SettingsStore::load(&path);
        assert_eq!(store.current().max_erpm, 8000.0);
        assert_eq!(
            store.current().accel_erpm_per_s,
            Settings::default().accel_erpm_per_s
        );
    }
}
