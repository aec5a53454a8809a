//! Persistent profile configuration.
//!
//! Handles saving/loading the active OSC/audio profile to disk.
//!
//! # Storage locations
//! - Linux: `~/.config/cvosc/profile.json`
//! - Windows: `%APPDATA%\cvosc\profile.json`
//! - macOS: `~/Library/Application Support/cvosc/profile.json`

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

/// A channel's voltage range within a profile, e.g. `[-10, 10]` for
/// bipolar CV or `[0, 10]` for unipolar.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CvRange {
    pub min: f32,
    pub max: f32,
}

impl Default for CvRange {
    fn default() -> Self {
        Self { min: 0.0, max: 10.0 }
    }
}

/// One named OSC/audio configuration (§6 "Profile configuration (JSON)").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub osc_host: String,
    pub osc_port: u16,
    #[serde(default)]
    pub audio_device: Option<String>,
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    #[serde(default)]
    pub cv_ranges: Vec<CvRange>,
}

fn default_update_interval_ms() -> u64 {
    10
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            osc_host: "127.0.0.1".to_string(),
            osc_port: 9000,
            audio_device: None,
            update_interval_ms: default_update_interval_ms(),
            cv_ranges: vec![CvRange::default(); 8],
        }
    }
}

/// Root profile file: a named set of profiles plus which one is active.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileStore {
    pub active_profile: String,
    pub profiles: HashMap<String, Profile>,
}

impl Default for ProfileStore {
    fn default() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("default".to_string(), Profile::default());
        Self { active_profile: "default".to_string(), profiles }
    }
}

impl ProfileStore {
    /// Load the profile store from disk, or write and return the default
    /// if the file is missing. A corrupt file falls back to the default
    /// without touching the file on disk.
    pub fn load() -> Self {
        let Some(path) = Self::config_path() else {
            return Self::default();
        };

        if !path.exists() {
            let store = Self::default();
            if let Err(e) = store.save() {
                error!("failed to write default profile: {e}");
            }
            return store;
        }

        match fs::File::open(&path) {
            Ok(file) => match serde_json::from_reader(file) {
                Ok(store) => {
                    info!("profile loaded from {:?}", path);
                    store
                }
                Err(e) => {
                    error!("failed to parse profile file: {e}");
                    Self::default()
                }
            },
            Err(e) => {
                error!("failed to open profile file: {e}");
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<(), String> {
        let path = Self::config_path().ok_or("could not determine config path")?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| e.to_string())?;
        }
        let file = fs::File::create(&path).map_err(|e| e.to_string())?;
        serde_json::to_writer_pretty(file, self).map_err(|e| e.to_string())?;
        info!("profile saved to {:?}", path);
        Ok(())
    }

    pub fn active(&self) -> Profile {
        self.profiles.get(&self.active_profile).cloned().unwrap_or_default()
    }

    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "cvosc", "cvosc").map(|proj| proj.config_dir().join("profile.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_has_eight_ranges() {
        let profile = Profile::default();
        assert_eq!(profile.cv_ranges.len(), 8);
        assert_eq!(profile.update_interval_ms, 10);
    }

    #[test]
    fn default_store_has_one_active_profile() {
        let store = ProfileStore::default();
        assert_eq!(store.active_profile, "default");
        assert!(store.profiles.contains_key("default"));
    }

    #[test]
    fn active_falls_back_to_default_profile_when_missing() {
        let store = ProfileStore { active_profile: "missing".to_string(), profiles: HashMap::new() };
        let active = store.active();
        assert_eq!(active.osc_port, 9000);
    }

    #[test]
    fn profile_serialization_roundtrip() {
        let mut store = ProfileStore::default();
        store.profiles.get_mut("default").unwrap().osc_host = "10.0.0.5".to_string();
        store.profiles.get_mut("default").unwrap().cv_ranges[0] = CvRange { min: -10.0, max: 10.0 };

        let json = serde_json::to_string_pretty(&store).unwrap();
        let deserialized: ProfileStore = serde_json::from_str(&json).unwrap();

        assert_eq!(deserialized.active().osc_host, "10.0.0.5");
        assert_eq!(deserialized.active().cv_ranges[0].min, -10.0);
    }

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let old_json = r#"{"osc_host": "127.0.0.1", "osc_port": 8000}"#;
        let profile: Profile = serde_json::from_str(old_json).unwrap();
        assert_eq!(profile.update_interval_ms, 10);
        assert!(profile.cv_ranges.is_empty());
        assert!(profile.audio_device.is_none());
    }
}
