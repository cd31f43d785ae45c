//! Reconciliation settings and configuration

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Default interval between community rekeys (48 hours)
pub const DEFAULT_REKEY_INTERVAL_MS: u64 = 48 * 60 * 60 * 1000;

/// Settings
///
/// Persistent configuration for a Peerstate identity.
/// Settings are stored in JSON format and can be loaded/saved from disk.
///
/// # Example
/// ```rust,no_run
/// use peerstate::storage::Settings;
///
/// // Load settings (returns default if file doesn't exist)
/// let mut settings = Settings::load("settings.json").expect("Failed to load");
///
/// // Rekey communities every 24 hours and auto-save
/// settings.update_rekey_interval_hours(24, "settings.json").expect("Failed to update");
///
/// println!("Rekey interval: {} ms", settings.rekey_interval_ms);
/// println!("Storage path: {}", settings.storage_path);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Name announced to peers with contact requests
    pub display_name: String,
    /// Storage path for the SQLite database
    pub storage_path: String,
    /// Age after which a community group key is rotated (ms)
    pub rekey_interval_ms: u64,
    /// Base delay of the ENS re-verification backoff (ms)
    pub ens_verification_backoff_ms: u64,
    /// Failed ENS verifications after which no further attempt is made
    pub ens_max_verification_retries: u32,
    /// Envelopes requested per store-and-forward page
    pub history_page_size: usize,
    /// Produce activity center notifications
    pub enable_notifications: bool,
}

impl Settings {
    /// Load settings from a JSON file
    ///
    /// # Arguments
    /// * `path` - Path to the settings file
    ///
    /// # Returns
    /// The loaded settings, or default settings if file doesn't exist
    pub fn load<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Storage(format!("Failed to read settings: {}", e)))?;

        // Handle empty file (return defaults)
        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&data)
            .map_err(|e| Error::Storage(format!("Failed to parse settings: {}", e)))
    }

    /// Save settings to a JSON file
    ///
    /// # Arguments
    /// * `path` - Path to save the settings file
    pub fn save<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| {
                    Error::Storage(format!("Failed to create settings directory: {}", e))
                })?;
        }

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| Error::Storage(format!("Failed to serialize settings: {}", e)))?;

        std::fs::write(path, json)
            .map_err(|e| Error::Storage(format!("Failed to write settings: {}", e)))?;

        Ok(())
    }

    /// Update the rekey interval in hours and auto-save
    pub fn update_rekey_interval_hours<P: AsRef<std::path::Path>>(
        &mut self,
        hours: u32,
        save_path: P,
    ) -> Result<()> {
        self.rekey_interval_ms = (hours as u64) * 60 * 60 * 1000;
        self.save(save_path)
    }

    /// Database file inside `storage_path`
    pub fn database_path(&self) -> std::path::PathBuf {
        std::path::Path::new(&self.storage_path).join("peerstate.db")
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            display_name: String::new(),
            storage_path: "./data".to_string(),
            rekey_interval_ms: DEFAULT_REKEY_INTERVAL_MS,
            ens_verification_backoff_ms: 30 * 60 * 1000,
            ens_max_verification_retries: 12,
            history_page_size: 100,
            enable_notifications: true,
        }
    }
}
