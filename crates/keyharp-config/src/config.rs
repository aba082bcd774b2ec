// System configuration (keyharp.json).

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::keybinding::{self, KeybindEntry, KeybindingTable};

/// System-wide configuration.
///
/// Durations are stored as integer milliseconds so the JSON stays plain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct Config {
    /// Modifier keys are released after this long with no keys held.
    pub idle_timeout_ms: u64,
    /// Queued realtime note-ons older than this are dropped, not played.
    pub max_note_latency_ms: u64,
    /// Same, for file-playback note-ons.
    pub playback_max_note_latency_ms: u64,
    /// Minimum spacing the destination enforces between triggered actions.
    pub skill_cooldown_ms: u64,
    /// Minimum spacing after a ctrl/alt/shift change.
    pub modifier_cooldown_ms: u64,
    /// Whether playback events wait out the modifier cooldown too.
    pub playback_modifier_wait: bool,
    /// Note-ons quieter than this count as accidental touches.
    pub min_trigger_velocity: u8,
    pub ntp_server: String,
    pub ntp_sync_timeout_ms: u64,
    pub ntp_cooldown_ms: u64,
    pub control_listen_addr: String,
    pub keybindings: Vec<KeybindEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            idle_timeout_ms: 1000,
            max_note_latency_ms: 300,
            playback_max_note_latency_ms: 300,
            skill_cooldown_ms: 140,
            modifier_cooldown_ms: 50,
            playback_modifier_wait: true,
            min_trigger_velocity: 16,
            ntp_server: "pool.ntp.org".to_string(),
            ntp_sync_timeout_ms: 5000,
            ntp_cooldown_ms: 10000,
            control_listen_addr: "127.0.0.1:65300".to_string(),
            keybindings: keybinding::default_entries(),
        }
    }
}

impl Config {
    /// Fill in fields an edited file may have blanked out.
    pub fn validate(&mut self) {
        let defaults = Config::default();
        if self.ntp_server.is_empty() {
            self.ntp_server = defaults.ntp_server;
        }
        if self.control_listen_addr.is_empty() {
            self.control_listen_addr = defaults.control_listen_addr;
        }
        if self.keybindings.is_empty() {
            self.keybindings = defaults.keybindings;
        }
    }

    /// Read config from a JSON file.
    pub fn read(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        let mut config: Config = serde_json::from_str(&data)?;
        config.validate();
        Ok(config)
    }

    /// Write config to a JSON file.
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Resolve the keybinding entries into the note-indexed table.
    pub fn keybinding_table(&self) -> Result<KeybindingTable> {
        KeybindingTable::from_entries(&self.keybindings)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn max_note_latency(&self) -> Duration {
        Duration::from_millis(self.max_note_latency_ms)
    }

    pub fn playback_max_note_latency(&self) -> Duration {
        Duration::from_millis(self.playback_max_note_latency_ms)
    }

    pub fn skill_cooldown(&self) -> Duration {
        Duration::from_millis(self.skill_cooldown_ms)
    }

    pub fn modifier_cooldown(&self) -> Duration {
        Duration::from_millis(self.modifier_cooldown_ms)
    }

    pub fn ntp_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.ntp_sync_timeout_ms)
    }

    pub fn ntp_cooldown(&self) -> Duration {
        Duration::from_millis(self.ntp_cooldown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let c = Config::default();
        assert_eq!(c.idle_timeout_ms, 1000);
        assert_eq!(c.max_note_latency_ms, 300);
        assert_eq!(c.skill_cooldown_ms, 140);
        assert_eq!(c.modifier_cooldown_ms, 50);
        assert!(c.playback_modifier_wait);
        assert_eq!(c.min_trigger_velocity, 16);
        assert_eq!(c.ntp_cooldown_ms, 10000);
        assert_eq!(c.control_listen_addr, "127.0.0.1:65300");
        assert_eq!(c.keybindings.len(), 37);
        assert_eq!(c.keybinding_table().unwrap().mapped_count(), 37);
    }

    #[test]
    fn test_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyharp.json");

        let mut config = Config::default();
        config.skill_cooldown_ms = 125;
        config.ntp_server = "time.example.org".to_string();
        config.write(&path).unwrap();

        let loaded = Config::read(&path).unwrap();
        assert_eq!(loaded.skill_cooldown_ms, 125);
        assert_eq!(loaded.ntp_server, "time.example.org");
        assert_eq!(loaded.keybindings.len(), 37);
    }

    #[test]
    fn test_partial_file_gets_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keyharp.json");
        std::fs::write(&path, r#"{"skillCooldownMs": 200}"#).unwrap();

        let loaded = Config::read(&path).unwrap();
        assert_eq!(loaded.skill_cooldown_ms, 200);
        assert_eq!(loaded.modifier_cooldown_ms, 50);
        assert!(!loaded.keybindings.is_empty());
    }

    #[test]
    fn test_validate_restores_blanked_fields() {
        let mut config = Config {
            ntp_server: String::new(),
            control_listen_addr: String::new(),
            keybindings: Vec::new(),
            ..Default::default()
        };
        config.validate();
        assert_eq!(config.ntp_server, "pool.ntp.org");
        assert_eq!(config.control_listen_addr, "127.0.0.1:65300");
        assert_eq!(config.keybindings.len(), 37);
    }

    #[test]
    fn test_duration_accessors() {
        let c = Config::default();
        assert_eq!(c.skill_cooldown(), Duration::from_millis(140));
        assert_eq!(c.idle_timeout(), Duration::from_secs(1));
        assert_eq!(c.ntp_sync_timeout(), Duration::from_secs(5));
    }
}
