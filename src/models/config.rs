// Netpilot - Manager Configuration
// Copyright (C) 2026 Christos A. Daggas
// SPDX-License-Identifier: MIT

//! Manager configuration model.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use super::technology::Technology;
use super::CONFIG_DIR_NAME;

/// Auto-connect policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoConnectConfig {
    /// Enable auto-connect globally.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Smallest cooldown applied after an auto-connect attempt, in milliseconds.
    #[serde(default = "default_min_cooldown_ms")]
    pub min_cooldown_ms: u64,

    /// Cooldown cap for technologies without their own cap, in milliseconds.
    #[serde(default = "default_max_cooldown_ms")]
    pub default_max_cooldown_ms: u64,

    /// Per-technology cooldown caps, in milliseconds.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub max_cooldown_ms: BTreeMap<String, u64>,

    /// Technologies whose services are never auto-connected.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disabled_technologies: Vec<Technology>,
}

impl Default for AutoConnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_cooldown_ms: default_min_cooldown_ms(),
            default_max_cooldown_ms: default_max_cooldown_ms(),
            max_cooldown_ms: BTreeMap::new(),
            disabled_technologies: Vec::new(),
        }
    }
}

impl AutoConnectConfig {
    pub fn min_cooldown(&self) -> Duration {
        Duration::from_millis(self.min_cooldown_ms)
    }

    /// Cooldown cap for a technology: configured value, then the built-in
    /// per-technology cap, then the default cap.
    pub fn max_cooldown(&self, technology: Technology) -> Duration {
        if let Some(ms) = self.max_cooldown_ms.get(technology.as_str()) {
            return Duration::from_millis(*ms);
        }
        technology
            .builtin_max_cooldown()
            .unwrap_or_else(|| Duration::from_millis(self.default_max_cooldown_ms))
    }
}

/// Manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Directory holding machine-wide profiles.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_dir: Option<PathBuf>,

    /// Directory holding per-user profiles (`<dir>/<user>/<name>.profile`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_storage_dir: Option<PathBuf>,

    /// Keep all profile storage in memory.
    #[serde(default)]
    pub in_memory_storage: bool,

    /// Technology preference order, comma separated.
    #[serde(default = "default_technology_order")]
    pub technology_order: String,

    /// Rank by connectivity state before anything else when sorting.
    #[serde(default = "default_true")]
    pub connectivity_aware_sorting: bool,

    /// Deadline for suspend / shutdown actions, in milliseconds.
    #[serde(default = "default_termination_timeout_ms")]
    pub termination_timeout_ms: u64,

    /// Start with every connection suppressed.
    #[serde(default)]
    pub offline_mode: bool,

    /// Kernel links no driver may claim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub device_blacklist: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Auto-connect policy.
    #[serde(default)]
    pub auto_connect: AutoConnectConfig,
}

fn default_true() -> bool {
    true
}

fn default_min_cooldown_ms() -> u64 {
    1000
}

fn default_max_cooldown_ms() -> u64 {
    60_000
}

fn default_technology_order() -> String {
    "vpn,ethernet,wifi,wimax,cellular".to_string()
}

fn default_termination_timeout_ms() -> u64 {
    9500
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            user_storage_dir: None,
            in_memory_storage: false,
            technology_order: default_technology_order(),
            connectivity_aware_sorting: true,
            termination_timeout_ms: default_termination_timeout_ms(),
            offline_mode: false,
            device_blacklist: Vec::new(),
            log_level: default_log_level(),
            auto_connect: AutoConnectConfig::default(),
        }
    }
}

impl ManagerConfig {
    /// Configuration that never touches the filesystem.
    pub fn in_memory() -> Self {
        Self {
            in_memory_storage: true,
            ..Self::default()
        }
    }

    /// Machine-wide storage directory, falling back to the XDG data dir.
    pub fn resolved_storage_dir(&self) -> PathBuf {
        self.storage_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(CONFIG_DIR_NAME)
        })
    }

    /// Per-user storage root.
    pub fn resolved_user_storage_dir(&self) -> PathBuf {
        self.user_storage_dir
            .clone()
            .unwrap_or_else(|| self.resolved_storage_dir().join("users"))
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_millis(self.termination_timeout_ms)
    }

    /// Default config file location.
    pub fn default_path() -> Option<PathBuf> {
        Some(dirs::config_dir()?.join(CONFIG_DIR_NAME).join("netpilot.toml"))
    }

    /// Load configuration from TOML file.
    pub fn load_from_file(path: &std::path::Path) -> Result<Self, super::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| super::Error::ConfigReadFailed(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to TOML file with restrictive permissions (0600).
    pub fn save_to_file(&self, path: &std::path::Path) -> Result<(), super::Error> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config: ManagerConfig = toml::from_str("").unwrap();
        assert_eq!(config.technology_order, "vpn,ethernet,wifi,wimax,cellular");
        assert_eq!(config.auto_connect.min_cooldown(), Duration::from_secs(1));
        assert_eq!(config.termination_timeout(), Duration::from_millis(9500));
        assert!(config.auto_connect.enabled);
    }

    #[test]
    fn test_max_cooldown_precedence() {
        let mut auto_connect = AutoConnectConfig::default();
        assert_eq!(
            auto_connect.max_cooldown(Technology::Wifi),
            Duration::from_secs(60)
        );
        assert_eq!(
            auto_connect.max_cooldown(Technology::Cellular),
            Duration::from_secs(30 * 60)
        );

        auto_connect
            .max_cooldown_ms
            .insert("cellular".to_string(), 5000);
        assert_eq!(
            auto_connect.max_cooldown(Technology::Cellular),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = std::env::temp_dir().join(format!("netpilot-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("netpilot.toml");

        let mut config = ManagerConfig::default();
        config.offline_mode = true;
        config.device_blacklist = vec!["veth0".to_string()];
        config.technology_order = "ethernet,wifi".to_string();
        config.save_to_file(&path).unwrap();

        let loaded = ManagerConfig::load_from_file(&path).unwrap();
        assert!(loaded.offline_mode);
        assert_eq!(loaded.device_blacklist, vec!["veth0".to_string()]);
        assert_eq!(loaded.technology_order, "ethernet,wifi");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let path = std::env::temp_dir().join(format!("netpilot-missing-{}.toml", uuid::Uuid::new_v4()));
        assert!(matches!(
            ManagerConfig::load_from_file(&path),
            Err(crate::models::Error::ConfigReadFailed(_))
        ));
    }

    #[test]
    fn test_parse_auto_connect_section() {
        let config: ManagerConfig = toml::from_str(
            r#"
            technology_order = "ethernet,wifi"

            [auto_connect]
            disabled_technologies = ["cellular"]

            [auto_connect.max_cooldown_ms]
            wifi = 120000
            "#,
        )
        .unwrap();
        assert_eq!(config.auto_connect.disabled_technologies, vec![Technology::Cellular]);
        assert_eq!(
            config.auto_connect.max_cooldown(Technology::Wifi),
            Duration::from_secs(120)
        );
    }
}
