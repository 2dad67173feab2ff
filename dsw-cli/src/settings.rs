//! Application settings

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use dsw_modem::{DataClass, TenantId};
use dsw_sim::VirtualModemConfig;
use dsw_switch::ArbitratorConfig;
use serde::{Deserialize, Serialize};

use crate::scenario::ScenarioStep;

/// Everything the scenario driver needs to run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Settings {
    /// Arbitrator and tenant switch configuration
    pub arbitrator: ArbitratorConfig,
    /// Virtual modem configuration
    pub modem: VirtualModemConfig,
    /// Steps executed in order
    pub scenario: Vec<ScenarioStep>,
    /// Maximum number of events kept in the report
    pub event_log_limit: usize,
    /// Quiet period after the last step before the final status
    pub settle_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            arbitrator: ArbitratorConfig::default(),
            modem: VirtualModemConfig::default(),
            scenario: default_scenario(),
            event_log_limit: 1000,
            settle_ms: 250,
        }
    }
}

/// Slot 0 brings up the default class, slot 1 takes it over and then lets go
fn default_scenario() -> Vec<ScenarioStep> {
    vec![
        ScenarioStep::Activate {
            tenant: TenantId(0),
            class: DataClass::default_class(),
        },
        ScenarioStep::Wait { ms: 200 },
        ScenarioStep::Activate {
            tenant: TenantId(1),
            class: DataClass::default_class(),
        },
        ScenarioStep::Wait { ms: 300 },
        ScenarioStep::Status,
        ScenarioStep::Deactivate {
            tenant: TenantId(1),
            class: DataClass::default_class(),
        },
        ScenarioStep::Wait { ms: 300 },
    ]
}

impl Settings {
    /// Get the XDG config directory for dataswitch
    /// Uses $XDG_CONFIG_HOME/dataswitch on Linux/macOS, falls back to ~/.config/dataswitch
    fn config_dir() -> Option<PathBuf> {
        config_dir_in(std::env::var("XDG_CONFIG_HOME").ok(), dirs::home_dir())
    }

    /// Get the default settings file path
    pub fn settings_path() -> Option<PathBuf> {
        Self::config_dir().map(|p| p.join("settings.json"))
    }

    /// Load settings
    ///
    /// An explicit path must exist. Without one the default location is
    /// used, and a missing file there yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => match Self::settings_path() {
                Some(path) if path.exists() => Self::read(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn read(path: &Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse settings in {}", path.display()))
    }

    /// Save settings, returning the path written
    pub fn save(&self, path: Option<&Path>) -> anyhow::Result<PathBuf> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::settings_path().context("Could not determine settings path")?,
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create settings directory {}", parent.display())
            })?;
        }

        let json = serde_json::to_string_pretty(self).context("Failed to serialize settings")?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write settings to {}", path.display()))?;

        Ok(path)
    }

    /// Check the settings describe a runnable setup
    pub fn validate(&self) -> anyhow::Result<()> {
        self.arbitrator
            .validate()
            .context("Invalid arbitrator settings")?;
        self.modem.validate().context("Invalid modem settings")?;

        let slots = self.modem.slots.len();
        if self.arbitrator.tenant_count as usize > slots {
            bail!(
                "tenant_count {} exceeds the {} configured modem slots",
                self.arbitrator.tenant_count,
                slots
            );
        }
        Ok(())
    }
}

fn config_dir_in(xdg_config: Option<String>, home: Option<PathBuf>) -> Option<PathBuf> {
    if let Some(xdg_config) = xdg_config {
        let path = PathBuf::from(xdg_config);
        if path.is_absolute() {
            return Some(path.join("dataswitch"));
        }
    }

    home.map(|h| h.join(".config").join("dataswitch"))
}
