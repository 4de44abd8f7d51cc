//! Session snapshot for audit and replay.
//!
//! The whole installation session is written as pretty-printed JSON: the
//! pre-launch choices, the partitioning plan, and an opaque `system` object
//! owned by the configuration stages that run after partitioning. The LUKS
//! passphrase is never part of the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::engine::manual::validate_manual;
use crate::engine::plan::PartitioningPlan;
use crate::hardware::FirmwareMode;
use crate::types::PlanningMode;

/// Choices made before partitioning starts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreLaunch {
    pub firmware: FirmwareMode,
    #[serde(default)]
    pub mode: PlanningMode,
    #[serde(default = "default_keymap")]
    pub keymap: String,
    #[serde(default = "default_language")]
    pub language: String,
}

fn default_keymap() -> String {
    "us".to_string()
}

fn default_language() -> String {
    "en_US.UTF-8".to_string()
}

impl PreLaunch {
    pub fn new(firmware: FirmwareMode, mode: PlanningMode) -> Self {
        Self {
            firmware,
            mode,
            keymap: default_keymap(),
            language: default_language(),
        }
    }
}

/// Everything needed to audit or replay an installation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSession {
    pub prelaunch: PreLaunch,
    pub partitioning: PartitioningPlan,
    /// Post-partitioning choices, passed through untouched
    #[serde(default)]
    pub system: serde_json::Map<String, serde_json::Value>,
}

impl InstallSession {
    pub fn new(prelaunch: PreLaunch, partitioning: PartitioningPlan) -> Self {
        Self {
            prelaunch,
            partitioning,
            system: serde_json::Map::new(),
        }
    }

    /// Save the session to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).context("Failed to serialize session to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write session to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load a session from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read session from {:?}", path.as_ref()))?;

        let session: Self =
            serde_json::from_str(&content).context("Failed to parse session JSON")?;

        Ok(session)
    }

    /// Validate the session
    pub fn validate(&self) -> Result<()> {
        let keymap = self.prelaunch.keymap.trim();
        if keymap.is_empty() || keymap.contains(char::is_whitespace) {
            anyhow::bail!("Keymap must be a single non-empty name");
        }
        if self.prelaunch.language.trim().is_empty() {
            anyhow::bail!("Language must be specified");
        }

        validate_manual(&self.partitioning, self.prelaunch.firmware)
            .context("Partitioning plan is invalid")?;

        if self.partitioning.main_disk().is_none() {
            anyhow::bail!("Partitioning plan has no main disk");
        }
        if let Some(record) = self.partitioning.partitions().iter().find(|p| p.path().is_none()) {
            anyhow::bail!("Partition #{} has no device path", record.index());
        }

        Ok(())
    }
}
