use std::path::Path;

use anyhow::{Context, Result};
use clawhub_rep_core::{ReputationRuleset, SharedSecretGate};
use serde::{Deserialize, Serialize};

pub const DEFAULT_ADMIN_KEY: &str = "change_me_in_production";
pub const ADMIN_KEY_ENV: &str = "CLAWREP_ADMIN_KEY";
pub const MIN_REASONING_CHARS_ENV: &str = "CLAWREP_MIN_REASONING_CHARS";

/// Runtime settings: the admin secret and the active ruleset.
///
/// Resolution order is defaults, then the optional JSON file, then
/// environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineSettings {
    pub admin_key: String,
    pub ruleset: ReputationRuleset,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            admin_key: DEFAULT_ADMIN_KEY.to_string(),
            ruleset: ReputationRuleset::v1(),
        }
    }
}

impl EngineSettings {
    /// # Errors
    /// Returns an error when the config file cannot be read or decoded, an
    /// override is malformed, or the resulting ruleset fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => {
                let body = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_json::from_str::<Self>(&body)
                    .with_context(|| format!("invalid config file {}", path.display()))?
            }
            None => Self::default(),
        };

        settings.apply_overrides(
            std::env::var(ADMIN_KEY_ENV).ok(),
            std::env::var(MIN_REASONING_CHARS_ENV).ok(),
        )?;
        settings.ruleset.validate()?;
        Ok(settings)
    }

    /// # Errors
    /// Returns an error when `min_reasoning_chars` is not an unsigned integer.
    pub fn apply_overrides(
        &mut self,
        admin_key: Option<String>,
        min_reasoning_chars: Option<String>,
    ) -> Result<()> {
        if let Some(admin_key) = admin_key.filter(|value| !value.is_empty()) {
            self.admin_key = admin_key;
        }

        if let Some(raw) = min_reasoning_chars {
            self.ruleset.min_reasoning_chars = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {MIN_REASONING_CHARS_ENV}: {raw}"))?;
        }

        Ok(())
    }

    #[must_use]
    pub fn gate(&self) -> SharedSecretGate {
        SharedSecretGate::new(self.admin_key.clone())
    }
}
