//! Bot configuration loaded from `penny.toml`.

use crate::coordinator::HandoffConfig;
use crate::pings::commands::PingLimits;
use color_eyre::eyre::{Result, bail, eyre};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `bot_token`.
pub const BOT_TOKEN_ENV: &str = "PENNY_BOT_TOKEN";

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PennyConfig {
    /// The bot's own application/user id.
    pub app_id: u64,

    /// Channel where instances exchange handoff signals.
    pub coordination_channel_id: u64,

    /// Bot token. `PENNY_BOT_TOKEN` takes precedence.
    #[serde(default)]
    pub bot_token: Option<String>,

    /// Prefix for text commands (default: "!").
    #[serde(default = "default_command_prefix")]
    pub command_prefix: String,

    /// Root of the filesystem blob store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub handoff: HandoffSection,

    #[serde(default)]
    pub pings: PingLimits,
}

/// Handoff timers.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandoffSection {
    /// How long a new instance waits for the old one to retire.
    #[serde(default = "default_peer_timeout")]
    pub peer_timeout_secs: u64,

    /// How long a retired instance waits to be terminated before resuming.
    #[serde(default = "default_disable_window")]
    pub disable_window_secs: u64,
}

impl Default for HandoffSection {
    fn default() -> Self {
        Self {
            peer_timeout_secs: default_peer_timeout(),
            disable_window_secs: default_disable_window(),
        }
    }
}

fn default_command_prefix() -> String {
    "!".into()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from(".penny/data")
}

fn default_peer_timeout() -> u64 {
    120
}

fn default_disable_window() -> u64 {
    180
}

impl PennyConfig {
    /// Load and validate config from `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                eyre!(
                    "No config found at {}\n\n\
                     Create it with at least:\n\n\
                     app_id = 1016612301262041098\n\
                     coordination_channel_id = 1067060193982156880\n\n\
                     and export {BOT_TOKEN_ENV} with the bot token.\n",
                    path.display()
                )
            } else {
                eyre!("failed to read {}: {e}", path.display())
            }
        })?;
        let config = Self::parse(&content)
            .map_err(|e| eyre!("invalid config {}: {e}", path.display()))?;
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn parse(content: &str) -> Result<Self> {
        let config: PennyConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.handoff.peer_timeout_secs == 0 {
            bail!("handoff.peer_timeout_secs must be positive");
        }
        if self.handoff.disable_window_secs == 0 {
            bail!("handoff.disable_window_secs must be positive");
        }
        if self.pings.trusted_limit < self.pings.default_limit {
            bail!(
                "pings.trusted_limit ({}) must be at least pings.default_limit ({})",
                self.pings.trusted_limit,
                self.pings.default_limit
            );
        }
        if self.command_prefix.trim().is_empty() {
            bail!("command_prefix must not be empty");
        }
        Ok(())
    }

    /// Resolve the data directory relative to `base` (the config file's directory).
    pub fn resolved_data_dir(&self, base: &Path) -> PathBuf {
        if self.data_dir.is_absolute() {
            self.data_dir.clone()
        } else {
            base.join(&self.data_dir)
        }
    }

    /// The bot token, preferring `env_token` over the file.
    pub fn bot_token(&self, env_token: Option<String>) -> Result<String> {
        env_token
            .filter(|t| !t.trim().is_empty())
            .or_else(|| self.bot_token.clone().filter(|t| !t.trim().is_empty()))
            .ok_or_else(|| eyre!("no bot token: set {BOT_TOKEN_ENV} or bot_token in the config"))
    }

    pub fn handoff_config(&self) -> HandoffConfig {
        HandoffConfig {
            bot_user_id: self.app_id,
            coordination_channel_id: self.coordination_channel_id,
            peer_timeout: Duration::from_secs(self.handoff.peer_timeout_secs),
            disable_window: Duration::from_secs(self.handoff.disable_window_secs),
        }
    }
}
