//! Runtime configuration, loaded from TOML. Missing keys take their defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ballot::BallotConfig;
use crate::error::{AssemblyError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// Fewest present members that may start a harvest.
    pub min_participants: usize,
    /// Accept proposed harvests on the local member's behalf.
    pub auto_accept: bool,
    /// Back-off between failed reconnection attempts.
    pub reconnect_delay_ms: u64,
    /// Upper bound on the handshake round-trip.
    pub handshake_timeout_ms: u64,
    /// Capacity of the in-memory audit ring.
    pub audit_capacity: usize,
    pub ballot: BallotConfig,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        AssemblyConfig {
            min_participants: 2,
            auto_accept: false,
            reconnect_delay_ms: 5_000,
            handshake_timeout_ms: 10_000,
            audit_capacity: 500,
            ballot: BallotConfig::default(),
        }
    }
}

impl AssemblyConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: AssemblyConfig =
            toml::from_str(raw).map_err(|e| AssemblyError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| AssemblyError::Config(format!("Cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_participants == 0 {
            return Err(AssemblyError::Config("min_participants must be at least 1".into()));
        }
        if self.ballot.min_random_padding == 0 {
            return Err(AssemblyError::Config("ballot.min_random_padding must be at least 1".into()));
        }
        Ok(())
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
