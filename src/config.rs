use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::messages::ReliabilityParams;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub listen_address: String,
    /// Maximum number of peer connection entries, including reserved handshake slots.
    pub table_capacity: usize,
    /// Established entries idle longer than this can be evicted.
    pub idle_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub mrp_idle_retrans_ms: u32,
    pub mrp_active_retrans_ms: u32,
    pub pbkdf_iterations: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:5540".to_owned(),
            table_capacity: 16,
            idle_timeout_ms: 5 * 60 * 1000,
            handshake_timeout_ms: 60_000,
            mrp_idle_retrans_ms: 500,
            mrp_active_retrans_ms: 300,
            pbkdf_iterations: 1000,
        }
    }
}

impl SessionConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn reliability(&self) -> ReliabilityParams {
        ReliabilityParams {
            idle_retrans_ms: self.mrp_idle_retrans_ms,
            active_retrans_ms: self.mrp_active_retrans_ms,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.table_capacity == 0 {
            anyhow::bail!("table_capacity must be at least 1");
        }
        if !(crate::spake2p::MIN_ITERATIONS..=crate::spake2p::MAX_ITERATIONS)
            .contains(&self.pbkdf_iterations)
        {
            anyhow::bail!("pbkdf_iterations {} out of range", self.pbkdf_iterations);
        }
        self.listen_address
            .parse::<std::net::SocketAddr>()
            .context(format!("listen_address {}", self.listen_address))?;
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<SessionConfig> {
    let data = std::fs::read_to_string(path).context(format!("reading config from {}", path))?;
    let config: SessionConfig =
        serde_json::from_str(&data).context(format!("parsing {}", path))?;
    config.validate()?;
    Ok(config)
}

pub fn save_config(path: &str, config: &SessionConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config)?;
    std::fs::write(path, data).context(format!("writing config to {}", path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_take_defaults() -> Result<()> {
        let config: SessionConfig = serde_json::from_str(r#"{"table_capacity": 2}"#)?;
        assert_eq!(config.table_capacity, 2);
        assert_eq!(config.listen_address, "0.0.0.0:5540");
        assert_eq!(config.reliability().active_retrans_ms, 300);
        config.validate()?;
        Ok(())
    }

    #[test]
    fn save_then_load() -> Result<()> {
        let dir = std::env::temp_dir().join("matsess_test_config");
        std::fs::create_dir_all(&dir)?;
        let path = dir.join("config.json");
        let path = path.to_str().context("temp path")?;

        let config = SessionConfig {
            idle_timeout_ms: 1234,
            ..Default::default()
        };
        save_config(path, &config)?;
        assert_eq!(load_config(path)?.idle_timeout(), Duration::from_millis(1234));
        Ok(())
    }

    #[test]
    fn invalid_values_rejected() {
        let config = SessionConfig {
            pbkdf_iterations: 10,
            ..Default::default()
        };
        assert!(config.validate().is_err());
        let config = SessionConfig {
            table_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
