use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct MeshConfig {
    pub seen_retention_secs: u64,
    pub seen_capacity: usize,
    pub outbox_max_per_recipient: usize,
    pub outbox_max_age_secs: u64,
    pub outbox_sweep_interval_secs: u64,
    pub radio_retry_attempts: u32,
    pub radio_retry_initial_delay_ms: u64,
    pub radio_retry_max_delay_ms: u64,
    pub scan_restart_interval_secs: u64,
    pub connection_timeout_secs: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            seen_retention_secs: 300,
            seen_capacity: 10_000,
            outbox_max_per_recipient: 100,
            outbox_max_age_secs: 86_400,
            outbox_sweep_interval_secs: 60,
            radio_retry_attempts: 5,
            radio_retry_initial_delay_ms: 100,
            radio_retry_max_delay_ms: 5_000,
            scan_restart_interval_secs: 30,
            connection_timeout_secs: 10,
        }
    }
}

impl MeshConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup, falling back to defaults
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let config = MeshConfig {
            seen_retention_secs: var("MESH_SEEN_RETENTION_SECS", "300").parse()?,
            seen_capacity: var("MESH_SEEN_CAPACITY", "10000").parse()?,
            outbox_max_per_recipient: var("MESH_OUTBOX_MAX_PER_RECIPIENT", "100").parse()?,
            outbox_max_age_secs: var("MESH_OUTBOX_MAX_AGE_SECS", "86400").parse()?,
            outbox_sweep_interval_secs: var("MESH_OUTBOX_SWEEP_INTERVAL_SECS", "60").parse()?,
            radio_retry_attempts: var("MESH_RADIO_RETRY_ATTEMPTS", "5").parse()?,
            radio_retry_initial_delay_ms: var("MESH_RADIO_RETRY_INITIAL_DELAY_MS", "100").parse()?,
            radio_retry_max_delay_ms: var("MESH_RADIO_RETRY_MAX_DELAY_MS", "5000").parse()?,
            scan_restart_interval_secs: var("MESH_SCAN_RESTART_INTERVAL_SECS", "30").parse()?,
            connection_timeout_secs: var("MESH_CONNECTION_TIMEOUT_SECS", "10").parse()?,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.seen_retention_secs == 0 {
            anyhow::bail!("MESH_SEEN_RETENTION_SECS must be greater than zero");
        }
        if self.seen_capacity == 0 {
            anyhow::bail!("MESH_SEEN_CAPACITY must be greater than zero");
        }
        if self.outbox_max_per_recipient == 0 {
            anyhow::bail!("MESH_OUTBOX_MAX_PER_RECIPIENT must be greater than zero");
        }
        if self.outbox_sweep_interval_secs == 0 {
            anyhow::bail!("MESH_OUTBOX_SWEEP_INTERVAL_SECS must be greater than zero");
        }
        if self.scan_restart_interval_secs == 0 {
            anyhow::bail!("MESH_SCAN_RESTART_INTERVAL_SECS must be greater than zero");
        }
        if self.connection_timeout_secs == 0 {
            anyhow::bail!("MESH_CONNECTION_TIMEOUT_SECS must be greater than zero");
        }
        Ok(())
    }

    pub fn seen_retention(&self) -> Duration {
        Duration::from_secs(self.seen_retention_secs)
    }

    pub fn outbox_max_age(&self) -> Duration {
        Duration::from_secs(self.outbox_max_age_secs)
    }

    pub fn outbox_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.outbox_sweep_interval_secs)
    }

    pub fn scan_restart_interval(&self) -> Duration {
        Duration::from_secs(self.scan_restart_interval_secs)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_secs)
    }
}
