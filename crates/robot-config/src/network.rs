use anyhow::{ensure, Context};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub tcp: TcpConfig,
}

/// Listener address and link timing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    pub pi_port: u16,
    /// Age of the last trusted command after which low-confidence ticks soft-hold.
    #[serde(default = "default_stale")]
    pub stale_timeout_s: f64,
    /// Age after which the arm goes limp regardless of the command.
    #[serde(default = "default_hard_stop")]
    pub hard_stop_timeout_s: f64,
    /// Bounded wait of a single socket read.
    #[serde(default = "default_read_timeout")]
    pub read_timeout_s: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_stale() -> f64 {
    0.35
}

fn default_hard_stop() -> f64 {
    1.0
}

fn default_read_timeout() -> f64 {
    0.5
}

impl TcpConfig {
    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stale_timeout_s)
    }

    pub fn hard_stop_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.hard_stop_timeout_s)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.read_timeout_s)
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.pi_port)
    }
}

impl NetworkConfig {
    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        let cfg: NetworkConfig = serde_yaml::from_str(raw).context("decoding network config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let tcp = &self.tcp;
        ensure!(
            tcp.stale_timeout_s.is_finite() && tcp.stale_timeout_s > 0.0,
            "stale_timeout_s must be positive, got {}",
            tcp.stale_timeout_s
        );
        ensure!(
            tcp.hard_stop_timeout_s.is_finite() && tcp.stale_timeout_s < tcp.hard_stop_timeout_s,
            "stale_timeout_s ({}) must be below hard_stop_timeout_s ({})",
            tcp.stale_timeout_s,
            tcp.hard_stop_timeout_s
        );
        ensure!(
            tcp.read_timeout_s.is_finite() && tcp.read_timeout_s > 0.0,
            "read_timeout_s must be positive, got {}",
            tcp.read_timeout_s
        );
        Ok(())
    }
}

pub fn load_network(path: impl AsRef<Path>) -> anyhow::Result<NetworkConfig> {
    let path = path.as_ref();
    let raw = crate::read_file(path)?;
    NetworkConfig::from_yaml_str(&raw).with_context(|| format!("loading {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_in() {
        let cfg = NetworkConfig::from_yaml_str("tcp:\n  pi_port: 5055\n").unwrap();
        assert_eq!(cfg.tcp.host, "0.0.0.0");
        assert_eq!(cfg.tcp.pi_port, 5055);
        assert_eq!(cfg.tcp.stale_timeout(), Duration::from_millis(350));
        assert_eq!(cfg.tcp.hard_stop_timeout(), Duration::from_secs(1));
        assert_eq!(cfg.tcp.bind_addr(), "0.0.0.0:5055");
    }

    #[test]
    fn test_stale_must_precede_hard_stop() {
        let raw = "tcp:\n  pi_port: 5055\n  stale_timeout_s: 2.0\n  hard_stop_timeout_s: 1.0\n";
        assert!(NetworkConfig::from_yaml_str(raw).is_err());
    }

    #[test]
    fn test_missing_port_is_an_error() {
        assert!(NetworkConfig::from_yaml_str("tcp:\n  host: 127.0.0.1\n").is_err());
    }
}
