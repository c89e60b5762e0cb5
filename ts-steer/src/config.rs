//! YAML configuration parsing and validation.
//!
//! Defines the deployment model for ts-steer and validates it at load time.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use ts_steer_common::{MAX_FILTER_PORTS, MAX_QUEUES};

// ---------------------------------------------------------------------------
// Top-Level Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    /// Network interface the XDP program attaches to (e.g., "enp3s0").
    pub interface: String,

    /// XDP attach mode.
    #[serde(default)]
    pub attach_mode: AttachMode,

    /// Receive queues to bind an AF_XDP consumer to.
    pub queues: Vec<u32>,

    /// UDP destination ports to steer. Empty means every UDP port.
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Multicast groups to join on the interface so the streams are delivered.
    #[serde(default)]
    pub groups: Vec<IpAddr>,

    /// AF_XDP consumer socket settings.
    #[serde(default)]
    pub sink: SinkSettings,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachMode {
    /// Let the kernel pick (native if the driver supports it).
    #[default]
    Default,
    /// Generic XDP, works on any driver.
    Skb,
    /// Native driver XDP.
    Driver,
    /// NIC offload.
    Hardware,
}

// ---------------------------------------------------------------------------
// Sink Settings
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct SinkSettings {
    /// Descriptors per ring (power of two).
    #[serde(default = "default_ring_size")]
    pub ring_size: u32,

    /// UMEM frame size (power of two, 2048..=4096).
    #[serde(default = "default_frame_size")]
    pub frame_size: u32,
}

impl Default for SinkSettings {
    fn default() -> Self {
        Self {
            ring_size: default_ring_size(),
            frame_size: default_frame_size(),
        }
    }
}

impl SinkSettings {
    /// UMEM frames: twice the ring so the fill ring can be topped up while
    /// the RX ring is full.
    pub fn num_frames(&self) -> u32 {
        self.ring_size * 2
    }
}

fn default_ring_size() -> u32 {
    2048
}
fn default_frame_size() -> u32 {
    4096
}

// ---------------------------------------------------------------------------
// Metrics Config
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_metrics_bind")]
    pub bind: SocketAddr,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind: default_metrics_bind(),
            path: default_metrics_path(),
        }
    }
}

fn default_metrics_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 2112))
}
fn default_metrics_path() -> String {
    "/metrics".to_string()
}

// ---------------------------------------------------------------------------
// Loading & Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Load config from a YAML file path.
    pub fn load(path: &Path) -> Result<Self> {
        let contents =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;

        let config: Config =
            serde_yaml::from_str(&contents).with_context(|| "parsing YAML config")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration consistency.
    fn validate(&self) -> Result<()> {
        if self.interface.trim().is_empty() {
            bail!("'interface' must not be empty");
        }

        if self.queues.is_empty() {
            bail!("at least one queue is required");
        }
        let mut seen = HashSet::new();
        for &queue in &self.queues {
            if queue >= MAX_QUEUES {
                bail!("queue {} out of range (max {})", queue, MAX_QUEUES - 1);
            }
            if !seen.insert(queue) {
                bail!("queue {} listed more than once", queue);
            }
        }

        if self.ports.contains(&0) {
            bail!("port 0 cannot be filtered on");
        }
        let distinct: HashSet<u16> = self.ports.iter().copied().collect();
        if distinct.len() > MAX_FILTER_PORTS as usize {
            bail!(
                "{} distinct ports exceeds the filter capacity ({})",
                distinct.len(),
                MAX_FILTER_PORTS
            );
        }

        for group in &self.groups {
            if !group.is_multicast() {
                bail!("group {} is not a multicast address", group);
            }
        }

        let sink = &self.sink;
        if !sink.ring_size.is_power_of_two() || sink.ring_size < 64 {
            bail!(
                "sink.ring_size must be a power of two >= 64, got {}",
                sink.ring_size
            );
        }
        if !sink.frame_size.is_power_of_two() || !(2048..=4096).contains(&sink.frame_size) {
            bail!(
                "sink.frame_size must be 2048 or 4096, got {}",
                sink.frame_size
            );
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> Result<Config> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config() {
        let yaml = r#"
interface: enp3s0
queues: [0]
"#;
        let config = parse(yaml).unwrap();
        assert_eq!(config.queues, vec![0]);
        assert!(config.ports.is_empty());
        assert!(config.groups.is_empty());
        assert_eq!(config.attach_mode, AttachMode::Default);
        assert_eq!(config.sink.ring_size, 2048);
        assert_eq!(config.sink.num_frames(), 4096);
        assert!(!config.metrics.enabled);
        assert_eq!(config.metrics.bind.port(), 2112);
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
interface: enp3s0
attach_mode: skb
queues: [0, 3]
ports: [5000, 5555, 5500, 2058]
groups: ["239.24.9.13", "ff3e::1234"]
sink:
  ring_size: 1024
  frame_size: 2048
metrics:
  enabled: true
  bind: "127.0.0.1:9100"
"#;
        let config = parse(yaml).unwrap();
        assert_eq!(config.attach_mode, AttachMode::Skb);
        assert_eq!(config.queues, vec![0, 3]);
        assert_eq!(config.ports, vec![5000, 5555, 5500, 2058]);
        assert_eq!(config.groups.len(), 2);
        assert_eq!(config.sink.frame_size, 2048);
        assert_eq!(config.metrics.path, "/metrics");
    }

    #[test]
    fn test_queue_validation() {
        assert!(parse("interface: eth0\nqueues: []\n").is_err());
        assert!(parse("interface: eth0\nqueues: [256]\n").is_err());
        assert!(parse("interface: eth0\nqueues: [1, 1]\n").is_err());
        assert!(parse("interface: eth0\nqueues: [255]\n").is_ok());
        assert!(parse("interface: ''\nqueues: [0]\n").is_err());
    }

    #[test]
    fn test_port_validation() {
        assert!(parse("interface: eth0\nqueues: [0]\nports: [0]\n").is_err());

        let too_many: Vec<String> = (1..=65).map(|p| p.to_string()).collect();
        let yaml = format!(
            "interface: eth0\nqueues: [0]\nports: [{}]\n",
            too_many.join(", ")
        );
        assert!(parse(&yaml).is_err());

        // Duplicates collapse, so 64 distinct ports plus a repeat is fine.
        let mut ports: Vec<String> = (1..=64).map(|p| p.to_string()).collect();
        ports.push("1".to_string());
        let yaml = format!("interface: eth0\nqueues: [0]\nports: [{}]\n", ports.join(", "));
        assert!(parse(&yaml).is_ok());
    }

    #[test]
    fn test_group_must_be_multicast() {
        let yaml = "interface: eth0\nqueues: [0]\ngroups: [\"10.0.0.1\"]\n";
        assert!(parse(yaml).is_err());
    }

    #[test]
    fn test_sink_validation() {
        let yaml = "interface: eth0\nqueues: [0]\nsink: { ring_size: 1000 }\n";
        assert!(parse(yaml).is_err());
        let yaml = "interface: eth0\nqueues: [0]\nsink: { frame_size: 1024 }\n";
        assert!(parse(yaml).is_err());
        let yaml = "interface: eth0\nqueues: [0]\nsink: { frame_size: 8192 }\n";
        assert!(parse(yaml).is_err());
    }
}
