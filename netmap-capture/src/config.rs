//! Capture configuration (§6, "consumed"), loaded from TOML via `serde`.

use serde::{Deserialize, Serialize};

use crate::packet::{ChecksumMode, CopyMode};
use crate::stats::ChecksumAutoPolicy;

/// One capture worker's configuration, matching spec.md §6's
/// `{iface, out_iface?, threads, promisc, copy_mode, checksum_mode,
/// bpf_filter?}` plus ambient fields for the supplemented checksum
/// policy and logging.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    pub iface: String,
    #[serde(default)]
    pub out_iface: Option<String>,
    #[serde(default = "default_threads")]
    pub threads: usize,
    #[serde(default)]
    pub promisc: bool,
    #[serde(default)]
    pub copy_mode: CopyMode,
    #[serde(default)]
    pub checksum_mode: ChecksumMode,
    #[serde(default)]
    pub bpf_filter: Option<String>,

    /// Ambient: tunes the checksum AUTO-mode ratio latch (§2 item 10).
    #[serde(default = "default_checksum_auto_min_packets")]
    pub checksum_auto_min_packets: u64,
    #[serde(default = "default_checksum_auto_ratio")]
    pub checksum_auto_ratio: f64,

    /// Ambient: passed straight to `env_logger`/`log` at startup.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_threads() -> usize {
    1
}

fn default_checksum_auto_min_packets() -> u64 {
    1000
}

fn default_checksum_auto_ratio() -> f64 {
    0.7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl CaptureConfig {
    pub fn checksum_auto_policy(&self) -> ChecksumAutoPolicy {
        ChecksumAutoPolicy {
            min_packets: self.checksum_auto_min_packets,
            threshold: self.checksum_auto_ratio,
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = CaptureConfig::from_toml_str("iface = \"eth0\"").unwrap();
        assert_eq!(cfg.iface, "eth0");
        assert_eq!(cfg.threads, 1);
        assert!(!cfg.promisc);
        assert_eq!(cfg.copy_mode, CopyMode::None);
        assert_eq!(cfg.checksum_mode, ChecksumMode::Auto);
        assert_eq!(cfg.checksum_auto_min_packets, 1000);
        assert!((cfg.checksum_auto_ratio - 0.7).abs() < f64::EPSILON);
    }

    #[test]
    fn ips_config_parses() {
        let toml = r#"
            iface = "eth0"
            out_iface = "eth1"
            threads = 4
            promisc = true
            copy_mode = "ips"
            checksum_mode = "disable"
        "#;
        let cfg = CaptureConfig::from_toml_str(toml).unwrap();
        assert_eq!(cfg.out_iface.as_deref(), Some("eth1"));
        assert_eq!(cfg.threads, 4);
        assert_eq!(cfg.copy_mode, CopyMode::Ips);
        assert_eq!(cfg.checksum_mode, ChecksumMode::Disable);
    }
}
