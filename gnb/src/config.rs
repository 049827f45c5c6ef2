//! gNodeB Configuration
//!
//! srsRAN-style YAML (or TOML) file with a `cell_cfg` section for the radio
//! parameters operators usually touch, a `mac` section carrying every
//! scheduler knob, and a `log` section.

use std::path::Path;

use anyhow::{anyhow, Context};
use common::types::{Bandwidth, CellId, Pci, SubcarrierSpacing};
use layers::mac::MacConfig;
use serde::{Deserialize, Serialize};

/// Top-level configuration file
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct GnbConfig {
    /// Cell configuration
    #[serde(default)]
    pub cell_cfg: CellConfig,
    /// Scheduler configuration, overridden by `cell_cfg` where both set a value
    #[serde(default)]
    pub mac: MacConfig,
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Cell configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CellConfig {
    /// Physical Cell ID
    pub pci: u16,
    pub cell_id: u16,
    /// Channel bandwidth in MHz
    #[serde(rename = "channel_bandwidth_MHz")]
    pub channel_bandwidth_mhz: u32,
    /// Common subcarrier spacing in kHz
    pub common_scs: u32,
    /// Override of the PRB count derived from the bandwidth
    #[serde(default)]
    pub nof_prbs: Option<u16>,
    /// Maximum connected UEs
    #[serde(default = "default_max_ues")]
    pub max_ues: usize,
    /// PDSCH configuration
    #[serde(default)]
    pub pdsch: PdschConfig,
    /// PUSCH configuration
    #[serde(default)]
    pub pusch: PuschConfig,
}

impl Default for CellConfig {
    fn default() -> Self {
        Self {
            pci: 1,
            cell_id: 1,
            channel_bandwidth_mhz: 20,
            common_scs: 30,
            nof_prbs: None,
            max_ues: default_max_ues(),
            pdsch: PdschConfig::default(),
            pusch: PuschConfig::default(),
        }
    }
}

fn default_max_ues() -> usize {
    32
}

/// PDSCH configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PdschConfig {
    /// MCS table
    #[serde(default = "default_mcs_table")]
    pub mcs_table: String,
    #[serde(default = "default_ues_per_slot")]
    pub max_ues_per_slot: usize,
}

impl Default for PdschConfig {
    fn default() -> Self {
        Self { mcs_table: default_mcs_table(), max_ues_per_slot: default_ues_per_slot() }
    }
}

/// PUSCH configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PuschConfig {
    /// MCS table
    #[serde(default = "default_mcs_table")]
    pub mcs_table: String,
    #[serde(default = "default_ues_per_slot")]
    pub max_ues_per_slot: usize,
    /// PRBs the controller has blacklisted from the start
    #[serde(default)]
    pub prb_blacklist: Vec<u16>,
}

impl Default for PuschConfig {
    fn default() -> Self {
        Self {
            mcs_table: default_mcs_table(),
            max_ues_per_slot: default_ues_per_slot(),
            prb_blacklist: Vec::new(),
        }
    }
}

fn default_mcs_table() -> String {
    "qam64".to_string()
}

fn default_ues_per_slot() -> usize {
    4
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// All layers log level
    #[serde(default = "default_log_level")]
    pub all_level: String,
    /// MAC layer log level
    #[serde(default = "default_log_level")]
    pub mac_level: String,
    /// Seconds between telemetry dumps, 0 disables them
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            all_level: default_log_level(),
            mac_level: default_log_level(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_stats_interval() -> u64 {
    5
}

impl LogConfig {
    /// `EnvFilter` directive for these levels
    pub fn filter_directive(&self) -> String {
        format!("{},layers::mac={}", self.all_level, self.mac_level)
    }
}

fn parse_mcs_table(name: &str) -> anyhow::Result<bool> {
    match name {
        "qam64" => Ok(false),
        "qam256" => Ok(true),
        other => Err(anyhow!("Unknown MCS table: {}", other)),
    }
}

impl GnbConfig {
    /// Load configuration from a YAML or TOML file, chosen by extension
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path).with_context(|| format!("reading {}", path))?;
        let config = match Path::new(path).extension().and_then(|ext| ext.to_str()) {
            Some("toml") => toml::from_str(&contents).with_context(|| format!("parsing {}", path))?,
            _ => serde_yaml::from_str(&contents).with_context(|| format!("parsing {}", path))?,
        };
        Ok(config)
    }

    pub fn pci(&self) -> anyhow::Result<Pci> {
        Pci::new(self.cell_cfg.pci).ok_or_else(|| anyhow!("Invalid PCI: {}", self.cell_cfg.pci))
    }

    /// Scheduler configuration with the `cell_cfg` values applied
    pub fn mac_config(&self) -> anyhow::Result<MacConfig> {
        let cell = &self.cell_cfg;
        let mac = MacConfig {
            cell_id: CellId(cell.cell_id),
            scs: SubcarrierSpacing::from_khz(cell.common_scs)?,
            bandwidth: Bandwidth::from_mhz(cell.channel_bandwidth_mhz)?,
            num_prbs: cell.nof_prbs.or(self.mac.num_prbs),
            max_ues: cell.max_ues,
            max_dl_ues_per_slot: cell.pdsch.max_ues_per_slot,
            max_ul_ues_per_slot: cell.pusch.max_ues_per_slot,
            dl_256qam: parse_mcs_table(&cell.pdsch.mcs_table)?,
            ul_256qam: parse_mcs_table(&cell.pusch.mcs_table)?,
            ..self.mac.clone()
        };
        mac.validate()?;
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
cell_cfg:
  pci: 7
  cell_id: 3
  channel_bandwidth_MHz: 40
  common_scs: 30
  pdsch:
    mcs_table: qam256
  pusch:
    max_ues_per_slot: 2
    prb_blacklist: [0, 1, 2]
mac:
  harq:
    num_dl_harq: 8
    k1: 2
  ra:
    pool_size: 8
log:
  mac_level: debug
"#;

    #[test]
    fn test_yaml_config_overrides() {
        let config: GnbConfig = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(config.pci().unwrap(), Pci(7));
        assert_eq!(config.cell_cfg.pusch.prb_blacklist, vec![0, 1, 2]);

        let mac = config.mac_config().unwrap();
        assert_eq!(mac.cell_id, CellId(3));
        assert_eq!(mac.scs, SubcarrierSpacing::Scs30);
        assert_eq!(mac.bandwidth, Bandwidth::Bw40);
        assert!(mac.dl_256qam);
        assert!(!mac.ul_256qam);
        assert_eq!(mac.max_ul_ues_per_slot, 2);
        assert_eq!(mac.harq.num_dl_harq, 8);
        assert_eq!(mac.harq.k1, 2);
        assert_eq!(mac.harq.num_ul_harq, 16);
        assert_eq!(mac.ra.pool_size, 8);
        assert_eq!(config.log.filter_directive(), "info,layers::mac=debug");
    }

    #[test]
    fn test_toml_config() {
        let config: GnbConfig = toml::from_str(
            r#"
[cell_cfg]
pci = 1
cell_id = 1
channel_bandwidth_MHz = 10
common_scs = 15
nof_prbs = 52

[mac]
max_ues = 4
"#,
        )
        .unwrap();
        let mac = config.mac_config().unwrap();
        assert_eq!(mac.prbs(), 52);
        assert_eq!(mac.slots_per_frame(), 10);
        assert_eq!(mac.max_ues, config.cell_cfg.max_ues);
    }

    #[test]
    fn test_invalid_cell_values_rejected() {
        let mut config = GnbConfig::default();
        config.cell_cfg.common_scs = 45;
        assert!(config.mac_config().is_err());

        let mut config = GnbConfig::default();
        config.cell_cfg.pdsch.mcs_table = "qam1024".into();
        assert!(config.mac_config().is_err());

        let mut config = GnbConfig::default();
        config.cell_cfg.pci = 2000;
        assert!(config.pci().is_err());
    }
}
