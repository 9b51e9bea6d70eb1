use std::path::PathBuf;
use std::str::FromStr;

use log::warn;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use toml::*;

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Workload {
    /// Random transfers between accounts; the total balance is invariant.
    #[default]
    Bank,
    /// Every transaction increments one shared counter.
    Counter,
}

impl FromStr for Workload {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "bank" => Ok(Self::Bank),
            "counter" => Ok(Self::Counter),
            _ => Err(format!(
                "unsupported workload '{}', expected one of: bank, counter",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub workload: Workload,
    pub cores: usize,
    pub txns_per_core: usize,
    pub accounts: usize,
    pub account_stride: u64,
    pub heap_base: u64,
    pub initial_balance: u64,
    /// Fraction of bank transactions that read every account instead of
    /// moving money.
    pub audit_ratio: f64,
    pub seed: u64,
    pub stats_json: Option<PathBuf>,
}

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value.clone().try_into().expect("cannot deserialize config"),
            None => {
                warn!("config section not found");
                Self::default()
            }
        }
    }
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            workload: Workload::Bank,
            cores: 4,
            txns_per_core: 1000,
            accounts: 64,
            account_stride: 64,
            heap_base: 0x1000_0000,
            initial_balance: 1000,
            audit_ratio: 0.1,
            seed: 0,
            stats_json: None,
        }
    }
}

impl SimConfig {
    pub fn ensure_valid(&self) {
        assert!(self.cores > 0, "cores must be > 0");
        assert!(self.accounts > 1, "accounts must be > 1");
        assert!(self.account_stride >= 8, "account_stride must be >= 8");
        assert!(
            (0.0..=1.0).contains(&self.audit_ratio),
            "audit_ratio must be within [0, 1]"
        );
    }

    pub fn account_addr(&self, index: usize) -> u64 {
        self.heap_base + index as u64 * self.account_stride
    }

    pub fn heap_bytes(&self) -> u64 {
        self.accounts as u64 * self.account_stride
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_section_uses_defaults() {
        let cfg = SimConfig::from_section(None);
        assert_eq!(cfg.cores, 4);
        assert_eq!(cfg.workload, Workload::Bank);
    }

    #[test]
    fn section_overrides_some_fields() {
        let table: Table = toml::from_str(
            r#"
            [sim]
            workload = "counter"
            cores = 8
            stats_json = "out/stats.json"
            "#,
        )
        .unwrap();
        let cfg = SimConfig::from_section(table.get("sim"));
        assert_eq!(cfg.workload, Workload::Counter);
        assert_eq!(cfg.cores, 8);
        assert_eq!(cfg.accounts, 64);
        assert_eq!(cfg.stats_json, Some(PathBuf::from("out/stats.json")));
    }

    #[test]
    fn workload_parses_from_str() {
        assert_eq!("bank".parse::<Workload>(), Ok(Workload::Bank));
        assert!("ycsb".parse::<Workload>().is_err());
    }
}
