use std::fs;
use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use htmsim::htm::{CacheConfig, ConflictResolutionPolicy, HtmConfig};
use htmsim::sim::config::{Config, SimConfig, Workload};
use htmsim::sim::top::HtmTop;
use log::info;
use toml::Table;

#[derive(Parser)]
#[command(version, about)]
struct HtmSimArgs {
    #[arg(help = "Path to config.toml")]
    config_path: Option<PathBuf>,
    #[arg(long, help = "Use a named HTM preset instead of the [htm] section")]
    preset: Option<String>,
    #[arg(long, help = "Override conflict resolution policy")]
    policy: Option<ConflictResolutionPolicy>,
    #[arg(long, help = "Override workload (bank, counter)")]
    workload: Option<Workload>,
    #[arg(long, help = "Override number of cores")]
    cores: Option<usize>,
    #[arg(long, help = "Override transactions per core")]
    txns: Option<usize>,
    #[arg(long, help = "Override max retries before fallback")]
    max_retries: Option<u32>,
    #[arg(long, help = "Override workload and backoff seed")]
    seed: Option<u64>,
    #[arg(long, help = "Panic on any conflicting overlap between open transactions")]
    isolation_checker: bool,
    #[arg(long, help = "Check committed reads and undo-log unrolls against memory")]
    value_checker: bool,
    #[arg(long, help = "Write run statistics as JSON")]
    stats_json: Option<PathBuf>,
    #[arg(long, help = "List HTM presets and exit")]
    list_presets: bool,
}

pub fn main() -> anyhow::Result<()> {
    env_logger::init();

    let argv = HtmSimArgs::parse();
    if argv.list_presets {
        for name in htmsim::htm::config::PRESETS {
            println!("{:<56} {}", name, HtmConfig::preset(name)?.describe());
        }
        return Ok(());
    }

    let config_table: Table = match &argv.config_path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&text).context("cannot parse config toml")?
        }
        None => Table::new(),
    };
    let mut sim_config = SimConfig::from_section(config_table.get("sim"));
    let cache_config = CacheConfig::from_section(config_table.get("cache"));
    let mut htm_config = match &argv.preset {
        Some(name) => HtmConfig::preset(name)?,
        None => HtmConfig::from_section(config_table.get("htm")),
    };

    // override toml configs with argv
    sim_config.workload = argv.workload.unwrap_or(sim_config.workload);
    sim_config.cores = argv.cores.unwrap_or(sim_config.cores);
    sim_config.txns_per_core = argv.txns.unwrap_or(sim_config.txns_per_core);
    sim_config.seed = argv.seed.unwrap_or(sim_config.seed);
    sim_config.stats_json = argv.stats_json.or(sim_config.stats_json);
    htm_config.conflict_resolution = argv.policy.unwrap_or(htm_config.conflict_resolution);
    htm_config.max_retries = argv.max_retries.unwrap_or(htm_config.max_retries);
    htm_config.seed = argv.seed.unwrap_or(htm_config.seed);
    htm_config.isolation_checker |= argv.isolation_checker;
    htm_config.value_checker |= argv.value_checker;

    let htm_config = htm_config.validate().context("invalid HTM configuration")?;
    info!("htm config: {}", htm_config.describe());

    let top = HtmTop::new(sim_config, htm_config, cache_config);
    let report = top.run()?;

    let total = &report.total;
    println!("{}", report.htm);
    println!(
        "commits={} fallbacks={} aborts={} (conflict={} capacity={}) nacks={} sum={}/{}",
        total.commits(),
        total.fallbacks(),
        total.total_aborts(),
        total.conflict_aborts(),
        total.capacity_aborts(),
        total.nacks(),
        report.final_sum,
        report.expected_sum
    );
    if let Some(path) = &top.sim.stats_json {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    }
    if !report.invariant_holds() {
        bail!(
            "atomicity violated: sum {} != {}, {} audit mismatches",
            report.final_sum,
            report.expected_sum,
            report.cores.iter().map(|c| c.audit_mismatches).sum::<u64>()
        );
    }
    Ok(())
}
