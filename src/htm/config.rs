use std::ops::Deref;
use std::str::FromStr;

use phf::phf_map;
use serde::Deserialize;

use crate::htm::error::ConfigError;
use crate::htm::types::{Addr, CacheLevel, SetKind};
use crate::sim::config::Config;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolutionPolicy {
    #[default]
    RequesterWins,
    CommitterWins,
    RequesterStallsCdaHybrid,
    RequesterStallsCdaHybridNtx,
    RequesterStallsCdaBaseNtx,
    RequesterStallsCdaBase,
}

impl ConflictResolutionPolicy {
    pub const ALL: [ConflictResolutionPolicy; 6] = [
        Self::RequesterWins,
        Self::CommitterWins,
        Self::RequesterStallsCdaHybrid,
        Self::RequesterStallsCdaHybridNtx,
        Self::RequesterStallsCdaBaseNtx,
        Self::RequesterStallsCdaBase,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::RequesterWins => "requester_wins",
            Self::CommitterWins => "committer_wins",
            Self::RequesterStallsCdaHybrid => "requester_stalls_cda_hybrid",
            Self::RequesterStallsCdaHybridNtx => "requester_stalls_cda_hybrid_ntx",
            Self::RequesterStallsCdaBaseNtx => "requester_stalls_cda_base_ntx",
            Self::RequesterStallsCdaBase => "requester_stalls_cda_base",
        }
    }

    pub fn is_requester_stalls(self) -> bool {
        !matches!(self, Self::RequesterWins | Self::CommitterWins)
    }

    /// Whether non-transactional requesters may be nacked.
    pub fn nacks_non_transactional(self) -> bool {
        matches!(
            self,
            Self::RequesterStallsCdaHybridNtx | Self::RequesterStallsCdaBaseNtx
        )
    }

    pub fn is_hybrid(self) -> bool {
        matches!(
            self,
            Self::RequesterStallsCdaHybrid | Self::RequesterStallsCdaHybridNtx
        )
    }
}

impl FromStr for ConflictResolutionPolicy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|policy| policy.as_str() == value)
            .ok_or_else(|| {
                format!(
                    "unsupported conflict resolution '{}', expected one of: {}",
                    value,
                    Self::ALL.map(|p| p.as_str()).join(", ")
                )
            })
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LazyArbitration {
    #[default]
    Magic,
    Token,
}

impl LazyArbitration {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Magic => "magic",
            Self::Token => "token",
        }
    }
}

impl FromStr for LazyArbitration {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "magic" => Ok(Self::Magic),
            "token" => Ok(Self::Token),
            _ => Err(format!(
                "unsupported lazy arbitration '{}', expected one of: magic, token",
                value
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersioningMode {
    Lazy,
    Eager,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionMode {
    Lazy,
    Eager,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HtmConfig {
    pub disable_speculation: bool,
    pub lazy_vm: bool,
    pub eager_cd: bool,
    pub conflict_resolution: ConflictResolutionPolicy,
    pub lazy_arbitration: LazyArbitration,
    pub allow_read_set_l0_cache_evictions: bool,
    pub allow_read_set_l1_cache_evictions: bool,
    pub allow_read_set_l2_cache_evictions: bool,
    pub allow_write_set_l0_cache_evictions: bool,
    pub allow_write_set_l1_cache_evictions: bool,
    pub allow_write_set_l2_cache_evictions: bool,
    pub precise_read_set_tracking: bool,
    pub trans_aware_l0_replacements: bool,
    pub l0_downgrade_on_l1_gets: bool,
    pub reload_if_stale: bool,
    pub max_retries: u32,
    pub backoff: bool,
    pub heap_prefault: bool,
    /// Shadow every transactional access with exact line sets and panic
    /// when two open transactions hold conflicting lines.
    pub isolation_checker: bool,
    /// Check committed reads against memory at publish and the undo log
    /// against memory after an unroll.
    pub value_checker: bool,
    pub fallback_lock_addr: Addr,
    pub signature_bits: usize,
    pub signature_hashes: usize,
    pub signature_saturation: f64,
    pub stall_limit: u32,
    pub stall_timeout_us: u64,
    pub backoff_base_us: u64,
    pub backoff_max_shift: u32,
    pub seed: u64,
}

impl Config for HtmConfig {}

impl Default for HtmConfig {
    fn default() -> Self {
        // cfg1_base: eager conflict detection, lazy versioning, requester wins
        Self {
            disable_speculation: false,
            lazy_vm: true,
            eager_cd: true,
            conflict_resolution: ConflictResolutionPolicy::RequesterWins,
            lazy_arbitration: LazyArbitration::Magic,
            allow_read_set_l0_cache_evictions: false,
            allow_read_set_l1_cache_evictions: false,
            allow_read_set_l2_cache_evictions: false,
            allow_write_set_l0_cache_evictions: false,
            allow_write_set_l1_cache_evictions: false,
            allow_write_set_l2_cache_evictions: false,
            precise_read_set_tracking: false,
            trans_aware_l0_replacements: false,
            l0_downgrade_on_l1_gets: false,
            reload_if_stale: false,
            max_retries: 6,
            backoff: true,
            heap_prefault: false,
            isolation_checker: false,
            value_checker: false,
            fallback_lock_addr: 0x00ff_f000,
            signature_bits: 1024,
            signature_hashes: 2,
            signature_saturation: 0.5,
            stall_limit: 64,
            stall_timeout_us: 200,
            backoff_base_us: 2,
            backoff_max_shift: 8,
            seed: 0,
        }
    }
}

/// Short names used when composing a configuration description string.
static OPTION_ABBREVIATIONS: phf::Map<&'static str, &'static str> = phf_map! {
    "disable_speculation" => "NoSpec",
    "lazy_vm" => "LV",
    "eager_cd" => "ED",
    "conflict_resolution" => "CR",
    "lazy_arbitration" => "LArb",
    "allow_read_set_l0_cache_evictions" => "RSL0Ev",
    "allow_read_set_l1_cache_evictions" => "RSL1Ev",
    "allow_read_set_l2_cache_evictions" => "RSL2Ev",
    "allow_write_set_l0_cache_evictions" => "WSL0Ev",
    "allow_write_set_l1_cache_evictions" => "WSL1Ev",
    "allow_write_set_l2_cache_evictions" => "WSL2Ev",
    "precise_read_set_tracking" => "RSPrec",
    "trans_aware_l0_replacements" => "L0Repl",
    "reload_if_stale" => "RldStale",
    "l0_downgrade_on_l1_gets" => "DwnG",
    "max_retries" => "Rtry",
    "backoff" => "Bkoff",
    "heap_prefault" => "Pflt",
    "isolation_checker" => "IsoChk",
    "value_checker" => "ValChk",
};

static VALUE_ABBREVIATIONS: phf::Map<&'static str, &'static str> = phf_map! {
    "requester_wins" => "rw",
    "committer_wins" => "cw",
    "magic" => "mg",
    "token" => "tkn",
    "requester_stalls_cda_base" => "cdab",
    "requester_stalls_cda_base_ntx" => "cdabntx",
    "requester_stalls_cda_hybrid" => "cdah",
    "requester_stalls_cda_hybrid_ntx" => "cdahntx",
};

pub const PRESETS: [&str; 16] = [
    "cfg1_base",
    "cfg1_l0rsetevict",
    "cfg1_l1rsetevict",
    "cfg1_l1rsetevict_pf",
    "cfg1_l1rsetevict_pf_dwng",
    "cfg1_pf_lazycd_magic_cw",
    "cfg1_pf_dwng_lazycd_magic_cw",
    "cfg1_l0rsetevict_pf_dwng_lazycd_magic_cw",
    "cfg1_l1rsetevict_pf_dwng_lazycd_magic_cw",
    "cfg1_l2rsetevict_pf_dwng_lazycd_magic_cw",
    "cfg1_l1rsetevict_pf_dwng_lazycd_magic_rw",
    "cfg1_l1rsetevict_pf_dwng_lazycd_token_cw",
    "cfg1_l1rsetevict_pf_dwng_precise",
    "cfg1_l1rsetevict_pf_dwng_precise_reqstalls",
    "cfg1_l1rsetevict_pf_dwng_precise_reqstalls_retry64",
    "cfg1_l2rwsetevict_pf_dwng_precise_reqstalls_eagervm",
];

impl HtmConfig {
    pub fn versioning(&self) -> VersioningMode {
        if self.lazy_vm {
            VersioningMode::Lazy
        } else {
            VersioningMode::Eager
        }
    }

    pub fn detection(&self) -> DetectionMode {
        if self.eager_cd {
            DetectionMode::Eager
        } else {
            DetectionMode::Lazy
        }
    }

    pub fn allows_eviction(&self, level: CacheLevel, set: SetKind) -> bool {
        match (set, level) {
            (SetKind::Read, CacheLevel::L0) => self.allow_read_set_l0_cache_evictions,
            (SetKind::Read, CacheLevel::L1) => self.allow_read_set_l1_cache_evictions,
            (SetKind::Read, CacheLevel::L2) => self.allow_read_set_l2_cache_evictions,
            (SetKind::Write, CacheLevel::L0) => self.allow_write_set_l0_cache_evictions,
            (SetKind::Write, CacheLevel::L1) => self.allow_write_set_l1_cache_evictions,
            (SetKind::Write, CacheLevel::L2) => self.allow_write_set_l2_cache_evictions,
        }
    }

    fn set_eviction(&mut self, level: CacheLevel, set: SetKind, allow: bool) {
        let flag = match (set, level) {
            (SetKind::Read, CacheLevel::L0) => &mut self.allow_read_set_l0_cache_evictions,
            (SetKind::Read, CacheLevel::L1) => &mut self.allow_read_set_l1_cache_evictions,
            (SetKind::Read, CacheLevel::L2) => &mut self.allow_read_set_l2_cache_evictions,
            (SetKind::Write, CacheLevel::L0) => &mut self.allow_write_set_l0_cache_evictions,
            (SetKind::Write, CacheLevel::L1) => &mut self.allow_write_set_l1_cache_evictions,
            (SetKind::Write, CacheLevel::L2) => &mut self.allow_write_set_l2_cache_evictions,
        };
        *flag = allow;
    }

    /// Build one of the named configuration points. Each preset is the
    /// baseline with a handful of options flipped.
    pub fn preset(name: &str) -> Result<Self, ConfigError> {
        let mut cfg = Self::default();
        let mut flip = |opts: &str| {
            for opt in opts.split('_') {
                match opt {
                    "l0rsetevict" => cfg.set_eviction(CacheLevel::L0, SetKind::Read, true),
                    "l1rsetevict" => {
                        cfg.set_eviction(CacheLevel::L0, SetKind::Read, true);
                        cfg.set_eviction(CacheLevel::L1, SetKind::Read, true);
                    }
                    "l2rsetevict" => {
                        for level in CacheLevel::ALL {
                            cfg.set_eviction(level, SetKind::Read, true);
                        }
                    }
                    "l2rwsetevict" => {
                        for level in CacheLevel::ALL {
                            cfg.set_eviction(level, SetKind::Read, true);
                            cfg.set_eviction(level, SetKind::Write, true);
                        }
                    }
                    "pf" => cfg.heap_prefault = true,
                    "dwng" => cfg.l0_downgrade_on_l1_gets = true,
                    "lazycd" => cfg.eager_cd = false,
                    "magic" => cfg.lazy_arbitration = LazyArbitration::Magic,
                    "token" => cfg.lazy_arbitration = LazyArbitration::Token,
                    "cw" => cfg.conflict_resolution = ConflictResolutionPolicy::CommitterWins,
                    "rw" => cfg.conflict_resolution = ConflictResolutionPolicy::RequesterWins,
                    "precise" => cfg.precise_read_set_tracking = true,
                    "reqstalls" => {
                        cfg.conflict_resolution = ConflictResolutionPolicy::RequesterStallsCdaHybrid
                    }
                    "retry64" => cfg.max_retries = 64,
                    "eagervm" => {
                        // the eager-versioning point also widens the retry budget
                        cfg.lazy_vm = false;
                        cfg.max_retries = 128;
                    }
                    _ => return false,
                }
            }
            true
        };
        let known = PRESETS.contains(&name);
        let rest = name.strip_prefix("cfg1_").unwrap_or("");
        if !known || (rest != "base" && !flip(rest)) {
            return Err(ConfigError::UnknownPreset(name.to_string()));
        }
        Ok(cfg)
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        if self.reload_if_stale && !self.precise_read_set_tracking {
            return Err(ConfigError::ReloadIfStaleRequiresPreciseTracking);
        }
        let policy = self.conflict_resolution;
        if self.reload_if_stale && policy.is_requester_stalls() {
            // an older reader repeatedly reloading could starve a younger writer
            return Err(ConfigError::ReloadIfStaleWithStallPolicy(policy));
        }
        if policy == ConflictResolutionPolicy::CommitterWins && self.eager_cd {
            return Err(ConfigError::CommitterWinsRequiresLazyDetection);
        }
        if policy.is_requester_stalls() && !self.eager_cd {
            return Err(ConfigError::StallPolicyRequiresEagerDetection(policy));
        }
        if !self.eager_cd && !self.lazy_vm {
            return Err(ConfigError::LazyDetectionRequiresLazyVersioning);
        }
        for level in [CacheLevel::L1, CacheLevel::L2] {
            if self.lazy_vm && self.allows_eviction(level, SetKind::Write) {
                return Err(ConfigError::WriteSetEvictionRequiresEagerVersioning(level));
            }
        }
        for set in [SetKind::Read, SetKind::Write] {
            for (shallow, deep) in [(CacheLevel::L0, CacheLevel::L1), (CacheLevel::L1, CacheLevel::L2)] {
                if self.allows_eviction(deep, set) && !self.allows_eviction(shallow, set) {
                    return Err(ConfigError::EvictionRequiresShallowerLevel { level: deep, set });
                }
            }
        }
        if self.max_retries == 0 {
            return Err(ConfigError::ZeroMaxRetries);
        }
        if !self.precise_read_set_tracking
            && (!self.signature_bits.is_power_of_two() || self.signature_hashes == 0)
        {
            return Err(ConfigError::BadSignature {
                bits: self.signature_bits,
                hashes: self.signature_hashes,
            });
        }
        Ok(ValidatedConfig(self))
    }

    /// Compact description such as `LV_ED_CRrw_Rtry6_Bkoff`.
    pub fn describe(&self) -> String {
        let flag = |name: &str, on: bool| on.then(|| OPTION_ABBREVIATIONS[name].to_string());
        let value = |name: &str, v: &str| {
            let v = VALUE_ABBREVIATIONS.get(v).copied().unwrap_or(v);
            Some(format!("{}{}", OPTION_ABBREVIATIONS[name], v))
        };
        let parts = [
            flag("disable_speculation", self.disable_speculation),
            flag("lazy_vm", self.lazy_vm),
            flag("eager_cd", self.eager_cd),
            value("conflict_resolution", self.conflict_resolution.as_str()),
            (!self.eager_cd)
                .then(|| value("lazy_arbitration", self.lazy_arbitration.as_str()))
                .flatten(),
            flag("allow_read_set_l0_cache_evictions", self.allow_read_set_l0_cache_evictions),
            flag("allow_read_set_l1_cache_evictions", self.allow_read_set_l1_cache_evictions),
            flag("allow_read_set_l2_cache_evictions", self.allow_read_set_l2_cache_evictions),
            flag("allow_write_set_l0_cache_evictions", self.allow_write_set_l0_cache_evictions),
            flag("allow_write_set_l1_cache_evictions", self.allow_write_set_l1_cache_evictions),
            flag("allow_write_set_l2_cache_evictions", self.allow_write_set_l2_cache_evictions),
            flag("precise_read_set_tracking", self.precise_read_set_tracking),
            flag("trans_aware_l0_replacements", self.trans_aware_l0_replacements),
            flag("reload_if_stale", self.reload_if_stale),
            flag("l0_downgrade_on_l1_gets", self.l0_downgrade_on_l1_gets),
            value("max_retries", &self.max_retries.to_string()),
            flag("backoff", self.backoff),
            flag("heap_prefault", self.heap_prefault),
            flag("isolation_checker", self.isolation_checker),
            flag("value_checker", self.value_checker),
        ];
        parts.into_iter().flatten().collect::<Vec<_>>().join("_")
    }
}

/// A configuration that passed `HtmConfig::validate`. Immutable for the
/// lifetime of the system it is handed to.
#[derive(Debug, Clone)]
pub struct ValidatedConfig(HtmConfig);

impl Deref for ValidatedConfig {
    type Target = HtmConfig;

    fn deref(&self) -> &HtmConfig {
        &self.0
    }
}
