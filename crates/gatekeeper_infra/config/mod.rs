//! Gatekeeper configuration: a centralized defaults table, an optional JSON file,
//! and a resolve step that fills gaps from the table and validates the result.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gatekeeper_core::PolicyGate;
use gatekeeper_core::ledger::RetentionPolicy;
use gatekeeper_core::rules::{RuleCatalog, RuleConfigError, RuleOverride};
use gatekeeper_core::tuning::TunerConfig;
use serde::Deserialize;
use thiserror::Error;

// Gate and tuner defaults are owned by the core crate.
pub use gatekeeper_core::gate::{TUNE_INTERVAL_DEFAULT, TUNING_HISTORY_MAX_DEFAULT};
pub use gatekeeper_core::tuning::{
    LOOSEN_FACTOR_DEFAULT, LOOSEN_FP_RATE_DEFAULT, TIGHTEN_FACTOR_DEFAULT,
    TIGHTEN_FP_RATE_DEFAULT, TIGHTEN_MIN_DETECTIONS_DEFAULT,
};

/// Defaults table.
pub const STATE_DIR_DEFAULT: &str = ".gatekeeper";
pub const DOMAIN_DEFAULT: &str = "default";
pub const LOCK_TIMEOUT_MS_DEFAULT: u64 = 3000;
pub const OVERRIDE_RETENTION_DAYS_DEFAULT: u64 = 30;
pub const OVERRIDE_RETENTION_MAX_DEFAULT: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    U64,
    F64,
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::U64 => f.write_str("u64"),
            ParamKind::F64 => f.write_str("f64"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DefaultValue {
    U64(u64),
    F64(f64),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("no default for config value: {key}")]
    MissingDefault { key: &'static str },
    #[error("type mismatch for config value: {key} (expected {expected})")]
    TypeMismatch {
        key: &'static str,
        expected: ParamKind,
    },
    #[error("invalid config value {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("invalid policy domain {domain:?}: use letters, digits, '-' or '_'")]
    InvalidDomain { domain: String },
    #[error(transparent)]
    Rules(#[from] RuleConfigError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GatekeeperDefaults {
    pub lock_timeout_ms: u64,
    pub tune_interval: u64,
    pub loosen_fp_rate: f64,
    pub tighten_fp_rate: f64,
    pub tighten_min_detections: u64,
    pub loosen_factor: f64,
    pub tighten_factor: f64,
    pub override_retention_days: u64,
    pub override_retention_max: u64,
    pub tuning_history_max: u64,
}

impl Default for GatekeeperDefaults {
    fn default() -> Self {
        Self {
            lock_timeout_ms: LOCK_TIMEOUT_MS_DEFAULT,
            tune_interval: TUNE_INTERVAL_DEFAULT,
            loosen_fp_rate: LOOSEN_FP_RATE_DEFAULT,
            tighten_fp_rate: TIGHTEN_FP_RATE_DEFAULT,
            tighten_min_detections: TIGHTEN_MIN_DETECTIONS_DEFAULT,
            loosen_factor: LOOSEN_FACTOR_DEFAULT,
            tighten_factor: TIGHTEN_FACTOR_DEFAULT,
            override_retention_days: OVERRIDE_RETENTION_DAYS_DEFAULT,
            override_retention_max: OVERRIDE_RETENTION_MAX_DEFAULT,
            tuning_history_max: TUNING_HISTORY_MAX_DEFAULT as u64,
        }
    }
}

impl GatekeeperDefaults {
    pub fn lookup(&self, key: &str) -> Option<DefaultValue> {
        match key {
            "lock_timeout_ms" => Some(DefaultValue::U64(self.lock_timeout_ms)),
            "tune_interval" => Some(DefaultValue::U64(self.tune_interval)),
            "loosen_fp_rate" => Some(DefaultValue::F64(self.loosen_fp_rate)),
            "tighten_fp_rate" => Some(DefaultValue::F64(self.tighten_fp_rate)),
            "tighten_min_detections" => Some(DefaultValue::U64(self.tighten_min_detections)),
            "loosen_factor" => Some(DefaultValue::F64(self.loosen_factor)),
            "tighten_factor" => Some(DefaultValue::F64(self.tighten_factor)),
            "override_retention_days" => Some(DefaultValue::U64(self.override_retention_days)),
            "override_retention_max" => Some(DefaultValue::U64(self.override_retention_max)),
            "tuning_history_max" => Some(DefaultValue::U64(self.tuning_history_max)),
            _ => None,
        }
    }
}

/// On-disk shape. Every field is optional; gaps resolve from the defaults table.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub state_dir: Option<PathBuf>,
    pub domain: Option<String>,
    pub lock_timeout_ms: Option<u64>,
    pub tune_interval: Option<u64>,
    pub loosen_fp_rate: Option<f64>,
    pub tighten_fp_rate: Option<f64>,
    pub tighten_min_detections: Option<u64>,
    pub loosen_factor: Option<f64>,
    pub tighten_factor: Option<f64>,
    pub override_retention_days: Option<u64>,
    pub override_retention_max: Option<u64>,
    pub tuning_history_max: Option<u64>,
    #[serde(default)]
    pub rules: BTreeMap<String, RuleOverride>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatekeeperConfig {
    pub state_dir: PathBuf,
    pub domain: String,
    pub lock_timeout: Duration,
    pub tune_interval: u64,
    pub tuner: TunerConfig,
    pub retention: RetentionPolicy,
    pub tuning_history_max: usize,
    pub rules: BTreeMap<String, RuleOverride>,
}

impl Default for GatekeeperConfig {
    fn default() -> Self {
        let defaults = GatekeeperDefaults::default();
        Self {
            state_dir: PathBuf::from(STATE_DIR_DEFAULT),
            domain: DOMAIN_DEFAULT.to_string(),
            lock_timeout: Duration::from_millis(defaults.lock_timeout_ms),
            tune_interval: defaults.tune_interval,
            tuner: TunerConfig {
                loosen_fp_rate: defaults.loosen_fp_rate,
                tighten_fp_rate: defaults.tighten_fp_rate,
                tighten_min_detections: defaults.tighten_min_detections,
                loosen_factor: defaults.loosen_factor,
                tighten_factor: defaults.tighten_factor,
            },
            retention: RetentionPolicy {
                max_age: days(defaults.override_retention_days),
                max_count: defaults.override_retention_max as usize,
            },
            tuning_history_max: defaults.tuning_history_max as usize,
            rules: BTreeMap::new(),
        }
    }
}

impl GatekeeperConfig {
    /// Load from `path`, or resolve pure defaults when no file is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            None => resolve(ConfigFile::default()),
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                let file: ConfigFile =
                    serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
                        path: path.to_path_buf(),
                        source,
                    })?;
                resolve(file)
            }
        }
    }

    pub fn with_state_dir(mut self, state_dir: impl Into<PathBuf>) -> Self {
        self.state_dir = state_dir.into();
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Result<Self, ConfigError> {
        let domain = domain.into();
        validate_domain(&domain)?;
        self.domain = domain;
        Ok(self)
    }

    /// Built-in catalog with this config's per-rule overrides applied.
    pub fn build_catalog(&self) -> Result<RuleCatalog, ConfigError> {
        Ok(RuleCatalog::builtin()?.with_overrides(&self.rules)?)
    }

    pub fn build_gate(&self) -> Result<PolicyGate, ConfigError> {
        Ok(PolicyGate::new(self.build_catalog()?)
            .with_tuner(self.tuner)
            .with_tune_interval(self.tune_interval)
            .with_history_limit(self.tuning_history_max))
    }
}

pub fn resolve(file: ConfigFile) -> Result<GatekeeperConfig, ConfigError> {
    let defaults = GatekeeperDefaults::default();
    let lock_timeout_ms = resolve_u64("lock_timeout_ms", file.lock_timeout_ms, &defaults)?;
    let tune_interval = resolve_u64("tune_interval", file.tune_interval, &defaults)?;
    let tuner = TunerConfig {
        loosen_fp_rate: resolve_f64("loosen_fp_rate", file.loosen_fp_rate, &defaults)?,
        tighten_fp_rate: resolve_f64("tighten_fp_rate", file.tighten_fp_rate, &defaults)?,
        tighten_min_detections: resolve_u64(
            "tighten_min_detections",
            file.tighten_min_detections,
            &defaults,
        )?,
        loosen_factor: resolve_f64("loosen_factor", file.loosen_factor, &defaults)?,
        tighten_factor: resolve_f64("tighten_factor", file.tighten_factor, &defaults)?,
    };
    let retention_days = resolve_u64(
        "override_retention_days",
        file.override_retention_days,
        &defaults,
    )?;
    let retention_max = resolve_u64(
        "override_retention_max",
        file.override_retention_max,
        &defaults,
    )?;
    let history_max = resolve_u64("tuning_history_max", file.tuning_history_max, &defaults)?;

    if lock_timeout_ms == 0 {
        return Err(invalid("lock_timeout_ms", "must be greater than zero"));
    }
    if tune_interval == 0 {
        return Err(invalid("tune_interval", "must be greater than zero"));
    }
    validate_tuner(&tuner)?;

    let domain = file.domain.unwrap_or_else(|| DOMAIN_DEFAULT.to_string());
    validate_domain(&domain)?;

    let config = GatekeeperConfig {
        state_dir: file
            .state_dir
            .unwrap_or_else(|| PathBuf::from(STATE_DIR_DEFAULT)),
        domain,
        lock_timeout: Duration::from_millis(lock_timeout_ms),
        tune_interval,
        tuner,
        retention: RetentionPolicy {
            max_age: days(retention_days),
            max_count: retention_max as usize,
        },
        tuning_history_max: history_max as usize,
        rules: file.rules,
    };
    // Rule overrides are fatal at load time, not at first use.
    config.build_catalog()?;
    Ok(config)
}

pub fn resolve_u64(
    key: &'static str,
    provided: Option<u64>,
    defaults: &GatekeeperDefaults,
) -> Result<u64, ConfigError> {
    if let Some(value) = provided {
        return Ok(value);
    }
    match defaults.lookup(key) {
        Some(DefaultValue::U64(value)) => Ok(value),
        Some(DefaultValue::F64(_)) => Err(ConfigError::TypeMismatch {
            key,
            expected: ParamKind::U64,
        }),
        None => Err(ConfigError::MissingDefault { key }),
    }
}

pub fn resolve_f64(
    key: &'static str,
    provided: Option<f64>,
    defaults: &GatekeeperDefaults,
) -> Result<f64, ConfigError> {
    if let Some(value) = provided {
        return Ok(value);
    }
    match defaults.lookup(key) {
        Some(DefaultValue::F64(value)) => Ok(value),
        Some(DefaultValue::U64(_)) => Err(ConfigError::TypeMismatch {
            key,
            expected: ParamKind::F64,
        }),
        None => Err(ConfigError::MissingDefault { key }),
    }
}

fn validate_tuner(tuner: &TunerConfig) -> Result<(), ConfigError> {
    let unit = 0.0..=1.0;
    if !unit.contains(&tuner.loosen_fp_rate) {
        return Err(invalid("loosen_fp_rate", "must lie in [0, 1]"));
    }
    if !unit.contains(&tuner.tighten_fp_rate) {
        return Err(invalid("tighten_fp_rate", "must lie in [0, 1]"));
    }
    if tuner.tighten_fp_rate >= tuner.loosen_fp_rate {
        return Err(invalid(
            "tighten_fp_rate",
            "must be below loosen_fp_rate or the tuner oscillates",
        ));
    }
    if !(tuner.loosen_factor.is_finite() && tuner.loosen_factor > 1.0) {
        return Err(invalid("loosen_factor", "must be greater than 1"));
    }
    if !(tuner.tighten_factor > 0.0 && tuner.tighten_factor < 1.0) {
        return Err(invalid("tighten_factor", "must lie in (0, 1)"));
    }
    Ok(())
}

fn validate_domain(domain: &str) -> Result<(), ConfigError> {
    let valid = !domain.is_empty()
        && domain
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidDomain {
            domain: domain.to_string(),
        })
    }
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

fn days(n: u64) -> Duration {
    Duration::from_secs(n.saturating_mul(86_400))
}
