use crate::logging::LoggingConfig;
use crate::transaction::TransactionId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Environment variables starting with this override configuration values.
/// e.g. `ERG__MONITOR__SAMPLING_PERIOD_S=0.5`
pub const ERG_ENV_PREFIX: &str = "ERG";
/// Longest sampling period or timeout accepted, in seconds.
pub const MAX_WAIT_S: f64 = 86_400.0;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Configuration {
    pub monitor: MonitorConfig,
    pub benchmarking: BenchmarkingConfig,
    pub post_processing: PostProcessingConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
}
pub type ErgConfig = Arc<Configuration>;

#[derive(Debug, Deserialize, Serialize, Clone)]
/// How sensors are chosen and sampled
pub struct MonitorConfig {
    /// Seconds between two samples of the same sensor.
    pub sampling_period_s: f64,
    /// Only use backends whose id matches one of these patterns.
    /// Patterns are regular expressions matched at the start of the id.
    #[serde(default)]
    pub include_backends: Option<Vec<String>>,
    /// Never use backends whose id matches one of these patterns.
    #[serde(default)]
    pub exclude_backends: Option<Vec<String>>,
    /// Only sample sensors whose id matches one of these patterns.
    #[serde(default)]
    pub include_sensors: Option<Vec<String>>,
    /// Never sample sensors whose id matches one of these patterns.
    #[serde(default)]
    pub exclude_sensors: Option<Vec<String>>,
    /// How long to wait for the sampling worker to resolve its sensors.
    pub ready_timeout_s: f64,
    /// How long to wait for the sampling worker to hand back its data after stopping.
    pub join_timeout_s: f64,
}
impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            sampling_period_s: 1.0,
            include_backends: None,
            exclude_backends: None,
            include_sensors: None,
            exclude_sensors: None,
            ready_timeout_s: 30.0,
            join_timeout_s: 30.0,
        }
    }
}
impl MonitorConfig {
    pub fn sampling_period(&self) -> Duration {
        Duration::from_secs_f64(self.sampling_period_s)
    }
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.ready_timeout_s)
    }
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.join_timeout_s)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BenchmarkingConfig {
    /// Number of recorded executions of the application.
    pub rounds: u32,
    /// Unrecorded executions run before the recorded ones.
    pub warmup_rounds: u32,
}
impl Default for BenchmarkingConfig {
    fn default() -> Self {
        BenchmarkingConfig {
            rounds: 1,
            warmup_rounds: 0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
/// Multipliers applied when deriving totals at the run level
pub struct PostProcessingConfig {
    /// Power usage effectiveness of the data center, scales measured energy.
    pub pue: f64,
    /// kg of CO2 equivalent emitted per kWh.
    pub emissions_factor: f64,
    /// Currency cents per kWh.
    pub price_factor: f64,
    /// Constant Watts added to every host, for components no sensor covers.
    pub power_overhead: f64,
}
impl Default for PostProcessingConfig {
    fn default() -> Self {
        PostProcessingConfig {
            pue: 1.0,
            emissions_factor: 0.4178,
            price_factor: 32.51,
            power_overhead: 0.0,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutputConfig {
    /// Name results are stored under, defaults to the application name.
    #[serde(default)]
    pub app_name: Option<String>,
    /// Id of the multi-run node, defaults to the execution date.
    #[serde(default)]
    pub run_id: Option<String>,
    /// Directory results are stored in.
    pub data_out: String,
}
impl Default for OutputConfig {
    fn default() -> Self {
        OutputConfig {
            app_name: None,
            run_id: None,
            data_out: "./erg_results".to_string(),
        }
    }
}

impl Configuration {
    pub fn new(config_fpath: Option<&str>, overrides: Option<Vec<(String, String)>>) -> anyhow::Result<Self> {
        crate::load_config_default!("erg_library/src/erg.json", config_fpath, overrides, ERG_ENV_PREFIX)
    }

    pub fn boxed(
        config_fpath: Option<&str>,
        overrides: Option<Vec<(String, String)>>,
        tid: &TransactionId,
    ) -> anyhow::Result<ErgConfig> {
        let mut cfg = Configuration::new(config_fpath, overrides)?;
        cfg.sanitize(tid);
        Ok(Arc::new(cfg))
    }

    /// Reset out-of-range values to their defaults, warning about each one.
    pub fn sanitize(&mut self, tid: &TransactionId) {
        let pp_default = PostProcessingConfig::default();
        let pp = &mut self.post_processing;
        if pp.pue < 1.0 {
            warn!(tid=tid, pue=pp.pue, default=pp_default.pue, "PUE must be at least 1, resetting to default");
            pp.pue = pp_default.pue;
        }
        if pp.emissions_factor < 0.0 {
            warn!(tid=tid, emissions_factor=pp.emissions_factor, "Emissions factor is negative, resetting to default");
            pp.emissions_factor = pp_default.emissions_factor;
        }
        if pp.price_factor < 0.0 {
            warn!(tid=tid, price_factor=pp.price_factor, "Price factor is negative, resetting to default");
            pp.price_factor = pp_default.price_factor;
        }
        if pp.power_overhead < 0.0 {
            warn!(tid=tid, power_overhead=pp.power_overhead, "Power overhead is negative, resetting to default");
            pp.power_overhead = pp_default.power_overhead;
        }

        let mon_default = MonitorConfig::default();
        let mon = &mut self.monitor;
        if !mon.sampling_period_s.is_finite() || !(0.001..=MAX_WAIT_S).contains(&mon.sampling_period_s) {
            warn!(tid=tid, sampling_period_s=mon.sampling_period_s, "Sampling period out of range, resetting to default");
            mon.sampling_period_s = mon_default.sampling_period_s;
        }
        if !mon.ready_timeout_s.is_finite() || mon.ready_timeout_s <= 0.0 || mon.ready_timeout_s > MAX_WAIT_S {
            warn!(tid=tid, ready_timeout_s=mon.ready_timeout_s, "Ready timeout out of range, resetting to default");
            mon.ready_timeout_s = mon_default.ready_timeout_s;
        }
        if !mon.join_timeout_s.is_finite() || mon.join_timeout_s <= 0.0 || mon.join_timeout_s > MAX_WAIT_S {
            warn!(tid=tid, join_timeout_s=mon.join_timeout_s, "Join timeout out of range, resetting to default");
            mon.join_timeout_s = mon_default.join_timeout_s;
        }
        if self.benchmarking.rounds < 1 {
            warn!(tid=tid, "At least one round is required, resetting to 1");
            self.benchmarking.rounds = 1;
        }
    }

    /// Flattened `section.key` view of the settings that affect results.
    /// Stored as metadata on every multi-run node.
    pub fn flatten(&self) -> BTreeMap<String, serde_json::Value> {
        let mut out = BTreeMap::new();
        let sections = [
            ("monitor", serde_json::to_value(&self.monitor)),
            ("benchmarking", serde_json::to_value(&self.benchmarking)),
            ("post_processing", serde_json::to_value(&self.post_processing)),
            ("output", serde_json::to_value(&self.output)),
        ];
        for (name, section) in sections {
            if let Ok(serde_json::Value::Object(map)) = section {
                for (k, v) in map {
                    if !v.is_null() {
                        out.insert(format!("{}.{}", name, k), v);
                    }
                }
            }
        }
        out
    }
}
