use super::units::{Magnitude, MetricMetadata, Unit};
use crate::errors::ProcessingError;
use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Runtime,
    Power,
    CpuPower,
    GpuPower,
    DramPower,
    OtherPower,
    CpuUtil,
    GpuUtil,
    OtherUtil,
    DramMem,
    GpuMem,
    OtherMem,
    NetRead,
    NetWrite,
    DiskRead,
    DiskWrite,
    Energy,
    CpuEnergy,
    GpuEnergy,
    DramEnergy,
    OtherEnergy,
    NRuns,
    Money,
    Co2,
}
impl MetricType {
    pub fn name(&self) -> &'static str {
        match self {
            MetricType::Runtime => "runtime",
            MetricType::Power => "power",
            MetricType::CpuPower => "cpu_power",
            MetricType::GpuPower => "gpu_power",
            MetricType::DramPower => "dram_power",
            MetricType::OtherPower => "other_power",
            MetricType::CpuUtil => "cpu_util",
            MetricType::GpuUtil => "gpu_util",
            MetricType::OtherUtil => "other_util",
            MetricType::DramMem => "dram_mem",
            MetricType::GpuMem => "gpu_mem",
            MetricType::OtherMem => "other_mem",
            MetricType::NetRead => "net_read",
            MetricType::NetWrite => "net_write",
            MetricType::DiskRead => "disk_read",
            MetricType::DiskWrite => "disk_write",
            MetricType::Energy => "energy",
            MetricType::CpuEnergy => "cpu_energy",
            MetricType::GpuEnergy => "gpu_energy",
            MetricType::DramEnergy => "dram_energy",
            MetricType::OtherEnergy => "other_energy",
            MetricType::NRuns => "n_runs",
            MetricType::Money => "money",
            MetricType::Co2 => "co2",
        }
    }
}
impl std::fmt::Display for MetricType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// How same-kind metrics of sibling nodes combine into their parent's metric
pub enum AggregateType {
    Sum,
    Mean,
    Max,
    Min,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single value reduced from raw data or from child metrics
pub struct Metric {
    pub kind: MetricType,
    pub value: f64,
    pub metadata: MetricMetadata,
    pub aggregation: AggregateType,
}
impl Metric {
    pub fn new(kind: MetricType, value: f64, metadata: MetricMetadata, aggregation: AggregateType) -> Self {
        Metric {
            kind,
            value,
            metadata,
            aggregation,
        }
    }

    /// A derived metric in `unit`, at [Magnitude::One].
    pub fn derived(kind: MetricType, value: f64, unit: Unit, aggregation: AggregateType) -> Self {
        Metric::new(kind, value, MetricMetadata::derived(unit, Magnitude::One), aggregation)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Summary of same-kind metrics collected over multiple rounds
pub struct Stats {
    pub kind: MetricType,
    pub metadata: MetricMetadata,
    pub sum: f64,
    pub mean: f64,
    /// population standard deviation
    pub std: f64,
    pub max: f64,
    pub min: f64,
}
impl Stats {
    /// Summarize `metrics`, which must all be the same [MetricType].
    pub fn from_metrics(metrics: &[&Metric]) -> Result<Self> {
        let first = match metrics.first() {
            Some(m) => m,
            None => {
                return Err(ProcessingError {
                    message: "cannot build stats from zero metrics".to_string(),
                }
                .into())
            },
        };
        if let Some(bad) = metrics.iter().find(|m| m.kind != first.kind) {
            return Err(ProcessingError {
                message: format!("metric kinds do not match: '{}' and '{}'", first.kind, bad.kind),
            }
            .into());
        }
        Ok(Self::from_values(
            first.kind,
            first.metadata,
            metrics.iter().map(|m| m.value),
        ))
    }

    pub fn from_values(kind: MetricType, metadata: MetricMetadata, values: impl Iterator<Item = f64>) -> Self {
        let values: Vec<f64> = values.collect();
        let n = values.len().max(1) as f64;
        let sum: f64 = values.iter().sum();
        let mean = sum / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        Stats {
            kind,
            metadata,
            sum,
            mean,
            std: var.sqrt(),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
/// A node's metric: a [Metric] at run level and below, [Stats] above
pub enum MetricValue {
    Metric(Metric),
    Stats(Stats),
}
impl MetricValue {
    pub fn kind(&self) -> MetricType {
        match self {
            MetricValue::Metric(m) => m.kind,
            MetricValue::Stats(s) => s.kind,
        }
    }
    /// The value of a metric, or the mean of a stats summary.
    pub fn value(&self) -> f64 {
        match self {
            MetricValue::Metric(m) => m.value,
            MetricValue::Stats(s) => s.mean,
        }
    }
    pub fn metadata(&self) -> &MetricMetadata {
        match self {
            MetricValue::Metric(m) => &m.metadata,
            MetricValue::Stats(s) => &s.metadata,
        }
    }
    pub fn as_metric(&self) -> Option<&Metric> {
        match self {
            MetricValue::Metric(m) => Some(m),
            MetricValue::Stats(_) => None,
        }
    }
    pub fn as_stats(&self) -> Option<&Stats> {
        match self {
            MetricValue::Metric(_) => None,
            MetricValue::Stats(s) => Some(s),
        }
    }
}
impl From<Metric> for MetricValue {
    fn from(m: Metric) -> Self {
        MetricValue::Metric(m)
    }
}
impl From<Stats> for MetricValue {
    fn from(s: Stats) -> Self {
        MetricValue::Stats(s)
    }
}
