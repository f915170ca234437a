use super::metrics::{MetricType, MetricValue};
use super::regions::Region;
use super::units::MetricMetadata;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Cpu,
    Gpu,
    Ram,
    Disk,
    Net,
    Other,
    /// Whole-machine sensors, attached directly to the host node
    Node,
    Socket,
}
impl DeviceType {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceType::Cpu => "cpu",
            DeviceType::Gpu => "gpu",
            DeviceType::Ram => "ram",
            DeviceType::Disk => "disk",
            DeviceType::Net => "net",
            DeviceType::Other => "other",
            DeviceType::Node => "node",
            DeviceType::Socket => "socket",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
/// Levels of the result tree, outermost first
pub enum NodeType {
    App,
    MultiRun,
    Run,
    Host,
    DeviceGroup,
    Sensor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Samples of one sensor over one round
pub struct RawData {
    /// Absolute unix time of the first sample, in nanoseconds.
    pub start_ns: u64,
    /// Seconds since `start_ns`, strictly increasing.
    pub timesteps: Vec<f64>,
    pub values: Vec<f64>,
    pub t_md: MetricMetadata,
    pub v_md: MetricMetadata,
}
impl RawData {
    /// Build from absolute timestamps (unix nanoseconds) and matching readings.
    pub fn from_samples(timestamps_ns: &[u64], values: Vec<f64>, v_md: MetricMetadata) -> Result<Self> {
        if timestamps_ns.len() != values.len() {
            anyhow::bail!(
                "{} timestamps but {} values in raw data",
                timestamps_ns.len(),
                values.len()
            );
        }
        let start_ns = match timestamps_ns.first() {
            Some(s) => *s,
            None => anyhow::bail!("raw data needs at least one sample"),
        };
        Ok(RawData {
            start_ns,
            timesteps: timestamps_ns
                .iter()
                .map(|t| t.saturating_sub(start_ns) as f64 / 1e9)
                .collect(),
            values,
            t_md: MetricMetadata::seconds(),
            v_md,
        })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// One node of the result hierarchy: App → MultiRun → Run → Host → DeviceGroup → Sensor
pub struct ResultNode {
    pub id: String,
    pub kind: NodeType,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<DeviceType>,
    /// Insertion ordered, ids unique among siblings
    #[serde(default)]
    children: Vec<ResultNode>,
    #[serde(default)]
    pub metrics: BTreeMap<MetricType, MetricValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<RawData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regions: Option<BTreeMap<String, Region>>,
    /// Whether `metrics` have been derived. Metrics of an unprocessed node must not be trusted.
    #[serde(default)]
    pub processed: bool,
}
impl ResultNode {
    pub fn new(id: impl Into<String>, kind: NodeType) -> Self {
        ResultNode {
            id: id.into(),
            kind,
            metadata: BTreeMap::new(),
            device_type: None,
            children: vec![],
            metrics: BTreeMap::new(),
            raw_data: None,
            regions: None,
            processed: false,
        }
    }

    pub fn with_device(mut self, device_type: DeviceType) -> Self {
        self.device_type = Some(device_type);
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata.extend(metadata);
        self
    }

    pub fn set_meta(&mut self, key: &str, value: impl Into<serde_json::Value>) {
        self.metadata.insert(key.to_string(), value.into());
    }

    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }

    /// Append `child`. Fails if a sibling already uses its id.
    pub fn add_child(&mut self, child: ResultNode) -> Result<()> {
        if self.child(&child.id).is_some() {
            anyhow::bail!("node '{}' already has a child '{}'", self.id, child.id);
        }
        self.children.push(child);
        Ok(())
    }

    pub fn child(&self, id: &str) -> Option<&ResultNode> {
        self.children.iter().find(|c| c.id == id)
    }
    pub fn child_mut(&mut self, id: &str) -> Option<&mut ResultNode> {
        self.children.iter_mut().find(|c| c.id == id)
    }
    pub fn children(&self) -> &[ResultNode] {
        &self.children
    }
    pub fn children_mut(&mut self) -> &mut [ResultNode] {
        &mut self.children
    }
    pub fn child_ids(&self) -> Vec<&str> {
        self.children.iter().map(|c| c.id.as_str()).collect()
    }

    pub fn metric(&self, kind: MetricType) -> Option<&MetricValue> {
        self.metrics.get(&kind)
    }
    /// Shortcut for the value of a metric, or the mean of stats.
    pub fn metric_value(&self, kind: MetricType) -> Option<f64> {
        self.metrics.get(&kind).map(|m| m.value())
    }

    /// Visit this node and every descendant, parents before children.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a ResultNode)) {
        visit(self);
        for c in &self.children {
            c.walk(visit);
        }
    }
}
