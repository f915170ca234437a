//! The result tree and the values stored in it.
pub mod metrics;
pub mod node;
pub mod regions;
pub mod units;

pub use metrics::{AggregateType, Metric, MetricType, MetricValue, Stats};
pub use node::{DeviceType, NodeType, RawData, ResultNode};
pub use regions::{LocalRegions, Region};
pub use units::{format_value, Magnitude, MetricMetadata, NumericKind, Unit};
