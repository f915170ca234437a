//! Sensors and the backends that provide them.
pub mod mock;
pub mod powercap;
pub mod procfs;
pub mod registry;

use crate::data::{DeviceType, MetricMetadata, Unit};
use crate::transaction::TransactionId;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// backend id → sensor id → descriptor
pub type VisibleSensors = BTreeMap<String, BTreeMap<String, SensorDescriptor>>;

/// Reads one value from a sensor, may block briefly
pub type SensorReader = Box<dyn FnMut() -> Result<f64> + Send>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
/// What a rank advertises about a sensor it can see
pub struct SensorDescriptor {
    pub device_type: DeviceType,
    pub unit: Unit,
}

/// A live, readable sensor.
/// Owns whatever the read needs (e.g. an open file), released on drop.
pub struct SensorHandle {
    pub id: String,
    pub backend: String,
    pub device_type: DeviceType,
    pub metadata: BTreeMap<String, serde_json::Value>,
    pub data_type: MetricMetadata,
    reader: SensorReader,
}
impl SensorHandle {
    pub fn new(
        id: impl Into<String>,
        backend: impl Into<String>,
        device_type: DeviceType,
        data_type: MetricMetadata,
        reader: SensorReader,
    ) -> Self {
        SensorHandle {
            id: id.into(),
            backend: backend.into(),
            device_type,
            metadata: BTreeMap::new(),
            data_type,
            reader,
        }
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, serde_json::Value>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn read(&mut self) -> Result<f64> {
        (self.reader)()
    }

    pub fn descriptor(&self) -> SensorDescriptor {
        SensorDescriptor {
            device_type: self.device_type,
            unit: self.data_type.unit,
        }
    }
}
impl std::fmt::Debug for SensorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorHandle")
            .field("id", &self.id)
            .field("backend", &self.backend)
            .field("device_type", &self.device_type)
            .field("data_type", &self.data_type)
            .finish()
    }
}

/// A family of sensors, e.g. every RAPL domain of a machine
pub trait Backend: Send + Sync {
    /// Stable identifier, used by filters and assignments.
    fn id(&self) -> &str;
    /// Human readable name.
    fn name(&self) -> &str {
        self.id()
    }
    /// Every sensor this backend can read on this machine.
    fn available_sensors(&self) -> BTreeMap<String, SensorDescriptor>;
    /// Open the requested sensors for reading.
    /// Unknown ids are an error.
    fn get_sensors(&self, ids: &BTreeSet<String>, tid: &TransactionId) -> Result<Vec<SensorHandle>>;
    /// Details reported on host nodes.
    fn metadata(&self) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::new()
    }
    /// Release backend-wide resources.
    fn close(&self, _tid: &TransactionId) {}
}
