//! A scripted backend for simulations and tests.
use super::{Backend, SensorDescriptor, SensorHandle};
use crate::clock::now;
use crate::data::{DeviceType, Magnitude, MetricMetadata, NumericKind, Unit};
use crate::transaction::TransactionId;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Produces the reading for the n-th read, given when the sensor was opened
type MockSource = Arc<dyn Fn(usize, Instant) -> Result<f64> + Send + Sync>;

#[derive(Clone)]
pub struct MockSensor {
    pub id: String,
    pub device_type: DeviceType,
    pub data_type: MetricMetadata,
    source: MockSource,
}
impl MockSensor {
    pub fn new(
        id: &str,
        device_type: DeviceType,
        data_type: MetricMetadata,
        source: impl Fn(usize, Instant) -> Result<f64> + Send + Sync + 'static,
    ) -> Self {
        MockSensor {
            id: id.to_string(),
            device_type,
            data_type,
            source: Arc::new(source),
        }
    }

    /// Always reports `watts`.
    pub fn constant(id: &str, device_type: DeviceType, watts: f64) -> Self {
        let md = MetricMetadata::new(Unit::Watt, Magnitude::One, NumericKind::F32, 0.0, 10_000.0, -1.0);
        Self::new(id, device_type, md, move |_, _| Ok(watts))
    }

    /// A µJ energy counter fed by a constant `watts` draw since the sensor was opened.
    /// Wraps at `max_uj`.
    pub fn energy_counter(id: &str, device_type: DeviceType, watts: f64, max_uj: f64) -> Self {
        let md = MetricMetadata::new(Unit::Joule, Magnitude::Micro, NumericKind::U64, 0.0, max_uj, max_uj);
        Self::new(id, device_type, md, move |_, opened| {
            let uj = (opened.elapsed().as_secs_f64() * watts * 1e6).floor();
            Ok(uj % max_uj)
        })
    }

    /// Replays `values` one per read, `None` is a failed read.
    /// Reads past the end repeat the last entry.
    pub fn scripted(id: &str, device_type: DeviceType, data_type: MetricMetadata, values: Vec<Option<f64>>) -> Self {
        Self::new(id, device_type, data_type, move |n, _| {
            let idx = n.min(values.len().saturating_sub(1));
            match values.get(idx).copied().flatten() {
                Some(v) => Ok(v),
                None => anyhow::bail!("scripted read {} failed", n),
            }
        })
    }
}

/// Decrements the open-handle count when the handle that owns it is dropped
struct OpenGuard(Arc<AtomicUsize>);
impl Drop for OpenGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct MockBackend {
    id: String,
    sensors: Vec<MockSensor>,
    fail_open: bool,
    open_handles: Arc<AtomicUsize>,
    closed: AtomicUsize,
}
impl MockBackend {
    pub fn new(id: &str) -> Self {
        MockBackend {
            id: id.to_string(),
            sensors: vec![],
            fail_open: false,
            open_handles: Arc::new(AtomicUsize::new(0)),
            closed: AtomicUsize::new(0),
        }
    }

    pub fn with_sensor(mut self, sensor: MockSensor) -> Self {
        self.sensors.push(sensor);
        self
    }

    /// Advertise sensors but refuse to open them.
    pub fn failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Number of handles currently open.
    pub fn open_handles(&self) -> usize {
        self.open_handles.load(Ordering::SeqCst)
    }

    /// Number of times [Backend::close] was called.
    pub fn times_closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}
impl Backend for MockBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn available_sensors(&self) -> BTreeMap<String, SensorDescriptor> {
        self.sensors
            .iter()
            .map(|s| {
                (
                    s.id.clone(),
                    SensorDescriptor {
                        device_type: s.device_type,
                        unit: s.data_type.unit,
                    },
                )
            })
            .collect()
    }

    fn get_sensors(&self, ids: &BTreeSet<String>, tid: &TransactionId) -> Result<Vec<SensorHandle>> {
        if self.fail_open {
            bail_error!(tid=tid, backend=%self.id, "Mock backend refuses to open sensors");
        }
        let mut out = vec![];
        for id in ids {
            let sensor = match self.sensors.iter().find(|s| &s.id == id) {
                Some(s) => s.clone(),
                None => bail_error!(tid=tid, sensor=%id, "Unknown mock sensor"),
            };
            self.open_handles.fetch_add(1, Ordering::SeqCst);
            let guard = OpenGuard(self.open_handles.clone());
            let opened = now();
            let mut reads = 0;
            let source = sensor.source.clone();
            let reader = Box::new(move || {
                let _held = &guard;
                let r = source(reads, opened);
                reads += 1;
                r
            });
            out.push(SensorHandle::new(id, &self.id, sensor.device_type, sensor.data_type, reader));
        }
        Ok(out)
    }

    fn metadata(&self) -> BTreeMap<String, serde_json::Value> {
        BTreeMap::from([("source".to_string(), serde_json::Value::from("mock"))])
    }

    fn close(&self, _tid: &TransactionId) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TEST_TID;

    #[test]
    fn handles_released_on_drop() {
        let backend = MockBackend::new("mock")
            .with_sensor(MockSensor::constant("a", DeviceType::Cpu, 5.0))
            .with_sensor(MockSensor::constant("b", DeviceType::Gpu, 7.0));
        let ids = BTreeSet::from(["a".to_string(), "b".to_string()]);
        let mut handles = backend.get_sensors(&ids, &TEST_TID).unwrap();
        assert_eq!(backend.open_handles(), 2);
        assert_eq!(handles[1].read().unwrap(), 7.0);
        drop(handles);
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn scripted_replays_and_fails() {
        let md = MetricMetadata::derived(Unit::Percent, Magnitude::One);
        let backend =
            MockBackend::new("mock").with_sensor(MockSensor::scripted("u", DeviceType::Cpu, md, vec![Some(1.0), None, Some(3.0)]));
        let ids = BTreeSet::from(["u".to_string()]);
        let mut h = backend.get_sensors(&ids, &TEST_TID).unwrap().remove(0);
        assert_eq!(h.read().unwrap(), 1.0);
        assert!(h.read().is_err());
        assert_eq!(h.read().unwrap(), 3.0);
        assert_eq!(h.read().unwrap(), 3.0);
    }

    #[test]
    fn unknown_sensor_errors() {
        let backend = MockBackend::new("mock");
        let ids = BTreeSet::from(["nope".to_string()]);
        assert!(backend.get_sensors(&ids, &TEST_TID).is_err());
    }
}
