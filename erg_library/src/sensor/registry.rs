use super::{powercap::PowercapBackend, procfs::ProcfsBackend, Backend, SensorHandle, VisibleSensors};
use crate::coordination::SensorAssignment;
use crate::transaction::TransactionId;
use anyhow::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Builds one backend, failing when its hardware or driver is missing
pub type BackendConstructor = Box<dyn FnOnce(&TransactionId) -> Result<Arc<dyn Backend>> + Send>;

/// Outcome of trying to construct a backend
pub enum BackendStatus {
    Available(Arc<dyn Backend>),
    Unavailable { id: String, reason: String },
}

/// The backends tried on every machine, in order.
pub fn default_constructors() -> Vec<(&'static str, BackendConstructor)> {
    let powercap: BackendConstructor =
        Box::new(|tid: &TransactionId| -> Result<Arc<dyn Backend>> { Ok(Arc::new(PowercapBackend::new(tid)?)) });
    let procfs: BackendConstructor =
        Box::new(|tid: &TransactionId| -> Result<Arc<dyn Backend>> { Ok(Arc::new(ProcfsBackend::new(tid)?)) });
    vec![(PowercapBackend::ID, powercap), (ProcfsBackend::ID, procfs)]
}

/// The set of backends this rank can use, plus the reasons the others could not be used
pub struct BackendRegistry {
    statuses: Vec<BackendStatus>,
}
impl BackendRegistry {
    /// Try every constructor in order. A failing constructor marks its backend unavailable and is not an error.
    pub fn from_constructors(constructors: Vec<(&str, BackendConstructor)>, tid: &TransactionId) -> Self {
        let mut statuses = vec![];
        for (id, ctor) in constructors {
            match ctor(tid) {
                Ok(b) => {
                    info!(tid=tid, backend=id, "Backend available");
                    statuses.push(BackendStatus::Available(b));
                },
                Err(e) => {
                    warn!(tid=tid, backend=id, reason=%e, "Backend unavailable");
                    statuses.push(BackendStatus::Unavailable {
                        id: id.to_string(),
                        reason: e.to_string(),
                    });
                },
            }
        }
        BackendRegistry { statuses }
    }

    pub fn from_backends(backends: Vec<Arc<dyn Backend>>) -> Self {
        BackendRegistry {
            statuses: backends.into_iter().map(BackendStatus::Available).collect(),
        }
    }

    pub fn boxed(constructors: Vec<(&str, BackendConstructor)>, tid: &TransactionId) -> Arc<Self> {
        Arc::new(Self::from_constructors(constructors, tid))
    }

    pub fn available(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.statuses.iter().filter_map(|s| match s {
            BackendStatus::Available(b) => Some(b),
            BackendStatus::Unavailable { .. } => None,
        })
    }

    /// `(backend id, reason)` for every backend that failed to construct.
    pub fn unavailable(&self) -> Vec<(&str, &str)> {
        self.statuses
            .iter()
            .filter_map(|s| match s {
                BackendStatus::Available(_) => None,
                BackendStatus::Unavailable { id, reason } => Some((id.as_str(), reason.as_str())),
            })
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&Arc<dyn Backend>> {
        self.available().find(|b| b.id() == id)
    }

    /// Every sensor readable from this rank, by backend.
    pub fn visible_sensors(&self) -> VisibleSensors {
        self.available()
            .map(|b| (b.id().to_string(), b.available_sensors()))
            .collect()
    }

    /// Open the sensors in `assignment` that this rank can reach.
    /// Sensors merged in from other ranks on the host may be missing here, those are skipped with a warning.
    /// Fails only if nothing could be opened.
    pub fn resolve(&self, assignment: &SensorAssignment, tid: &TransactionId) -> Result<Vec<SensorHandle>> {
        let mut by_backend: BTreeMap<&str, BTreeSet<String>> = BTreeMap::new();
        for (sensor, assigned) in assignment {
            by_backend.entry(assigned.backend.as_str()).or_default().insert(sensor.clone());
        }
        let mut handles = vec![];
        for (backend_id, ids) in by_backend {
            let backend = match self.get(backend_id) {
                Some(b) => b,
                None => {
                    warn!(tid=tid, backend=backend_id, sensors=?ids, "Assigned backend is not available on this rank, skipping");
                    continue;
                },
            };
            let visible = backend.available_sensors();
            let (reachable, missing): (BTreeSet<String>, BTreeSet<String>) =
                ids.into_iter().partition(|id| visible.contains_key(id));
            if !missing.is_empty() {
                warn!(tid=tid, backend=backend_id, sensors=?missing, "Assigned sensors are not visible on this rank, skipping");
            }
            if reachable.is_empty() {
                continue;
            }
            match backend.get_sensors(&reachable, tid) {
                Ok(opened) => {
                    if opened.len() != reachable.len() {
                        warn!(tid=tid, backend=backend_id, requested=reachable.len(), opened=opened.len(), "Backend did not open every requested sensor");
                    }
                    debug!(tid=tid, backend=backend_id, sensors=opened.len(), "Resolved sensors");
                    handles.extend(opened);
                },
                Err(e) => warn!(tid=tid, backend=backend_id, error=%e, "Backend could not open its sensors, skipping"),
            }
        }
        if handles.is_empty() && !assignment.is_empty() {
            bail_error!(tid=tid, assigned=assignment.len(), "None of the assigned sensors could be opened");
        }
        Ok(handles)
    }

    /// Backend details for the host node, keyed by backend id.
    pub fn metadata(&self) -> BTreeMap<String, serde_json::Value> {
        self.available()
            .map(|b| {
                let md: serde_json::Map<String, serde_json::Value> = b.metadata().into_iter().collect();
                (b.id().to_string(), serde_json::Value::Object(md))
            })
            .collect()
    }

    pub fn close(&self, tid: &TransactionId) {
        for b in self.available() {
            debug!(tid=tid, backend=b.id(), "Closing backend");
            b.close(tid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::AssignedSensor;
    use crate::data::{DeviceType, Unit};
    use crate::sensor::mock::{MockBackend, MockSensor};
    use crate::transaction::TEST_TID;

    fn ctor_ok(id: &'static str) -> (&'static str, BackendConstructor) {
        (
            id,
            Box::new(move |_tid: &TransactionId| -> Result<Arc<dyn Backend>> {
                Ok(Arc::new(
                    MockBackend::new(id).with_sensor(MockSensor::constant("s0", DeviceType::Cpu, 10.0)),
                ))
            }),
        )
    }

    #[test]
    fn failing_constructor_is_tagged_not_fatal() {
        let failing: (&str, BackendConstructor) = ("broken", Box::new(|_tid: &TransactionId| -> Result<Arc<dyn Backend>> { anyhow::bail!("no driver") }));
        let reg = BackendRegistry::from_constructors(vec![ctor_ok("a"), failing, ctor_ok("b")], &TEST_TID);
        let ids: Vec<&str> = reg.available().map(|b| b.id()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(reg.unavailable(), vec![("broken", "no driver")]);
        assert_eq!(reg.visible_sensors().len(), 2);
    }

    fn assigned(backend: &str) -> AssignedSensor {
        AssignedSensor {
            backend: backend.to_string(),
            device_type: DeviceType::Cpu,
            unit: Unit::Watt,
        }
    }

    #[test]
    fn resolve_skips_what_this_rank_cannot_reach() {
        let reg = BackendRegistry::from_constructors(vec![ctor_ok("a")], &TEST_TID);
        let assignment = SensorAssignment::from([
            ("s0".to_string(), assigned("a")),
            ("core-7".to_string(), assigned("a")),
            ("g".to_string(), assigned("missing")),
        ]);
        let handles = reg.resolve(&assignment, &TEST_TID).unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].id, "s0");
        assert_eq!(handles[0].backend, "a");
    }

    #[test]
    fn resolve_fails_when_nothing_opens() {
        let reg = BackendRegistry::from_constructors(vec![ctor_ok("a")], &TEST_TID);
        let assignment = SensorAssignment::from([("g".to_string(), assigned("missing"))]);
        assert!(reg.resolve(&assignment, &TEST_TID).is_err());

        let refusing = MockBackend::new("r")
            .with_sensor(MockSensor::constant("p", DeviceType::Cpu, 1.0))
            .failing_open();
        let reg = BackendRegistry::from_backends(vec![Arc::new(refusing) as Arc<dyn Backend>]);
        let assignment = SensorAssignment::from([("p".to_string(), assigned("r"))]);
        assert!(reg.resolve(&assignment, &TEST_TID).is_err());
    }

    #[test]
    fn empty_assignment_resolves_to_nothing() {
        let reg = BackendRegistry::from_constructors(vec![ctor_ok("a")], &TEST_TID);
        assert!(reg.resolve(&SensorAssignment::new(), &TEST_TID).unwrap().is_empty());
    }
}
