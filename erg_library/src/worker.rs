//! The sampling worker: reads a rank's assigned sensors at a fixed period while the application runs.
//!
//! The owner drives it through three events.
//! `ready` is raised by the worker once its sensors are open, `start` and `stop` by the owner.
//! The processed host node comes back through a one-shot channel.
use crate::clock::{now, unix_nanos};
use crate::coordination::SensorAssignment;
use crate::data::{DeviceType, NodeType, RawData, ResultNode};
use crate::errors::SubprocessError;
use crate::monitor_config::PostProcessingConfig;
use crate::processing::{process_data_node, process_sensor_data};
use crate::sensor::registry::BackendRegistry;
use crate::sensor::SensorHandle;
use crate::threading::{os_thread, sleep_time, Event};
use crate::transaction::TransactionId;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle as OsHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    WaitingReady,
    WaitingStart,
    Sampling,
    Stopping,
    Done,
    Failed,
}

/// What the worker needs to know besides its sensors
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub rank: usize,
    /// Id of the produced host node.
    pub hostname: String,
    pub sampling_period: Duration,
    pub post_processing: PostProcessingConfig,
}

struct Signals {
    ready: Event,
    start: Event,
    stop: Event,
    state: Mutex<WorkerState>,
}
impl Signals {
    fn set_state(&self, state: WorkerState) {
        *self.state.lock() = state;
    }
}

/// Owner's side of a running sampling worker
pub struct SamplingWorker {
    rank: usize,
    signals: Arc<Signals>,
    result_rx: Receiver<Result<ResultNode>>,
    handle: Option<OsHandle<()>>,
}

impl SamplingWorker {
    /// Start a worker thread that opens the sensors of `assignment` and waits for [SamplingWorker::start].
    pub fn spawn(
        registry: Arc<BackendRegistry>,
        assignment: SensorAssignment,
        config: WorkerConfig,
        tid: &TransactionId,
    ) -> Result<Self> {
        let signals = Arc::new(Signals {
            ready: Event::new(),
            start: Event::new(),
            stop: Event::new(),
            state: Mutex::new(WorkerState::Idle),
        });
        let (tx, rx) = channel();
        let rank = config.rank;
        let thread_signals = signals.clone();
        let handle = os_thread(format!("{}-{}", tid, rank), move |thread_tid| {
            run_worker(&thread_signals, &registry, &assignment, &config, tx, &thread_tid)
        })?;
        debug!(tid=tid, rank=rank, "Spawned sampling worker");
        Ok(SamplingWorker {
            rank,
            signals,
            result_rx: rx,
            handle: Some(handle),
        })
    }

    pub fn state(&self) -> WorkerState {
        *self.signals.state.lock()
    }

    /// Wait until the worker opened its sensors.
    /// Fails with [SubprocessError] if it could not, or did not report back within `timeout`.
    pub fn wait_ready(&self, timeout: Duration, tid: &TransactionId) -> Result<()> {
        if !self.signals.ready.wait_timeout(timeout) {
            crate::bail_typed!(
                SubprocessError {
                    rank: self.rank,
                    message: format!("not ready after {:?}", timeout),
                },
                tid = tid,
                "Sampling worker did not become ready"
            );
        }
        if self.state() == WorkerState::Failed {
            let message = match self.result_rx.try_recv() {
                Ok(Err(e)) => e.to_string(),
                _ => "could not open its sensors".to_string(),
            };
            crate::bail_typed!(
                SubprocessError {
                    rank: self.rank,
                    message,
                },
                tid = tid,
                "Sampling worker failed to start"
            );
        }
        Ok(())
    }

    pub fn start(&self) {
        self.signals.start.set();
    }

    /// Idempotent.
    pub fn stop(&self) {
        self.signals.stop.set();
    }

    /// Release a worker that may still be waiting for start, so it can wind down.
    pub fn abort(&self) {
        self.signals.start.set();
        self.signals.stop.set();
    }

    /// Stop the worker and wait up to `timeout` for its host node.
    pub fn collect(mut self, timeout: Duration, tid: &TransactionId) -> Result<ResultNode> {
        self.stop();
        let (result, joinable) = match self.result_rx.recv_timeout(timeout) {
            Ok(Ok(node)) => (Ok(node), true),
            Ok(Err(e)) => (Err(e.to_string()), true),
            Err(RecvTimeoutError::Timeout) => (Err(format!("no data after {:?}", timeout)), false),
            Err(RecvTimeoutError::Disconnected) => (Err("exited without handing back data".to_string()), true),
        };
        if let Some(h) = self.handle.take() {
            match joinable {
                true => {
                    if h.join().is_err() {
                        error!(tid=tid, rank=self.rank, "Sampling worker panicked");
                    }
                },
                false => warn!(tid=tid, rank=self.rank, "Leaving unresponsive sampling worker behind"),
            }
        }
        match result {
            Ok(node) => Ok(node),
            Err(message) => crate::bail_typed!(
                SubprocessError {
                    rank: self.rank,
                    message,
                },
                tid = tid,
                "Sampling worker did not deliver"
            ),
        }
    }
}

impl Drop for SamplingWorker {
    fn drop(&mut self) {
        if self.handle.is_some() {
            self.abort();
        }
    }
}

/// Timestamps and readings of every sensor, one row per sample
struct Samples {
    timestamps: Vec<u64>,
    values: Vec<Vec<f64>>,
}

fn take_sample(handles: &mut [SensorHandle], samples: &mut Samples, tid: &TransactionId) {
    let mut ts = unix_nanos();
    if let Some(last) = samples.timestamps.last() {
        if ts <= *last {
            ts = last + 1;
        }
    }
    samples.timestamps.push(ts);
    for (h, vals) in handles.iter_mut().zip(samples.values.iter_mut()) {
        match h.read() {
            Ok(v) => vals.push(v),
            Err(e) => {
                warn!(tid=tid, sensor=%h.id, error=%e, "Sensor read failed, recording fill value");
                vals.push(h.data_type.fill);
            },
        }
    }
}

/// Sample on entry, then once per period until `stop`, then once more.
fn sample_loop(handles: &mut [SensorHandle], stop: &Event, period: Duration, tid: &TransactionId) -> Samples {
    let mut samples = Samples {
        timestamps: vec![],
        values: vec![vec![]; handles.len()],
    };
    let mut last = now();
    take_sample(handles, &mut samples, tid);
    loop {
        if stop.wait_timeout(sleep_time(period, last)) {
            break;
        }
        last = now();
        take_sample(handles, &mut samples, tid);
    }
    take_sample(handles, &mut samples, tid);
    samples
}

fn run_worker(
    signals: &Signals,
    registry: &BackendRegistry,
    assignment: &SensorAssignment,
    config: &WorkerConfig,
    tx: Sender<Result<ResultNode>>,
    tid: &TransactionId,
) {
    signals.set_state(WorkerState::WaitingReady);
    let mut handles = match registry.resolve(assignment, tid) {
        Ok(h) => h,
        Err(e) => {
            error!(tid=tid, rank=config.rank, error=%e, "Sampling worker could not open its sensors");
            signals.set_state(WorkerState::Failed);
            let _ = tx.send(Err(e));
            signals.ready.set();
            return;
        },
    };
    signals.set_state(WorkerState::WaitingStart);
    signals.ready.set();
    signals.start.wait();

    signals.set_state(WorkerState::Sampling);
    debug!(tid=tid, sensors=handles.len(), "Sampling started");
    let samples = sample_loop(&mut handles, &signals.stop, config.sampling_period, tid);
    signals.set_state(WorkerState::Stopping);
    info!(tid=tid, rank=config.rank, samples=samples.timestamps.len(), "Sampling stopped");

    let host = build_host_node(&config.hostname, &handles, samples, tid).and_then(|mut host| {
        host.set_meta("backends", serde_json::Value::Object(registry.metadata().into_iter().collect()));
        process_data_node(&mut host, &config.post_processing, false, tid)?;
        Ok(host)
    });
    drop(handles);
    match host {
        Ok(_) => signals.set_state(WorkerState::Done),
        Err(ref e) => {
            error!(tid=tid, error=%e, "Sampling worker failed to assemble its data");
            signals.set_state(WorkerState::Failed);
        },
    }
    if tx.send(host).is_err() {
        warn!(tid=tid, "Owner stopped listening before the sampling worker finished");
    }
}

/// Group sensor nodes under one node per device type, except whole-machine sensors
/// which hang directly off the host.
fn build_host_node(
    hostname: &str,
    handles: &[SensorHandle],
    samples: Samples,
    tid: &TransactionId,
) -> Result<ResultNode> {
    let mut host = ResultNode::new(hostname, NodeType::Host);
    let mut groups: Vec<(DeviceType, ResultNode)> = vec![];
    let mut direct = vec![];
    for (h, values) in handles.iter().zip(samples.values) {
        let mut sensor = ResultNode::new(h.id.clone(), NodeType::Sensor)
            .with_device(h.device_type)
            .with_metadata(h.metadata.clone());
        sensor.set_meta("backend", h.backend.clone());
        sensor.raw_data = Some(RawData::from_samples(&samples.timestamps, values, h.data_type)?);
        process_sensor_data(&mut sensor)?;
        if h.device_type == DeviceType::Node {
            direct.push(sensor);
            continue;
        }
        match groups.iter_mut().find(|(d, _)| *d == h.device_type) {
            Some((_, g)) => g.add_child(sensor)?,
            None => {
                let mut g = ResultNode::new(h.device_type.name(), NodeType::DeviceGroup).with_device(h.device_type);
                g.add_child(sensor)?;
                groups.push((h.device_type, g));
            },
        }
    }
    for (_, g) in groups {
        host.add_child(g)?;
    }
    for s in direct {
        host.add_child(s)?;
    }
    debug!(tid=tid, host=%hostname, children=host.children().len(), "Built host node");
    Ok(host)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::AssignedSensor;
    use crate::data::{Magnitude, MetricMetadata, MetricType, NumericKind, Unit};
    use crate::errors::is_error;
    use crate::sensor::mock::{MockBackend, MockSensor};
    use crate::sensor::Backend;
    use crate::transaction::TEST_TID;
    use float_cmp::approx_eq;

    fn assign(backend: &MockBackend) -> SensorAssignment {
        backend
            .available_sensors()
            .into_iter()
            .map(|(id, d)| {
                (
                    id,
                    AssignedSensor {
                        backend: backend.id().to_string(),
                        device_type: d.device_type,
                        unit: d.unit,
                    },
                )
            })
            .collect()
    }

    fn config(period_ms: u64) -> WorkerConfig {
        WorkerConfig {
            rank: 0,
            hostname: "testhost".to_string(),
            sampling_period: Duration::from_millis(period_ms),
            post_processing: PostProcessingConfig::default(),
        }
    }

    fn spawn(backend: Arc<MockBackend>, period_ms: u64) -> SamplingWorker {
        let assignment = assign(&backend);
        let registry = Arc::new(BackendRegistry::from_backends(vec![backend as Arc<dyn Backend>]));
        SamplingWorker::spawn(registry, assignment, config(period_ms), &TEST_TID).unwrap()
    }

    #[test]
    fn samples_between_brackets() {
        let backend = Arc::new(
            MockBackend::new("mock")
                .with_sensor(MockSensor::constant("cpu_power", DeviceType::Cpu, 10.0))
                .with_sensor(MockSensor::constant("board", DeviceType::Node, 3.0)),
        );
        let w = spawn(backend.clone(), 10);
        w.wait_ready(Duration::from_secs(5), &TEST_TID).unwrap();
        assert_eq!(w.state(), WorkerState::WaitingStart);
        assert_eq!(backend.open_handles(), 2);
        w.start();
        std::thread::sleep(Duration::from_millis(60));
        let host = w.collect(Duration::from_secs(5), &TEST_TID).unwrap();

        assert_eq!(host.id, "testhost");
        assert!(host.processed);
        assert_eq!(host.child_ids(), vec!["cpu", "board"]);
        let sensor = host.child("cpu").unwrap().child("cpu_power").unwrap();
        let raw = sensor.raw_data.as_ref().unwrap();
        assert!(raw.len() >= 3);
        assert!(raw.timesteps.windows(2).all(|w| w[0] < w[1]));
        assert!(approx_eq!(f64, host.metric_value(MetricType::Power).unwrap(), 13.0, epsilon = 1e-9));
        assert_eq!(sensor.meta_str("backend"), Some("mock"));
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn stop_before_first_period_still_brackets() {
        let backend = Arc::new(MockBackend::new("mock").with_sensor(MockSensor::constant("p", DeviceType::Cpu, 5.0)));
        let w = spawn(backend, 60_000);
        w.wait_ready(Duration::from_secs(5), &TEST_TID).unwrap();
        w.start();
        let host = w.collect(Duration::from_secs(5), &TEST_TID).unwrap();
        let raw = host.child("cpu").unwrap().child("p").unwrap().raw_data.clone().unwrap();
        assert_eq!(raw.len(), 2);
    }

    #[test]
    fn read_failure_records_fill() {
        let md = MetricMetadata::new(Unit::Watt, Magnitude::One, NumericKind::F32, 0.0, 1000.0, -1.0);
        let backend = Arc::new(MockBackend::new("mock").with_sensor(MockSensor::scripted(
            "flaky",
            DeviceType::Gpu,
            md,
            vec![Some(4.0), None, Some(4.0)],
        )));
        let w = spawn(backend, 5);
        w.wait_ready(Duration::from_secs(5), &TEST_TID).unwrap();
        w.start();
        std::thread::sleep(Duration::from_millis(40));
        let host = w.collect(Duration::from_secs(5), &TEST_TID).unwrap();
        let sensor = host.child("gpu").unwrap().child("flaky").unwrap();
        let raw = sensor.raw_data.as_ref().unwrap();
        assert_eq!(raw.values[1], -1.0);
        assert!(approx_eq!(f64, sensor.metric_value(MetricType::GpuPower).unwrap(), 4.0, epsilon = 1e-9));
    }

    #[test]
    fn failing_open_reports_subprocess_error() {
        let backend = Arc::new(
            MockBackend::new("mock")
                .with_sensor(MockSensor::constant("p", DeviceType::Cpu, 5.0))
                .failing_open(),
        );
        let w = spawn(backend.clone(), 10);
        let err = w.wait_ready(Duration::from_secs(5), &TEST_TID).unwrap_err();
        assert!(is_error::<SubprocessError>(&err));
        assert_eq!(w.state(), WorkerState::Failed);
        assert_eq!(backend.open_handles(), 0);
    }

    #[test]
    fn abort_before_start_winds_down() {
        let backend = Arc::new(MockBackend::new("mock").with_sensor(MockSensor::constant("p", DeviceType::Cpu, 5.0)));
        let w = spawn(backend.clone(), 10);
        w.wait_ready(Duration::from_secs(5), &TEST_TID).unwrap();
        w.abort();
        let host = w.collect(Duration::from_secs(5), &TEST_TID).unwrap();
        assert!(host.child("cpu").is_some());
        assert_eq!(backend.open_handles(), 0);
    }
}
