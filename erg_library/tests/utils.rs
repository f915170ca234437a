use erg_library::comm::Communicator;
use erg_library::data::DeviceType;
use erg_library::logging::{start_tracing, LoggingConfig};
use erg_library::monitor_config::{Configuration, ErgConfig};
use erg_library::orchestrator::Monitor;
use erg_library::sensor::mock::{MockBackend, MockSensor};
use erg_library::sensor::registry::BackendRegistry;
use erg_library::sensor::Backend;
use erg_library::transaction::TEST_TID;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

#[macro_export]
macro_rules! assert_error {
    ($err:expr, $typ:ty, $noerr:expr) => {
        match $err {
            Ok(_) => panic!("{}", $noerr),
            Err(e) => {
                assert!(
                    erg_library::errors::is_error::<$typ>(&e),
                    "expected {}, got '{}'",
                    stringify!($typ),
                    e
                );
            },
        };
    };
}

/// Config that samples every 10ms and stores results under `data_out`.
/// Passing [log] = Some("<level>") will enable logging to stdout, useful for test debugging.
pub fn test_config(data_out: &Path, overrides: &[(&str, &str)], log: Option<&str>) -> (Option<impl Drop>, ErgConfig) {
    let mut all = vec![
        ("monitor.sampling_period_s".to_string(), "0.01".to_string()),
        ("monitor.ready_timeout_s".to_string(), "5".to_string()),
        ("monitor.join_timeout_s".to_string(), "5".to_string()),
        ("output.data_out".to_string(), data_out.to_string_lossy().to_string()),
    ];
    all.extend(overrides.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    let cfg = Configuration::boxed(None, Some(all), &TEST_TID).unwrap();
    let log = match log {
        Some(level) => {
            let log_cfg = LoggingConfig {
                level: level.to_string(),
                stdout: Some(true),
                ..Default::default()
            };
            Some(start_tracing(&log_cfg, 0, &TEST_TID).unwrap())
        },
        None => None,
    };
    (log, cfg)
}

/// A registry holding one mock backend with a constant power sensor on the CPU.
pub fn constant_registry(watts: f64) -> Arc<BackendRegistry> {
    let backend = MockBackend::new("mock").with_sensor(MockSensor::constant("cpu_power", DeviceType::Cpu, watts));
    Arc::new(BackendRegistry::from_backends(vec![Arc::new(backend) as Arc<dyn Backend>]))
}

pub fn build_monitor(
    cfg: &ErgConfig,
    comm: Box<dyn Communicator>,
    registry: Arc<BackendRegistry>,
    hostname: &str,
) -> Monitor {
    Monitor::new(cfg.clone(), comm, registry, hostname.to_string(), BTreeMap::new())
}

/// Run `f` once per rank, each on its own thread, and return the results by rank.
pub fn run_ranks<C, T, F>(comms: Vec<C>, f: F) -> Vec<T>
where
    C: Send + 'static,
    T: Send + 'static,
    F: Fn(C) -> T + Send + Sync + 'static,
{
    let f = Arc::new(f);
    let handles: Vec<_> = comms
        .into_iter()
        .map(|c| {
            let f = f.clone();
            std::thread::spawn(move || f(c))
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}
