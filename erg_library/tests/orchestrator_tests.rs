#[macro_use]
pub mod utils;

use crate::utils::{build_monitor, constant_registry, run_ranks, test_config};
use erg_library::application::{CommandApplication, FnApplication};
use erg_library::comm::{Communicator, LocalComm, ThreadComm};
use erg_library::data::{DeviceType, MetricType, NodeType};
use erg_library::errors::{AppNotFoundError, ScriptError, SubprocessError};
use erg_library::orchestrator::FAILED_MARKER;
use erg_library::sensor::mock::{MockBackend, MockSensor};
use erg_library::sensor::registry::BackendRegistry;
use erg_library::sensor::Backend;
use erg_library::storage::AppStore;
use erg_library::transaction::TEST_TID;
use float_cmp::approx_eq;
use more_asserts::{assert_ge, assert_gt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn sleeper(name: &str, ms: u64) -> FnApplication {
    FnApplication::new(name, move |_r| {
        std::thread::sleep(Duration::from_millis(ms));
        Ok(())
    })
}

#[test]
fn single_rank_constant_power() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[("benchmarking.rounds", "2")], None);
    let mut monitor = build_monitor(&cfg, Box::new(LocalComm), constant_registry(10.0), "solo");
    let mut app = sleeper("sleepy", 100);

    let outcome = monitor.monitor_application(&mut app, &TEST_TID).unwrap();
    assert_eq!(outcome.app_name, "sleepy");
    assert!(!outcome.degraded);
    let stored = outcome.app.unwrap();
    assert_eq!(stored.kind, NodeType::App);
    let multi_run = &stored.children()[0];
    assert_eq!(multi_run.child_ids(), vec!["0", "1"]);
    assert_eq!(multi_run.metadata["n_runs"], serde_json::json!(2));
    assert_eq!(multi_run.meta_str("app_name"), Some("sleepy"));

    for run in multi_run.children() {
        let runtime = run.metric_value(MetricType::Runtime).unwrap();
        assert_ge!(runtime, 0.09);
        let energy = run.metric_value(MetricType::Energy).unwrap();
        assert!(approx_eq!(f64, energy, 10.0 * runtime, epsilon = 1e-6));
        assert!(approx_eq!(f64, run.metric_value(MetricType::Power).unwrap(), 10.0, epsilon = 1e-9));
        assert_gt!(run.metric_value(MetricType::Money).unwrap(), 0.0);
        assert_gt!(run.metric_value(MetricType::Co2).unwrap(), 0.0);
        let host = run.child("solo").unwrap();
        assert_eq!(host.metadata["ranks"], serde_json::json!([0]));
    }
    let stats = multi_run.metric(MetricType::Power).unwrap().as_stats().unwrap();
    assert!(approx_eq!(f64, stats.mean, 10.0, epsilon = 1e-9));
    assert!(AppStore::new(dir.path()).path_for("sleepy").is_file());
}

#[test]
fn repeated_executions_get_new_ids() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[("output.run_id", "bench")], None);
    for _ in 0..3 {
        let mut monitor = build_monitor(&cfg, Box::new(LocalComm), constant_registry(5.0), "solo");
        monitor.monitor_application(&mut sleeper("repeat", 20), &TEST_TID).unwrap();
    }
    let app = AppStore::new(dir.path()).load("repeat", &TEST_TID).unwrap().unwrap();
    assert_eq!(app.child_ids(), vec!["bench", "bench_1", "bench_2"]);
    assert!(app.metadata.contains_key("creation_dt"));
}

#[test]
fn energy_counter_sensor() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[], None);
    let backend = MockBackend::new("mock")
        .with_sensor(MockSensor::energy_counter("package-0", DeviceType::Cpu, 20.0, 262_143_328_850.0));
    let registry = Arc::new(BackendRegistry::from_backends(vec![Arc::new(backend) as Arc<dyn Backend>]));
    let mut monitor = build_monitor(&cfg, Box::new(LocalComm), registry, "solo");
    let outcome = monitor.monitor_application(&mut sleeper("counter", 200), &TEST_TID).unwrap();
    let app = outcome.app.unwrap();
    let run = &app.children()[0].children()[0];
    assert!(approx_eq!(f64, run.metric_value(MetricType::CpuPower).unwrap(), 20.0, epsilon = 0.5));
}

#[test]
fn regions_are_measured() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[], None);
    let mut monitor = build_monitor(&cfg, Box::new(LocalComm), constant_registry(10.0), "solo");
    let mut app = FnApplication::new("regions", |r| {
        for _ in 0..2 {
            r.scoped("step", || std::thread::sleep(Duration::from_millis(40)));
        }
        Ok(())
    });
    let outcome = monitor.monitor_application(&mut app, &TEST_TID).unwrap();
    let app = outcome.app.unwrap();
    let run = &app.children()[0].children()[0];
    let step = &run.regions.as_ref().unwrap()["step"];
    assert!(step.processed);
    assert_eq!(step.raw_data[&0].len(), 4);
    assert_eq!(step.runs_per_rank.as_ref().unwrap().mean, 2.0);
    assert_ge!(step.metrics[&MetricType::Runtime].min, 0.04);
    assert!(approx_eq!(f64, step.metrics[&MetricType::Power].mean, 10.0, epsilon = 1e-6));
}

#[test]
fn script_error_keeps_failed_round_and_stops() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[("benchmarking.rounds", "4")], None);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut app = FnApplication::new("flaky", move |_r| {
        std::thread::sleep(Duration::from_millis(20));
        match counter.fetch_add(1, Ordering::SeqCst) {
            1 => anyhow::bail!("diverged"),
            _ => Ok(()),
        }
    });
    let mut monitor = build_monitor(&cfg, Box::new(LocalComm), constant_registry(10.0), "solo");
    let result = monitor.monitor_application(&mut app, &TEST_TID);
    assert_error!(result, ScriptError, "script error should surface");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stored = AppStore::new(dir.path()).load("flaky", &TEST_TID).unwrap().unwrap();
    let multi_run = &stored.children()[0];
    assert_eq!(multi_run.child_ids(), vec!["0", FAILED_MARKER]);
    assert_eq!(multi_run.child(FAILED_MARKER).unwrap().meta_str("status"), Some(FAILED_MARKER));
}

#[test]
fn nonzero_exit_is_kept() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[], None);
    let mut monitor = build_monitor(&cfg, Box::new(LocalComm), constant_registry(10.0), "solo");
    let mut app = CommandApplication::new("sh", vec!["-c".to_string(), "sleep 0.05; exit 4".to_string()]);
    let outcome = monitor.monitor_application(&mut app, &TEST_TID).unwrap();
    assert_eq!(outcome.app_name, "sh");
    assert_eq!(outcome.app.unwrap().children()[0].child_ids(), vec!["0"]);
}

#[test]
fn missing_command_fails_before_any_round() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[], None);
    let mut monitor = build_monitor(&cfg, Box::new(LocalComm), constant_registry(10.0), "solo");
    let mut app = CommandApplication::new("/no/such/benchmark", vec![]);
    assert_error!(
        monitor.monitor_application(&mut app, &TEST_TID),
        AppNotFoundError,
        "missing command should not run"
    );
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[test]
fn warmup_rounds_are_not_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(
        dir.path(),
        &[("benchmarking.rounds", "1"), ("benchmarking.warmup_rounds", "2")],
        None,
    );
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut app = FnApplication::new("warm", move |_r| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let mut monitor = build_monitor(&cfg, Box::new(LocalComm), constant_registry(10.0), "solo");
    let outcome = monitor.monitor_application(&mut app, &TEST_TID).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(outcome.app.unwrap().children()[0].children().len(), 1);
}

#[test]
fn warmup_failure_aborts() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[("benchmarking.warmup_rounds", "1")], None);
    let mut app = FnApplication::new("cold", |_r| anyhow::bail!("no cache"));
    let mut monitor = build_monitor(&cfg, Box::new(LocalComm), constant_registry(10.0), "solo");
    assert_error!(monitor.monitor_application(&mut app, &TEST_TID), ScriptError, "warmup error should surface");
    assert!(AppStore::new(dir.path()).load("cold", &TEST_TID).unwrap().is_none());
}

#[test]
fn worker_that_cannot_open_sensors_stops_execution() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[], None);
    let backend = MockBackend::new("mock")
        .with_sensor(MockSensor::constant("p", DeviceType::Cpu, 1.0))
        .failing_open();
    let registry = Arc::new(BackendRegistry::from_backends(vec![Arc::new(backend) as Arc<dyn Backend>]));
    let mut monitor = build_monitor(&cfg, Box::new(LocalComm), registry, "solo");
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut app = FnApplication::new("never", move |_r| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    assert_error!(
        monitor.monitor_application(&mut app, &TEST_TID),
        SubprocessError,
        "worker failure should surface"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn ranks_sharing_a_host_sample_once() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[("output.app_name", "shared")], None);
    let outcomes = run_ranks(ThreadComm::group(3), move |comm| {
        let mut monitor = build_monitor(&cfg, Box::new(comm), constant_registry(7.0), "node");
        monitor.monitor_application(&mut sleeper("shared", 30), &TEST_TID).unwrap()
    });
    assert!(outcomes[1].app.is_none());
    assert!(outcomes[2].app.is_none());
    let app = outcomes[0].app.as_ref().unwrap();
    let run = &app.children()[0].children()[0];
    assert_eq!(run.child_ids(), vec!["node"]);
    let host = run.child("node").unwrap();
    assert_eq!(host.metadata["ranks"], serde_json::json!([0, 1, 2]));
    assert!(approx_eq!(f64, run.metric_value(MetricType::Power).unwrap(), 7.0, epsilon = 1e-9));
}

#[test]
fn lost_rank_is_recovered_from_survivors() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(
        dir.path(),
        &[("output.app_name", "fragile"), ("benchmarking.rounds", "3")],
        None,
    );
    let comms: Vec<Arc<ThreadComm>> = ThreadComm::group_with_timeout(3, Duration::from_secs(10))
        .into_iter()
        .map(Arc::new)
        .collect();
    let outcomes = run_ranks(comms, move |comm| {
        let rank = comm.rank();
        let handle = comm.clone();
        let mut app = FnApplication::new("fragile", move |_r| {
            std::thread::sleep(Duration::from_millis(30));
            if rank == 2 {
                handle.disconnect();
            }
            Ok(())
        });
        let hostname = format!("node{}", rank);
        let mut monitor = build_monitor(&cfg, Box::new(comm), constant_registry(5.0), &hostname);
        monitor.monitor_application(&mut app, &TEST_TID).unwrap()
    });

    assert!(outcomes.iter().all(|o| o.degraded));
    assert!(outcomes[1].app.is_none());
    assert!(outcomes[2].app.is_none());
    let expected_name = format!("{}_fragile", FAILED_MARKER);
    assert_eq!(outcomes[0].app_name, expected_name);
    let app = outcomes[0].app.as_ref().unwrap();
    assert_eq!(app.id, expected_name);
    let multi_run = &app.children()[0];
    assert_eq!(multi_run.child_ids(), vec![FAILED_MARKER]);
    let run = &multi_run.children()[0];
    assert_eq!(run.child_ids(), vec!["node0", "node1"]);
    assert!(approx_eq!(f64, run.metric_value(MetricType::Power).unwrap(), 10.0, epsilon = 1e-9));
    assert!(AppStore::new(dir.path()).path_for(&expected_name).is_file());
}

#[test]
fn collector_missing_a_peer_backend_still_samples() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[("output.app_name", "uneven")], None);
    let outcomes = run_ranks(ThreadComm::group(2), move |comm| {
        let mut backends = vec![Arc::new(
            MockBackend::new("a").with_sensor(MockSensor::constant("p", DeviceType::Cpu, 6.0)),
        ) as Arc<dyn Backend>];
        if comm.rank() == 1 {
            backends.push(Arc::new(
                MockBackend::new("b").with_sensor(MockSensor::constant("g", DeviceType::Gpu, 50.0)),
            ));
        }
        let registry = Arc::new(BackendRegistry::from_backends(backends));
        let mut monitor = build_monitor(&cfg, Box::new(comm), registry, "node");
        monitor
            .monitor_application(&mut sleeper("uneven", 30), &TEST_TID)
            .map_err(|e| e.to_string())
    });
    let app = outcomes[0].as_ref().unwrap().app.as_ref().unwrap();
    let run = &app.children()[0].children()[0];
    assert_eq!(run.child_ids(), vec!["node"]);
    let host = run.child("node").unwrap();
    assert_eq!(host.child_ids(), vec!["cpu"]);
    assert!(approx_eq!(f64, run.metric_value(MetricType::Power).unwrap(), 6.0, epsilon = 1e-9));
    assert!(outcomes[1].is_ok());
}

#[test]
fn backends_closed_after_execution() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[], None);
    let backend = Arc::new(MockBackend::new("mock").with_sensor(MockSensor::constant("p", DeviceType::Cpu, 2.0)));
    let registry = Arc::new(BackendRegistry::from_backends(vec![backend.clone() as Arc<dyn Backend>]));
    let mut monitor = build_monitor(&cfg, Box::new(LocalComm), registry, "solo");
    monitor.monitor_application(&mut sleeper("closing", 20), &TEST_TID).unwrap();
    assert_eq!(backend.times_closed(), 1);
}

#[test]
fn backends_closed_after_failure() {
    let dir = tempfile::tempdir().unwrap();
    let (_log, cfg) = test_config(dir.path(), &[("benchmarking.warmup_rounds", "1")], None);
    let backend = Arc::new(MockBackend::new("mock").with_sensor(MockSensor::constant("p", DeviceType::Cpu, 2.0)));
    let registry = Arc::new(BackendRegistry::from_backends(vec![backend.clone() as Arc<dyn Backend>]));
    let mut monitor = build_monitor(&cfg, Box::new(LocalComm), registry, "solo");
    let mut app = FnApplication::new("broken", |_r| anyhow::bail!("bad input"));
    assert_error!(monitor.monitor_application(&mut app, &TEST_TID), ScriptError, "warmup error should surface");
    assert_eq!(backend.times_closed(), 1);
}
