use crate::utils::Args;
use clap::Parser;
use erg_library::application::CommandApplication;
use erg_library::bail_error;
use erg_library::comm::{create_communicator, Communicator};
use erg_library::data::{format_value, MetricType, ResultNode};
use erg_library::logging::start_tracing;
use erg_library::monitor_config::Configuration;
use erg_library::orchestrator::{Monitor, MonitorOutcome};
use erg_library::sensor::registry::{default_constructors, BackendRegistry};
use erg_library::transaction::{TransactionId, MONITOR_TID, STARTUP_TID};
use erg_library::utils::{host_metadata, hostname};
use tracing::{info, warn};

pub mod utils;

const SUMMARY_METRICS: [MetricType; 5] = [
    MetricType::Runtime,
    MetricType::Energy,
    MetricType::Power,
    MetricType::Co2,
    MetricType::Money,
];

fn print_summary(outcome: &MonitorOutcome) {
    let app = match &outcome.app {
        Some(a) => a,
        None => return,
    };
    let multi_run: &ResultNode = match app.children().last() {
        Some(m) => m,
        None => return,
    };
    println!("{} / {}", outcome.app_name, multi_run.id);
    for kind in SUMMARY_METRICS {
        if let Some(m) = multi_run.metric(kind) {
            println!("  {:<8} {}", kind.name(), format_value(m.value(), m.metadata()));
        }
    }
    if outcome.degraded {
        println!("  some ranks were lost, results are partial");
    }
}

fn run(args: Args, tid: &TransactionId) -> anyhow::Result<()> {
    let config = Configuration::boxed(args.config.as_deref(), Some(args.overrides()), tid)?;
    let comm = create_communicator(tid);
    let rank = comm.rank();
    let _guard = start_tracing(&config.logging, rank, tid)?;
    info!(tid=tid, rank=rank, size=comm.size(), "Erg starting");

    let (cmd, cmd_args) = match args.command.split_first() {
        Some((c, a)) => (c.clone(), a.to_vec()),
        None => bail_error!(tid=tid, "No command given to monitor"),
    };
    let registry = BackendRegistry::boxed(default_constructors(), tid);
    let mut monitor = Monitor::new(config, comm, registry, hostname(tid), host_metadata(tid));
    let mut app = CommandApplication::new(&cmd, cmd_args);

    let outcome = monitor.monitor_application(&mut app, &MONITOR_TID)?;
    if outcome.degraded {
        warn!(tid=tid, app_name=%outcome.app_name, "Monitoring finished with unreachable ranks");
    }
    print_summary(&outcome);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let tid: &TransactionId = &STARTUP_TID;
    let cli = Args::parse();
    run(cli, tid)
}
