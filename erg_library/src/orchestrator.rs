//! Runs the monitored application round by round on every rank.
//!
//! Each round: every rank readies its sampling worker, the ranks agree that all workers are up,
//! meet at a barrier, run the application, and gather what they measured on one collecting rank.
//! The collecting rank builds the Run node. After the last round it persists the multi-run.
use crate::application::{check_app_name, resolve_app_name, AppExit, Application};
use crate::clock::{local_now_str, unix_nanos};
use crate::comm::{CommExt, Communicator};
use crate::coordination::{discover_and_assign, SensorAssignment, SensorFilters};
use crate::data::regions::assemble_regions;
use crate::data::{LocalRegions, NodeType, ResultNode};
use crate::errors::{is_error, CollectiveUnavailableError, ScriptError, SubprocessError};
use crate::monitor_config::ErgConfig;
use crate::processing::process_data_node;
use crate::sensor::registry::BackendRegistry;
use crate::storage::AppStore;
use crate::transaction::TransactionId;
use crate::worker::{SamplingWorker, WorkerConfig};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Run id and app name prefix used when a round could not be completed normally.
pub const FAILED_MARKER: &str = "failed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum WorkerStatus {
    Ready,
    /// Nothing assigned to this rank.
    Idle,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum RoundStatus {
    Ok,
    ScriptError(String),
    WorkerFailed(String),
}

#[derive(Debug, Serialize, Deserialize)]
/// What one rank contributes to a Run
struct RoundReport {
    rank: usize,
    hostname: String,
    start_ns: u64,
    host: Option<ResultNode>,
    regions: LocalRegions,
}

fn script_message(e: &anyhow::Error) -> String {
    match e.downcast_ref::<ScriptError>() {
        Some(s) => s.message.clone(),
        None => e.to_string(),
    }
}

fn worker_message(e: &anyhow::Error) -> String {
    match e.downcast_ref::<SubprocessError>() {
        Some(s) => s.message.clone(),
        None => e.to_string(),
    }
}

/// A round as seen by one rank
struct RoundOutcome {
    /// Set on the collecting rank when any rank had data.
    run: Option<ResultNode>,
    script_error: Option<String>,
    worker_error: Option<(usize, String)>,
    degraded: bool,
}

/// What a monitored execution produced on this rank
#[derive(Debug)]
pub struct MonitorOutcome {
    /// Name the results were stored under.
    pub app_name: String,
    /// Some ranks became unreachable. Results were recovered from the rest.
    pub degraded: bool,
    /// The stored App node, on the rank that persisted it.
    pub app: Option<ResultNode>,
}

/// Monitors one application execution across all ranks.
/// Constructed once per execution on every rank.
pub struct Monitor {
    config: ErgConfig,
    comm: Box<dyn Communicator>,
    registry: Arc<BackendRegistry>,
    hostname: String,
    host_metadata: BTreeMap<String, serde_json::Value>,
    /// Rank that gathers and persists results, rank 0 unless it became unreachable.
    collector: usize,
}

impl Monitor {
    pub fn new(
        config: ErgConfig,
        comm: Box<dyn Communicator>,
        registry: Arc<BackendRegistry>,
        hostname: String,
        host_metadata: BTreeMap<String, serde_json::Value>,
    ) -> Self {
        Monitor {
            config,
            comm,
            registry,
            hostname,
            host_metadata,
            collector: 0,
        }
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            rank: self.comm.rank(),
            hostname: self.hostname.clone(),
            sampling_period: self.config.monitor.sampling_period(),
            post_processing: self.config.post_processing.clone(),
        }
    }

    /// Run warmup and benchmark rounds of `app`, then store the results.
    /// Rounds that completed are persisted before any failure is returned.
    /// Backends are closed once the execution ends, whether or not it succeeded.
    pub fn monitor_application(&mut self, app: &mut dyn Application, tid: &TransactionId) -> Result<MonitorOutcome> {
        let result = self.execute(app, tid);
        self.registry.close(tid);
        result
    }

    fn execute(&mut self, app: &mut dyn Application, tid: &TransactionId) -> Result<MonitorOutcome> {
        app.validate(tid)?;
        let mut app_name = resolve_app_name(self.config.output.app_name.as_deref(), app, tid);
        check_app_name(&app_name, tid)?;
        let execution_dt = local_now_str(tid)?;
        info!(tid=tid, rank=self.rank(), app=%app_name, "Monitoring application");

        let filters = SensorFilters::from_config(&self.config.monitor, tid)?;
        let visible = self.registry.visible_sensors();
        let (_host_ranks, assignment) =
            discover_and_assign(self.comm.as_ref(), &visible, &self.hostname, &filters, tid)?;

        self.warmup(app, tid)?;

        let mut runs = vec![];
        let mut degraded = false;
        let mut failure: Option<anyhow::Error> = None;
        for round in 0..self.config.benchmarking.rounds {
            let outcome = match self.run_round(round, app, &assignment, tid) {
                Ok(o) => o,
                Err(e) => {
                    error!(tid=tid, rank=self.rank(), round=round, error=%e, "Round failed, stopping");
                    failure = Some(e);
                    break;
                },
            };
            if let Some(run) = outcome.run {
                runs.push(run);
            }
            if outcome.degraded {
                degraded = true;
                app_name = format!("{}_{}", FAILED_MARKER, app_name);
                warn!(tid=tid, rank=self.rank(), app=%app_name, "Ranks were lost, stopping after recovering this round");
                break;
            }
            if let Some(message) = outcome.script_error {
                failure = Some(anyhow::Error::new(ScriptError { message }));
                break;
            }
            if let Some((rank, message)) = outcome.worker_error {
                failure = Some(anyhow::Error::new(SubprocessError { rank, message }));
                break;
            }
        }

        let stored = match self.comm.rank() == self.collector && !runs.is_empty() {
            true => Some(self.persist(&app_name, runs, &execution_dt, tid)?),
            false => None,
        };
        match failure {
            Some(e) => Err(e),
            None => Ok(MonitorOutcome {
                app_name,
                degraded,
                app: stored,
            }),
        }
    }

    /// Run the application without sampling. A script error on any rank aborts the execution.
    fn warmup(&self, app: &mut dyn Application, tid: &TransactionId) -> Result<()> {
        for round in 0..self.config.benchmarking.warmup_rounds {
            debug!(tid=tid, round=round, "Warmup round");
            let mut regions = LocalRegions::default();
            let status = match app.run(&mut regions, tid) {
                Ok(_) => RoundStatus::Ok,
                Err(e) => RoundStatus::ScriptError(script_message(&e)),
            };
            let all: Vec<RoundStatus> = self.comm.all_gather(&status)?;
            for (rank, s) in all.into_iter().enumerate() {
                if let RoundStatus::ScriptError(message) = s {
                    crate::bail_typed!(
                        ScriptError {
                            message: format!("warmup round {} on rank {}: {}", round, rank, message)
                        },
                        tid = tid,
                        "Application failed during warmup"
                    );
                }
            }
        }
        Ok(())
    }

    /// Spawn this rank's worker and wait until it has its sensors open.
    fn ready_worker(&self, assignment: &SensorAssignment, tid: &TransactionId) -> (Option<SamplingWorker>, WorkerStatus) {
        if assignment.is_empty() {
            return (None, WorkerStatus::Idle);
        }
        let worker = match SamplingWorker::spawn(self.registry.clone(), assignment.clone(), self.worker_config(), tid) {
            Ok(w) => w,
            Err(e) => return (None, WorkerStatus::Failed(worker_message(&e))),
        };
        match worker.wait_ready(self.config.monitor.ready_timeout(), tid) {
            Ok(()) => (Some(worker), WorkerStatus::Ready),
            Err(e) => (None, WorkerStatus::Failed(worker_message(&e))),
        }
    }

    fn run_round(
        &mut self,
        round: u32,
        app: &mut dyn Application,
        assignment: &SensorAssignment,
        tid: &TransactionId,
    ) -> Result<RoundOutcome> {
        info!(tid=tid, rank=self.rank(), round=round, "Starting round");
        let (worker, status) = self.ready_worker(assignment, tid);
        let statuses: Vec<WorkerStatus> = self.comm.all_gather(&status)?;
        for (rank, s) in statuses.into_iter().enumerate() {
            if let WorkerStatus::Failed(message) = s {
                crate::bail_typed!(SubprocessError { rank, message }, tid = tid, "Sampling worker failed to start");
            }
        }
        self.comm.barrier()?;

        let start_ns = unix_nanos();
        if let Some(w) = &worker {
            w.start();
        }
        let mut regions = LocalRegions::default();
        let app_result = app.run(&mut regions, tid);
        if let Some(w) = &worker {
            w.stop();
        }
        let host = match worker {
            Some(w) => w.collect(self.config.monitor.join_timeout(), tid).map(Some),
            None => Ok(None),
        };
        let local = match (&app_result, &host) {
            (Err(e), _) => RoundStatus::ScriptError(script_message(e)),
            (Ok(_), Err(e)) => RoundStatus::WorkerFailed(worker_message(e)),
            (Ok(AppExit::Exited(code)), Ok(_)) => {
                debug!(tid=tid, code=code, "Round kept despite exit code");
                RoundStatus::Ok
            },
            (Ok(AppExit::Success), Ok(_)) => RoundStatus::Ok,
        };
        let host = match host {
            Ok(h) => h.map(|h| h.with_metadata(self.host_metadata.clone())),
            Err(_) => None,
        };
        let report = RoundReport {
            rank: self.comm.rank(),
            hostname: self.hostname.clone(),
            start_ns,
            host,
            regions,
        };

        let mut outcome = RoundOutcome {
            run: None,
            script_error: None,
            worker_error: None,
            degraded: false,
        };
        let gathered = match self.comm.all_gather(&local) {
            Ok(all) => {
                for (rank, s) in all.into_iter().enumerate() {
                    match s {
                        RoundStatus::ScriptError(m) if outcome.script_error.is_none() => {
                            outcome.script_error = Some(format!("rank {}: {}", rank, m))
                        },
                        RoundStatus::WorkerFailed(m) if outcome.worker_error.is_none() => {
                            outcome.worker_error = Some((rank, m))
                        },
                        _ => (),
                    }
                }
                self.comm.gather(&report, self.collector)
            },
            Err(e) => Err(e),
        };
        let reports = match gathered {
            Ok(r) => r,
            Err(e) if is_error::<CollectiveUnavailableError>(&e) => {
                if let RoundStatus::ScriptError(m) = &local {
                    outcome.script_error = Some(m.clone());
                }
                outcome.degraded = true;
                self.recover_reports(&report, &e, tid)?
            },
            Err(e) => return Err(e),
        };

        if let Some(reports) = reports {
            let failed = outcome.degraded || outcome.script_error.is_some();
            let run_id = match failed {
                true => FAILED_MARKER.to_string(),
                false => round.to_string(),
            };
            outcome.run = self.assemble_run(&run_id, reports, failed, tid)?;
        }
        Ok(outcome)
    }

    /// Gather this round's reports from whichever ranks are still reachable.
    /// The lowest reachable rank collects from now on.
    fn recover_reports(
        &mut self,
        report: &RoundReport,
        cause: &anyhow::Error,
        tid: &TransactionId,
    ) -> Result<Option<Vec<RoundReport>>> {
        let reachable = self.comm.reachable_ranks();
        let root = match reachable.iter().min() {
            Some(r) => *r,
            None => crate::bail_error!(tid=tid, "No rank is reachable, round data is lost"),
        };
        warn!(tid=tid, rank=self.rank(), cause=%cause, reachable=?reachable, collector=root, "Collective failed, gathering from reachable ranks");
        self.collector = root;
        let reports: Option<Vec<(usize, RoundReport)>> = self.comm.gather_from_subset(report, &reachable, root)?;
        Ok(reports.map(|r| r.into_iter().map(|(_, report)| report).collect()))
    }

    /// The Run node of `reports`, processed. `None` if no rank sampled anything.
    fn assemble_run(
        &self,
        run_id: &str,
        reports: Vec<RoundReport>,
        failed: bool,
        tid: &TransactionId,
    ) -> Result<Option<ResultNode>> {
        let mut hosts: Vec<(String, Vec<usize>, Vec<u64>)> = vec![];
        for r in &reports {
            match hosts.iter_mut().find(|(h, _, _)| *h == r.hostname) {
                Some((_, ranks, starts)) => {
                    ranks.push(r.rank);
                    starts.push(r.start_ns);
                },
                None => hosts.push((r.hostname.clone(), vec![r.rank], vec![r.start_ns])),
            }
        }
        let locals: Vec<(usize, u64, &LocalRegions)> = reports.iter().map(|r| (r.rank, r.start_ns, &r.regions)).collect();
        let regions = assemble_regions(&locals);

        let mut run = ResultNode::new(run_id, NodeType::Run);
        for report in reports {
            let mut host = match report.host {
                Some(h) => h,
                None => continue,
            };
            if let Some((_, ranks, starts)) = hosts.iter().find(|(h, _, _)| *h == report.hostname) {
                host.set_meta("ranks", ranks.clone());
                host.set_meta("round_start_ns", starts.clone());
            }
            run.add_child(host)?;
        }
        if run.children().is_empty() {
            warn!(tid=tid, run=%run_id, "No rank reported any data, abandoning round");
            return Ok(None);
        }
        if !regions.is_empty() {
            run.regions = Some(regions);
        }
        if failed {
            run.set_meta("status", FAILED_MARKER);
        }
        process_data_node(&mut run, &self.config.post_processing, false, tid)?;
        debug!(tid=tid, run=%run_id, hosts=run.children().len(), "Assembled run");
        Ok(Some(run))
    }

    /// Wrap `runs` in a multi-run node and append it to the stored App node.
    fn persist(&self, app_name: &str, runs: Vec<ResultNode>, execution_dt: &str, tid: &TransactionId) -> Result<ResultNode> {
        let id = match &self.config.output.run_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => execution_dt.to_string(),
        };
        let mut multi_run = ResultNode::new(id, NodeType::MultiRun).with_metadata(self.config.flatten());
        multi_run.set_meta("app_name", app_name);
        multi_run.set_meta("erg_version", env!("CARGO_PKG_VERSION"));
        multi_run.set_meta("execution_dt", execution_dt);
        multi_run.set_meta("n_runs", runs.len());
        for run in runs {
            multi_run.add_child(run)?;
        }
        process_data_node(&mut multi_run, &self.config.post_processing, false, tid)?;
        AppStore::new(&self.config.output.data_out).append_multi_run(
            app_name,
            multi_run,
            execution_dt,
            &self.config.post_processing,
            tid,
        )
    }
}
