//! The program being measured.
//! Either an external command run as a child process, or a closure run in place.
use crate::data::LocalRegions;
use crate::errors::{AppNotFoundError, ScriptError};
use crate::transaction::TransactionId;
use crate::utils::resolve_executable;
use anyhow::Result;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Job name exported by the batch scheduler, used when the app is named `SLURM`.
pub const SLURM_JOB_NAME_VAR: &str = "SBATCH_JOB_NAME";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a round of the application ended, short of an error
pub enum AppExit {
    Success,
    /// The application terminated itself with a non-zero status.
    /// Tolerated, the round is kept.
    Exited(i32),
}

/// Something the monitor can run once per round
pub trait Application: Send {
    /// Name results are stored under when none is configured.
    fn name(&self) -> String;
    /// Check the target exists. Fails with [AppNotFoundError].
    fn validate(&self, tid: &TransactionId) -> Result<()>;
    /// Run to completion once.
    /// Region events can be recorded into `regions`.
    /// Fails with [ScriptError] if the application raised or was killed.
    fn run(&mut self, regions: &mut LocalRegions, tid: &TransactionId) -> Result<AppExit>;
}

/// An external program, run as a child process with inherited stdio
pub struct CommandApplication {
    cmd: String,
    args: Vec<String>,
    env: Option<HashMap<String, String>>,
    resolved: Option<PathBuf>,
}

impl CommandApplication {
    pub fn new(cmd: &str, args: Vec<String>) -> Self {
        CommandApplication {
            cmd: cmd.to_string(),
            args,
            env: None,
            resolved: None,
        }
    }

    /// Extra environment variables for the child.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    fn prepare_cmd(&mut self, tid: &TransactionId) -> Result<Command> {
        let pth = match &self.resolved {
            Some(p) => p.clone(),
            None => {
                let p = resolve_executable(&self.cmd, tid)?;
                self.resolved = Some(p.clone());
                p
            },
        };
        debug!(tid=tid, command=%pth.display(), args=?self.args, environment=?self.env, "executing application");
        let mut cmd = Command::new(&pth);
        cmd.args(&self.args);
        if let Some(env) = &self.env {
            cmd.envs(env);
        }
        Ok(cmd)
    }
}

impl Application for CommandApplication {
    fn name(&self) -> String {
        match Path::new(&self.cmd).file_stem() {
            Some(s) => s.to_string_lossy().to_string(),
            None => self.cmd.clone(),
        }
    }

    fn validate(&self, tid: &TransactionId) -> Result<()> {
        match resolve_executable(&self.cmd, tid) {
            Ok(_) => Ok(()),
            Err(_) => crate::bail_typed!(
                AppNotFoundError {
                    target: self.cmd.clone()
                },
                tid = tid,
                "Application command cannot be found"
            ),
        }
    }

    fn run(&mut self, _regions: &mut LocalRegions, tid: &TransactionId) -> Result<AppExit> {
        let mut cmd = self.prepare_cmd(tid)?;
        let status = match cmd.status() {
            Ok(s) => s,
            Err(e) => crate::bail_typed!(
                ScriptError {
                    message: format!("could not launch '{}': {}", self.cmd, e)
                },
                tid = tid,
                "Running application failed"
            ),
        };
        match status.code() {
            Some(0) => Ok(AppExit::Success),
            Some(code) => {
                warn!(tid=tid, command=%self.cmd, code=code, "Application exited with a non-zero code, keeping the round");
                Ok(AppExit::Exited(code))
            },
            None => crate::bail_typed!(
                ScriptError {
                    message: format!("'{}' was terminated by a signal ({})", self.cmd, status)
                },
                tid = tid,
                "Application was killed"
            ),
        }
    }
}

type AppFn = Box<dyn FnMut(&mut LocalRegions) -> Result<()> + Send>;

/// A closure run on the calling thread.
/// Returning an error or panicking counts as a script error.
pub struct FnApplication {
    name: String,
    function: AppFn,
}

impl FnApplication {
    pub fn new(name: &str, function: impl FnMut(&mut LocalRegions) -> Result<()> + Send + 'static) -> Self {
        FnApplication {
            name: name.to_string(),
            function: Box::new(function),
        }
    }
}

impl Application for FnApplication {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn validate(&self, _tid: &TransactionId) -> Result<()> {
        Ok(())
    }

    fn run(&mut self, regions: &mut LocalRegions, tid: &TransactionId) -> Result<AppExit> {
        let function = &mut self.function;
        match catch_unwind(AssertUnwindSafe(|| function(regions))) {
            Ok(Ok(())) => Ok(AppExit::Success),
            Ok(Err(e)) => crate::bail_typed!(
                ScriptError {
                    message: format!("{:?}", e)
                },
                tid = tid,
                app = %self.name,
                "Application returned an error"
            ),
            Err(panic) => {
                let message = match panic.downcast_ref::<&str>() {
                    Some(s) => s.to_string(),
                    None => match panic.downcast_ref::<String>() {
                        Some(s) => s.clone(),
                        None => "panicked".to_string(),
                    },
                };
                crate::bail_typed!(ScriptError { message }, tid = tid, app = %self.name, "Application panicked")
            },
        }
    }
}

/// Name the results of `app` are stored under.
/// `SLURM` defers to the scheduler's job name when one is exported.
pub fn resolve_app_name(configured: Option<&str>, app: &dyn Application, tid: &TransactionId) -> String {
    match configured {
        Some("SLURM") => match std::env::var(SLURM_JOB_NAME_VAR) {
            Ok(job) if !job.is_empty() => {
                info!(tid=tid, job=%job, "Using batch job name as application name");
                job
            },
            _ => "SLURM".to_string(),
        },
        Some(name) if !name.is_empty() => name.to_string(),
        _ => app.name(),
    }
}

/// Reject names that would escape the output directory.
pub fn check_app_name(name: &str, tid: &TransactionId) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        bail_error!(tid=tid, app_name=%name, "Application name cannot be used as a file name");
    }
    Ok(())
}
