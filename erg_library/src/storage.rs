//! Persistence of the App node: one JSON document per application, accumulating every multi-run.
use crate::data::{NodeType, ResultNode};
use crate::monitor_config::PostProcessingConfig;
use crate::processing::process_data_node;
use crate::transaction::TransactionId;
use crate::utils::file::atomic_write;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CREATION_DT_KEY: &str = "creation_dt";
pub const LAST_EXECUTION_DT_KEY: &str = "last_execution_dt";

/// `new_id`, or `new_id` with a suffix one past the highest existing `_N` if it is taken.
/// A bare `new_id` counts as suffix 0.
pub fn increase_id_counter<S: AsRef<str>>(existing: &[S], new_id: &str) -> String {
    let exp = match regex::Regex::new(&format!(r"^{}(?:_(\d+))?$", regex::escape(new_id))) {
        Ok(e) => e,
        Err(_) => return new_id.to_string(),
    };
    let highest = existing
        .iter()
        .filter_map(|id| exp.captures(id.as_ref()))
        .map(|c| match c.get(1) {
            Some(n) => n.as_str().parse::<u64>().unwrap_or(0),
            None => 0,
        })
        .max();
    match highest {
        Some(h) => format!("{}_{}", new_id, h + 1),
        None => new_id.to_string(),
    }
}

/// Directory of persisted App nodes
pub struct AppStore {
    dir: PathBuf,
}

impl AppStore {
    pub fn new<P: AsRef<Path>>(data_out: P) -> Self {
        AppStore {
            dir: data_out.as_ref().to_path_buf(),
        }
    }

    pub fn path_for(&self, app_name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", app_name))
    }

    /// The stored App node of `app_name`, `None` if there is none yet.
    pub fn load(&self, app_name: &str, tid: &TransactionId) -> Result<Option<ResultNode>> {
        let pth = self.path_for(app_name);
        if !pth.is_file() {
            debug!(tid=tid, path=%pth.display(), "No stored results yet");
            return Ok(None);
        }
        let contents = match std::fs::read(&pth) {
            Ok(c) => c,
            Err(e) => bail_error!(tid=tid, path=%pth.display(), error=%e, "Failed to read stored results"),
        };
        let node: ResultNode = match serde_json::from_slice(&contents) {
            Ok(n) => n,
            Err(e) => bail_error!(tid=tid, path=%pth.display(), error=%e, "Stored results are not a valid result tree"),
        };
        if node.kind != NodeType::App {
            bail_error!(tid=tid, path=%pth.display(), kind=?node.kind, "Stored results do not hold an application node");
        }
        Ok(Some(node))
    }

    pub fn save(&self, app: &ResultNode, tid: &TransactionId) -> Result<PathBuf> {
        let pth = self.path_for(&app.id);
        let bytes = serde_json::to_vec(app)?;
        atomic_write(&pth, &bytes, tid)?;
        info!(tid=tid, path=%pth.display(), multi_runs=app.children().len(), "Saved results");
        Ok(pth)
    }

    /// Add `multi_run` to the App node of `app_name`, creating it if needed, then reprocess and save it.
    /// The multi-run's id gets a numeric suffix if an earlier one already uses it.
    pub fn append_multi_run(
        &self,
        app_name: &str,
        mut multi_run: ResultNode,
        execution_dt: &str,
        cfg: &PostProcessingConfig,
        tid: &TransactionId,
    ) -> Result<ResultNode> {
        let mut app = match self.load(app_name, tid)? {
            Some(mut app) => {
                app.set_meta(LAST_EXECUTION_DT_KEY, execution_dt);
                multi_run.id = increase_id_counter(&app.child_ids(), &multi_run.id);
                app
            },
            None => {
                let mut app = ResultNode::new(app_name, NodeType::App);
                app.set_meta(CREATION_DT_KEY, execution_dt);
                app.set_meta(LAST_EXECUTION_DT_KEY, execution_dt);
                app
            },
        };
        debug!(tid=tid, app=%app_name, multi_run=%multi_run.id, "Appending multi-run");
        app.add_child(multi_run)?;
        app.processed = false;
        process_data_node(&mut app, cfg, false, tid)?;
        self.save(&app, tid)?;
        Ok(app)
    }
}
