pub mod file_utils;
pub use file_utils as file;

use crate::bail_error;
use crate::transaction::TransactionId;
use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// The name of the machine this rank runs on.
/// Ranks are grouped onto hosts by this value.
pub fn hostname(tid: &TransactionId) -> String {
    match nix::unistd::gethostname() {
        Ok(h) => h.to_string_lossy().to_string(),
        Err(e) => {
            warn!(tid=tid, error=%e, "Unable to read hostname, using 'localhost'");
            "localhost".to_string()
        },
    }
}

/// Kernel and machine details reported on each host node.
pub fn host_metadata(tid: &TransactionId) -> BTreeMap<String, serde_json::Value> {
    let mut md = BTreeMap::new();
    match nix::sys::utsname::uname() {
        Ok(u) => {
            md.insert("system".to_string(), u.sysname().to_string_lossy().into());
            md.insert("node".to_string(), u.nodename().to_string_lossy().into());
            md.insert("release".to_string(), u.release().to_string_lossy().into());
            md.insert("version".to_string(), u.version().to_string_lossy().into());
            md.insert("machine".to_string(), u.machine().to_string_lossy().into());
        },
        Err(e) => warn!(tid=tid, error=%e, "uname failed, host metadata will be sparse"),
    }
    md
}

/// Find the executable `cmd` would launch.
/// Paths containing a `/` are checked directly, bare names are searched for in `PATH`.
pub fn resolve_executable(cmd: &str, tid: &TransactionId) -> Result<PathBuf> {
    if cmd.is_empty() {
        bail_error!(tid=tid, "No command given to execute");
    }
    if cmd.contains('/') {
        let pth = Path::new(cmd);
        if pth.is_file() {
            return Ok(pth.to_path_buf());
        }
        bail_error!(tid=tid, command=%cmd, "Command does not exist");
    }
    let path_var = std::env::var_os("PATH").unwrap_or_default();
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(cmd);
        if candidate.is_file() {
            debug!(tid=tid, command=%cmd, resolved=%candidate.display(), "Resolved command on PATH");
            return Ok(candidate);
        }
    }
    bail_error!(tid=tid, command=%cmd, "Command not found on PATH")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TEST_TID;
    use rstest::rstest;

    #[rstest]
    #[case("sh")]
    #[case("/bin/sh")]
    fn finds_shell(#[case] cmd: &str) {
        let pth = resolve_executable(cmd, &TEST_TID).unwrap();
        assert!(pth.ends_with("sh"));
    }

    #[rstest]
    #[case("")]
    #[case("/definitely/not/here")]
    #[case("no-such-binary-on-this-path")]
    fn missing_commands_error(#[case] cmd: &str) {
        assert!(resolve_executable(cmd, &TEST_TID).is_err());
    }

    #[test]
    fn hostname_not_empty() {
        assert!(!hostname(&TEST_TID).is_empty());
    }
}
