use crate::transaction::TransactionId;
use anyhow::Result;
use std::io::Write;
use std::path::Path;
use tracing::debug;

pub fn ensure_dir<P: AsRef<Path>>(dir: P) -> Result<()> {
    match std::fs::create_dir_all(&dir) {
        Ok(_) => Ok(()),
        Err(e) => anyhow::bail!("Failed to create dir '{:?}' because '{}'", dir.as_ref().to_str(), e),
    }
}

/// Write `contents` to `path` so a concurrent reader sees either the old file or the new one, never a partial write.
/// The data goes to a temporary file in the same directory which is then renamed over `path`.
pub fn atomic_write<P: AsRef<Path>>(path: P, contents: &[u8], tid: &TransactionId) -> Result<()> {
    let path = path.as_ref();
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    ensure_dir(&dir)?;
    let mut tmp = match tempfile::NamedTempFile::new_in(&dir) {
        Ok(t) => t,
        Err(e) => crate::bail_error!(tid=tid, error=%e, dir=%dir.display(), "Failed to create temporary file"),
    };
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    match tmp.persist(path) {
        Ok(_) => {
            debug!(tid=tid, path=%path.display(), bytes=contents.len(), "Atomically wrote file");
            Ok(())
        },
        Err(e) => crate::bail_error!(tid=tid, error=%e.error, path=%path.display(), "Failed to move temporary file into place"),
    }
}
