//! Errors that decide how the monitor reacts to a failure.
//! They travel inside [anyhow::Error] and are recovered with `downcast_ref`.

#[derive(Debug)]
/// The monitored application raised or was killed
pub struct ScriptError {
    pub message: String,
}
impl std::fmt::Display for ScriptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Application failed: {}", self.message)?;
        Ok(())
    }
}
impl std::error::Error for ScriptError {}

#[derive(Debug)]
/// A sampling worker could not start, or died before handing back its data
pub struct SubprocessError {
    pub rank: usize,
    pub message: String,
}
impl std::fmt::Display for SubprocessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Sampling worker on rank {} failed: {}", self.rank, self.message)?;
        Ok(())
    }
}
impl std::error::Error for SubprocessError {}

#[derive(Debug)]
/// The application target does not exist
pub struct AppNotFoundError {
    pub target: String,
}
impl std::fmt::Display for AppNotFoundError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Application target '{}' was not found", self.target)?;
        Ok(())
    }
}
impl std::error::Error for AppNotFoundError {}

#[derive(Debug)]
/// A collective operation could not complete because peers are unreachable
pub struct CollectiveUnavailableError {
    pub operation: &'static str,
    pub unreachable: Vec<usize>,
}
impl std::fmt::Display for CollectiveUnavailableError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Collective '{}' could not complete, unreachable ranks: {:?}",
            self.operation, self.unreachable
        )?;
        Ok(())
    }
}
impl std::error::Error for CollectiveUnavailableError {}

#[derive(Debug)]
/// Metrics that cannot be combined, indicates a bug rather than a runtime condition
pub struct ProcessingError {
    pub message: String,
}
impl std::fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(f, "Processing error: {}", self.message)?;
        Ok(())
    }
}
impl std::error::Error for ProcessingError {}

/// True if `err` is, or wraps, an `E`.
pub fn is_error<E>(err: &anyhow::Error) -> bool
where
    E: std::error::Error + 'static,
{
    err.chain().any(|e| e.downcast_ref::<E>().is_some())
}
