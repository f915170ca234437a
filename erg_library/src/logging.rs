use crate::clock::{get_global_clock, ClockWrapper};
use crate::transaction::TransactionId;
use crate::utils::file_utils::ensure_dir;
use anyhow::Result;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::Registry;

#[derive(Debug, serde::Deserialize, serde::Serialize, Clone)]
/// Details about how/where to log to
pub struct LoggingConfig {
    /// the min log level
    /// see [tracing_subscriber::filter::Builder::parse()]
    pub level: String,
    /// Directory to store per-rank JSON logs in.
    /// Empty disables file logging.
    pub directory: String,
    /// Additionally write logs to stdout.
    #[serde(default)]
    pub stdout: Option<bool>,
    /// Write to stdout from every rank, not just rank 0.
    #[serde(default)]
    pub stdout_all_ranks: bool,
    /// log filename start string, the rank number is appended to it
    pub basename: String,
    /// Span events to log, e.g. `NEW+CLOSE`.
    /// look at for details [mod@tracing_subscriber::fmt::format]
    #[serde(default)]
    pub spanning: String,
}
impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_string(),
            directory: String::new(),
            stdout: Some(true),
            stdout_all_ranks: false,
            basename: "erg".to_string(),
            spanning: "NONE".to_string(),
        }
    }
}
impl LoggingConfig {
    /// Ranks other than 0 stay quiet on stdout unless asked otherwise.
    fn stdout_for(&self, rank: usize) -> bool {
        self.stdout.unwrap_or(false) && (rank == 0 || self.stdout_all_ranks)
    }
}

fn parse_span(span: &str) -> Result<FmtSpan> {
    Ok(match span {
        "NEW" => FmtSpan::NEW,
        "ENTER" => FmtSpan::ENTER,
        "EXIT" => FmtSpan::EXIT,
        "CLOSE" => FmtSpan::CLOSE,
        "NONE" | "" => FmtSpan::NONE,
        "ACTIVE" => FmtSpan::ACTIVE,
        "FULL" => FmtSpan::FULL,
        _ => anyhow::bail!("Unknown spanning value {}", span),
    })
}
fn str_to_span(spanning: &str) -> Result<FmtSpan> {
    spanning
        .split('+')
        .map(parse_span)
        .try_fold(FmtSpan::NONE, |acc, item| Ok(acc | item?))
}

/// `<directory>/<basename>_<rank>.log`, emptied at startup so each execution starts a fresh file.
fn rank_log_file(directory: &str, basename: &str, rank: usize) -> Result<(NonBlocking, WorkerGuard)> {
    ensure_dir(PathBuf::from(directory))?;
    let fname = format!("{}_{}.log", basename, rank);
    let full_path = Path::new(directory).join(&fname);
    if let Err(e) = std::fs::remove_file(&full_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            anyhow::bail!("Failed to remove old log file '{}' because '{}'", full_path.display(), e);
        }
    }
    Ok(tracing_appender::non_blocking(tracing_appender::rolling::never(directory, fname)))
}

/// Route panics on any thread of this rank into the log, then report them as usual.
fn panic_hook(rank: usize) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let thread = std::thread::current();
        let msg = match info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match info.payload().downcast_ref::<String>() {
                Some(s) => s.as_str(),
                None => "Box<Any>",
            },
        };
        let location = info.location().map(|l| format!("{}:{}", l.file(), l.line()));
        tracing::error!(
            target: "panic",
            rank = rank,
            thread = thread.name().unwrap_or("<unnamed>"),
            location = ?location,
            "Thread panicked: {}",
            msg
        );
        previous(info);
    }));
}

/// Install the global tracing subscriber.
/// Every rank logs to its own file, `<basename>_<rank>.log`.
/// The returned guards flush the non-blocking writers when dropped and must be held until exit.
pub fn start_tracing(config: &LoggingConfig, rank: usize, tid: &TransactionId) -> Result<impl Drop> {
    let mut guards: Vec<WorkerGuard> = vec![];

    let file_layer = match config.directory.is_empty() {
        true => None,
        false => {
            let (file_writer, guard) = rank_log_file(&config.directory, &config.basename, rank)?;
            guards.push(guard);
            Some(
                tracing_subscriber::fmt::Layer::default()
                    .with_span_events(str_to_span(&config.spanning)?)
                    .with_timer(ClockWrapper(get_global_clock(tid)?))
                    .with_writer(file_writer)
                    .json(),
            )
        },
    };

    let stdout_layer = match config.stdout_for(rank) {
        true => {
            let (stdout, guard) = tracing_appender::non_blocking(std::io::stdout());
            guards.push(guard);
            Some(
                tracing_subscriber::fmt::Layer::default()
                    .with_timer(ClockWrapper(get_global_clock(tid)?))
                    .with_writer(stdout)
                    .compact(),
            )
        },
        false => None,
    };

    let subscriber = Registry::default()
        .with(EnvFilter::builder().parse(&config.level)?)
        .with(file_layer)
        .with(stdout_layer);
    match tracing::subscriber::set_global_default(subscriber) {
        Ok(_) => {
            panic_hook(rank);
            info!(tid=tid, rank=rank, "Logger initialized");
        },
        Err(e) => warn!(tid=tid, error=%e, "Global tracing subscriber was already set"),
    }
    Ok(guards)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("NONE", FmtSpan::NONE)]
    #[case("", FmtSpan::NONE)]
    #[case("NEW+CLOSE", FmtSpan::NEW | FmtSpan::CLOSE)]
    #[case("FULL", FmtSpan::FULL)]
    fn spanning_parses(#[case] input: &str, #[case] expected: FmtSpan) {
        assert_eq!(str_to_span(input).unwrap(), expected);
    }

    #[test]
    fn bad_spanning_errors() {
        assert!(str_to_span("NEW+SOMETIMES").is_err());
    }

    #[rstest]
    #[case(Some(true), false, 0, true)]
    #[case(Some(true), false, 3, false)]
    #[case(Some(true), true, 3, true)]
    #[case(None, true, 0, false)]
    fn stdout_only_from_rank_zero_by_default(
        #[case] stdout: Option<bool>,
        #[case] all_ranks: bool,
        #[case] rank: usize,
        #[case] expected: bool,
    ) {
        let cfg = LoggingConfig {
            stdout,
            stdout_all_ranks: all_ranks,
            ..Default::default()
        };
        assert_eq!(cfg.stdout_for(rank), expected);
    }

    #[test]
    fn old_rank_log_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let pth = dir.path().join("erg_2.log");
        std::fs::write(&pth, "stale").unwrap();
        let (writer, guard) = rank_log_file(dir.path().to_str().unwrap(), "erg", 2).unwrap();
        drop(writer);
        drop(guard);
        assert!(!std::fs::read_to_string(&pth).unwrap_or_default().contains("stale"));
    }
}
