use crate::transaction::TransactionId;
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use time::format_description::FormatItem;
use time::{format_description, OffsetDateTime, UtcOffset};
use tracing::warn;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;

/// The global [LocalTime], created on first use.
static CLOCK: Mutex<Option<Arc<LocalTime>>> = Mutex::new(None);

/// Gets the process-wide [LocalTime]. Creates it if not present.
pub fn get_global_clock(tid: &TransactionId) -> Result<Arc<LocalTime>> {
    if let Some(clk) = CLOCK.lock().as_ref() {
        return Ok(clk.clone());
    }
    let clk = LocalTime::boxed(tid)?;
    *CLOCK.lock() = Some(clk.clone());
    Ok(clk)
}

/// Get the current [Instant]
#[inline(always)]
pub fn now() -> Instant {
    // allow here because we want all code to use this method
    #[allow(clippy::disallowed_methods)]
    Instant::now()
}

/// Nanoseconds since the unix epoch.
/// Sample timestamps use this so ranks on one host share a time base.
#[inline(always)]
pub fn unix_nanos() -> u64 {
    #[allow(clippy::disallowed_methods)]
    let since = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    since.as_nanos() as u64
}

pub fn timezone(tid: &TransactionId) -> Result<String> {
    let mut tz_str = match std::fs::read_to_string("/etc/timezone") {
        Ok(t) => t,
        Err(e) => {
            warn!(tid=tid, error=%e, "/etc/timezone is missing, using UTC");
            "UTC".to_owned()
        },
    };
    tz_str.truncate(tz_str.trim_end().len());
    if tzdb::tz_by_name(&tz_str).is_some() {
        return Ok(tz_str);
    }
    anyhow::bail!("local timezone string was invalid: {}", tz_str)
}

fn load_local_offset(from_time: OffsetDateTime, tid: &TransactionId) -> Result<UtcOffset> {
    let tz_str = match timezone(tid) {
        Ok(t) => t,
        Err(e) => {
            warn!(tid=tid, error=%e, "Falling back to UTC timestamps");
            return Ok(UtcOffset::UTC);
        },
    };
    let time_zone = match tzdb::tz_by_name(&tz_str) {
        Some(t) => t,
        None => anyhow::bail!("parsed local timezone string was invalid: {}", tz_str),
    };
    let tm = match time_zone.find_local_time_type(from_time.unix_timestamp()) {
        Ok(t) => t,
        Err(e) => bail_error!(tid=tid, error=%e, "Failed to find time zone type"),
    };
    Ok(UtcOffset::from_whole_seconds(tm.ut_offset())?)
}

/// Serves timestamps as local time.
/// Used for log lines and for the date metadata stored on result nodes.
pub struct LocalTime {
    format: Vec<FormatItem<'static>>,
    local_offset: UtcOffset,
}
impl LocalTime {
    pub fn new(tid: &TransactionId) -> Result<Self> {
        let format = format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]")?;
        #[allow(clippy::disallowed_methods)]
        let now = OffsetDateTime::now_utc();
        let offset = load_local_offset(now, tid)?;
        Ok(LocalTime {
            format,
            local_offset: offset,
        })
    }
    pub fn boxed(tid: &TransactionId) -> Result<Arc<Self>> {
        Ok(Arc::new(Self::new(tid)?))
    }

    pub fn now(&self) -> OffsetDateTime {
        #[allow(clippy::disallowed_methods)]
        OffsetDateTime::now_utc().to_offset(self.local_offset)
    }
    pub fn now_str(&self) -> Result<String> {
        self.format_time(self.now())
    }
    pub fn format_time(&self, time: OffsetDateTime) -> Result<String> {
        Ok(time.format(&self.format)?)
    }
}

/// Dummy wrapper for [LocalTime] to make logging framework happy.
pub struct ClockWrapper(pub Arc<LocalTime>);
impl FormatTime for ClockWrapper {
    #[inline(always)]
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        let s = match self.0.now_str() {
            Ok(s) => s,
            Err(e) => {
                println!("time formatting error: {}", e);
                return Err(std::fmt::Error {});
            },
        };
        w.write_str(s.as_str())
    }
}

/// The current local time, formatted for storing in node metadata.
pub fn local_now_str(tid: &TransactionId) -> Result<String> {
    get_global_clock(tid)?.now_str()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TEST_TID;

    #[test]
    fn unix_nanos_moves_forward() {
        let a = unix_nanos();
        std::thread::sleep(Duration::from_millis(2));
        let b = unix_nanos();
        assert!(b > a);
    }

    #[test]
    fn formats_local_time() {
        let s = local_now_str(&TEST_TID).unwrap();
        let parsed = time::PrimitiveDateTime::parse(
            &s,
            &format_description::parse("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:6]").unwrap(),
        );
        assert!(parsed.is_ok(), "could not parse '{}'", s);
    }
}
