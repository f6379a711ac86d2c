//! Background task that appends a timestamp record to the log on a fixed
//! interval.

use crate::error::Error;
use crate::shared_log::SharedLog;
use crate::shutdown::TerminationFlag;
use chrono::{DateTime, Local, TimeZone};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace};

/// Render one log record: `timestamp:<RFC 2822 time>\n`.
pub fn format_record<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!("timestamp:{}\n", now.to_rfc2822())
}

/// Append a timestamp record every `period` until termination.
///
/// The first record is written one full period after start. Only `append`
/// is used; this worker never replays.
pub async fn run(log: Arc<SharedLog>, termination: TerminationFlag, period: Duration) {
    let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    debug!(period_ms = period.as_millis() as u64, "Timestamp writer started");

    loop {
        tokio::select! {
            biased;
            _ = termination.stopping() => break,
            _ = interval.tick() => {}
        }
        if !termination.is_running() {
            break;
        }

        let record = format_record(&Local::now());
        match log.append(record.as_bytes()).await {
            Ok(_) => trace!(record = record.trim_end(), "Timestamp written"),
            Err(Error::LogClosed) => break,
            Err(e) => error!(error = %e, "Failed to append timestamp"),
        }
    }

    debug!("Timestamp writer stopped");
}
