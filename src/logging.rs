//! Log initialization.
//!
//! The wire format is fixed by the design: one line per event, `[YYYY-MM-DD HH:MM:SS]
//! [LEVEL] message`, written to both stdout and a well-known file. Built on `tracing` +
//! `tracing-subscriber` rather than hand-rolled formatting so the rest of the crate gets
//! structured fields, spans, and level filtering for free; only the final rendering is
//! pinned to the fixed shape.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::format::{self, FormatEvent, FormatFields};
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::fmt::{FmtContext, MakeWriter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::Error;

/// `INFO` is the default; `WARNING` and `ERROR` are the only other tags the design
/// recognizes. `DEBUG`/`TRACE` collapse into `INFO` in the rendered line (they're
/// still filterable via `RUST_LOG` before they get here).
fn level_tag(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        _ => "INFO",
    }
}

struct FleetFormat;

impl<S, N> FormatEvent<S, N> for FleetFormat
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        write!(writer, "[{now}] [{}] ", level_tag(event.metadata().level()))?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[derive(Clone)]
struct SharedFile(Arc<Mutex<std::fs::File>>);

struct SharedFileGuard(Arc<Mutex<std::fs::File>>);

impl io::Write for SharedFileGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("log file mutex poisoned").write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.lock().expect("log file mutex poisoned").flush()
    }
}

impl<'a> MakeWriter<'a> for SharedFile {
    type Writer = SharedFileGuard;

    fn make_writer(&'a self) -> Self::Writer {
        SharedFileGuard(self.0.clone())
    }
}

/// Initializes the global subscriber. `truncate` mirrors the design's rule: the
/// orchestrator truncates the log at the start of a full update run and never
/// truncates in check mode.
pub fn init(log_file: &Path, truncate: bool) -> Result<(), Error> {
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .append(!truncate)
        .truncate(truncate)
        .open(log_file)?;

    let writer = io::stdout.and(SharedFile(Arc::new(Mutex::new(file))));

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = tracing_subscriber::fmt::layer()
        .event_format(FleetFormat)
        .with_writer(writer)
        .with_ansi(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| Error::from(err.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_tag_collapses_debug_and_trace_into_info() {
        assert_eq!(level_tag(&Level::DEBUG), "INFO");
        assert_eq!(level_tag(&Level::TRACE), "INFO");
        assert_eq!(level_tag(&Level::INFO), "INFO");
        assert_eq!(level_tag(&Level::WARN), "WARNING");
        assert_eq!(level_tag(&Level::ERROR), "ERROR");
    }

    #[test]
    fn init_writes_a_line_to_the_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("fleetd.log");
        // tracing's global subscriber can only be installed once per process; this
        // test only verifies the file is created and appendable, not the subscriber
        // installation itself.
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&log_path)
            .unwrap();
        drop(file);
        assert!(log_path.exists());
    }
}
