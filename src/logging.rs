use std::future::Future;
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use flexi_logger::{Cleanup, Criterion, DeferredNow, Duplicate, FileSpec, Logger as FlexiLogger, Naming, WriteMode};
use log::{LevelFilter, Record};
use tokio::task_local;

use crate::config::Logger;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

#[derive(Clone, Copy)]
struct LineFormat {
    pid: bool,
    caller: bool,
    trace_id: bool,
}

static LINE_FORMAT: OnceLock<LineFormat> = OnceLock::new();

task_local! {
    static TRACE_ID: String;
}

pub fn init(config: &Logger, verbose: bool) -> Result<()> {
    let level = if verbose {
        LevelFilter::Debug
    } else {
        parse_level(&config.level)
    };

    LINE_FORMAT.get_or_init(|| LineFormat {
        pid: !config.nopid,
        caller: config.caller,
        trace_id: config.traceid,
    });

    let mut logger = FlexiLogger::try_with_str(level.as_str())
        .context("init logger")?
        .duplicate_to_stderr(Duplicate::Warn)
        .format_for_stdout(format_line);

    if !config.path.trim().is_empty() {
        let spec = FileSpec::try_from(Path::new(&config.path)).context("logger path")?;
        let mut file_logger = logger.log_to_file(spec).format(format_line);
        if config.max_size > 0 {
            let cleanup = if config.max_backups > 0 {
                Cleanup::KeepLogFiles(config.max_backups as usize)
            } else {
                Cleanup::Never
            };
            file_logger = file_logger.rotate(Criterion::Size(config.max_size * 1024 * 1024), Naming::Numbers, cleanup);
        }
        logger = file_logger.write_mode(WriteMode::BufferAndFlush);
    }

    logger.start().context("start logger")?;
    Ok(())
}

fn parse_level(raw: &str) -> LevelFilter {
    match raw.to_ascii_lowercase().as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "warn" | "warning" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        "off" => LevelFilter::Off,
        _ => LevelFilter::Info,
    }
}

fn format_line(writer: &mut dyn Write, now: &mut DeferredNow, record: &Record) -> std::io::Result<()> {
    let cfg = LINE_FORMAT.get().copied().unwrap_or(LineFormat {
        pid: true,
        caller: false,
        trace_id: true,
    });
    write!(writer, "{} [{}]", now.now_utc_owned().format(TIMESTAMP_FORMAT), record.level())?;
    if cfg.pid {
        write!(writer, " pid={}", std::process::id())?;
    }
    if cfg.trace_id {
        let trace_id = current_trace_id().unwrap_or_else(|| "-".to_string());
        write!(writer, " trace_id={trace_id}")?;
    }
    if cfg.caller {
        write!(writer, " {}:{}", record.file().unwrap_or("-"), record.line().unwrap_or(0))?;
    }
    writeln!(writer, " {}", record.args())
}

/// Runs `fut` with `trace_id` attached to every log line it emits.
pub async fn with_trace_id<T>(trace_id: String, fut: impl Future<Output = T>) -> T {
    TRACE_ID.scope(trace_id, fut).await
}

pub fn current_trace_id() -> Option<String> {
    TRACE_ID.try_with(|id| id.clone()).ok()
}
