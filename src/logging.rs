use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;
use tracing_subscriber::fmt::MakeWriter;

/// Sends log lines to stderr, and to a log file when one is configured.
/// Stdout is left to the event stream.
#[derive(Clone)]
pub(crate) struct LogMakeWriter {
    file: Option<Arc<Mutex<File>>>,
    echo_stderr: bool,
}

impl<'a> MakeWriter<'a> for LogMakeWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            file: self.file.clone(),
            echo_stderr: self.echo_stderr,
        }
    }
}

pub(crate) struct LogWriter {
    file: Option<Arc<Mutex<File>>>,
    echo_stderr: bool,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if let Some(file) = &self.file {
            let mut file = file.lock().unwrap_or_else(|e| e.into_inner());
            file.write_all(buf)?;
        }
        if self.echo_stderr {
            std::io::stderr().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if let Some(file) = &self.file {
            file.lock().unwrap_or_else(|e| e.into_inner()).flush()?;
        }
        if self.echo_stderr {
            std::io::stderr().flush()?;
        }
        Ok(())
    }
}

/// Parses a level name from the config or the command line. Unknown names
/// yield `None`.
pub fn parse_level(name: &str) -> Option<Level> {
    Level::from_str(name.trim()).ok()
}

/// Installs the global subscriber. With a log file, lines go only to the
/// file, without ANSI colors.
pub fn init(level: Level, log_file: Option<&Path>) -> Result<()> {
    let file = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(Arc::new(Mutex::new(file)))
        }
        None => None,
    };
    let make_writer = LogMakeWriter {
        echo_stderr: file.is_none(),
        file,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_ansi(log_file.is_none())
        .with_target(false)
        .with_writer(make_writer)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok(); // already set in tests
    Ok(())
}
