//! Log stream setup.
//!
//! One `env_logger` stream, formatted as
//! `<timestamp> - <target> - <level> - <message>`, written to the log file
//! and/or the console. `RUST_LOG` overrides the configured level.

use anyhow::{Context, Result};
use env_logger::{Env, Target};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Writer duplicating every line to the log file and stderr.
pub struct LogSink {
    file: Option<File>,
    console: bool,
}

impl LogSink {
    pub fn open(file: Option<&Path>, console: bool) -> Result<Self> {
        let file = match file {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("failed to open log file '{}'", path.display()))?,
            ),
            None => None,
        };
        Ok(Self { file, console })
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Some(file) = &mut self.file {
            file.write_all(buf)?;
        }
        if self.console {
            io::stderr().write_all(buf)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Some(file) = &mut self.file {
            file.flush()?;
        }
        if self.console {
            io::stderr().flush()?;
        }
        Ok(())
    }
}

pub fn init(level: &str, file: Option<&Path>, console: bool) -> Result<()> {
    let sink = LogSink::open(file, console)?;
    env_logger::Builder::from_env(Env::default().default_filter_or(level))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {} - {}",
                buf.timestamp(),
                record.target(),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(sink)))
        .try_init()
        .context("logger already initialised")
}
