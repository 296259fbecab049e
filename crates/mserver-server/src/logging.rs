//! Log output
//!
//! Records go to `logging.file` when one is configured. Without one they go
//! to stdout, or to stderr when stdout carries an inetd session. A server
//! that detaches has its standard streams pointed at `/dev/null`, so it
//! refuses to start without a log file.

use anyhow::{bail, Context, Result};
use mserver_common::config::LoggingConfig;
use std::fs::OpenOptions;
use std::io;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// What the standard streams are used for while the server runs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Streams {
    /// Attached to the terminal and free for logging
    Free,
    /// stdin/stdout carry the session (inetd, interactive)
    Session,
    /// Closed once the server detaches
    Detached,
}

/// Destination of formatted records
pub struct Sink {
    pub writer: BoxMakeWriter,
    /// Colour escapes only make sense on a terminal
    pub ansi: bool,
}

/// Pick the destination for `logging`
pub fn make_sink(logging: &LoggingConfig, streams: Streams) -> Result<Sink> {
    if let Some(path) = &logging.file {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("cannot open log file {}", path.display()))?;
        return Ok(Sink {
            writer: BoxMakeWriter::new(Mutex::new(file)),
            ansi: false,
        });
    }

    match streams {
        Streams::Free => Ok(Sink {
            writer: BoxMakeWriter::new(io::stdout),
            ansi: true,
        }),
        Streams::Session => Ok(Sink {
            writer: BoxMakeWriter::new(io::stderr),
            ansi: false,
        }),
        Streams::Detached => {
            bail!("logging.file must be set unless the server runs in the foreground")
        }
    }
}

/// Install the global subscriber
pub fn init_logging(logging: &LoggingConfig, streams: Streams) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let sink = make_sink(logging, streams)?;

    let registry = tracing_subscriber::registry().with(filter);
    if logging.format == "json" {
        registry
            .with(fmt::layer().json().with_writer(sink.writer))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(sink.ansi)
                    .with_writer(sink.writer),
            )
            .init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mserver_core::daemon;
    use nix::sys::wait::{waitpid, WaitStatus};
    use nix::unistd::{fork, ForkResult};
    use std::fs;
    use std::path::Path;
    use std::thread;
    use std::time::Duration;
    use tempfile::TempDir;
    use tracing::error;

    fn to_file(path: &Path) -> LoggingConfig {
        LoggingConfig {
            file: Some(path.to_path_buf()),
            ..LoggingConfig::default()
        }
    }

    #[test]
    fn test_detached_without_file_is_refused() {
        let err = make_sink(&LoggingConfig::default(), Streams::Detached)
            .err()
            .unwrap();
        assert!(err.to_string().contains("logging.file"));

        assert!(make_sink(&LoggingConfig::default(), Streams::Free).unwrap().ansi);
        assert!(!make_sink(&LoggingConfig::default(), Streams::Session).unwrap().ansi);
    }

    #[test]
    fn test_unwritable_log_file() {
        let logging = to_file(Path::new("/nonexistent/mserver/mserver.log"));
        assert!(make_sink(&logging, Streams::Free).is_err());
    }

    #[test]
    fn test_file_sink_survives_daemonize() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("mserver.log");
        let sink = make_sink(&to_file(&path), Streams::Detached).unwrap();
        assert!(!sink.ansi);

        // SAFETY: the child only detaches, logs one record and exits.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => {
                let subscriber = tracing_subscriber::fmt()
                    .with_ansi(sink.ansi)
                    .with_writer(sink.writer)
                    .finish();
                if daemon::daemonize().is_err() {
                    std::process::exit(2);
                }
                tracing::subscriber::with_default(subscriber, || {
                    error!("no servers configured: exiting");
                });
                std::process::exit(0);
            }
            ForkResult::Parent { child } => {
                // daemon() exits the intermediate process with status 0
                assert_eq!(waitpid(child, None).unwrap(), WaitStatus::Exited(child, 0));
            }
        }

        let mut content = String::new();
        for _ in 0..500 {
            content = fs::read_to_string(&path).unwrap_or_default();
            if content.contains("no servers configured: exiting") {
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(
            content.contains("ERROR") && content.contains("no servers configured: exiting"),
            "log file holds {:?}",
            content
        );
    }
}
