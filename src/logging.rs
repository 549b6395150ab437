//! Subscriber setup: one global stderr subscriber per binary, plus a private dispatcher per job
//! that appends to the job's log file.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Arc;
use tracing::Dispatch;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Installs the process-wide stderr subscriber, filtered by `RUST_LOG` (default `info`).
///
/// Calling it twice is harmless; the second call leaves the first subscriber in place.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().with_target(false).with_writer(io::stderr))
        .try_init();
}

/// Builds a dispatcher that appends to `log_path` and echoes to stderr.
///
/// Attach it to a job future with [`tracing::instrument::WithSubscriber`] so concurrent jobs
/// never share a log file.
pub fn job_dispatch(log_path: &Path) -> io::Result<Dispatch> {
    if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_path)?;

    let subscriber = tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(Arc::new(file)),
        )
        .with(fmt::layer().with_target(false).with_writer(io::stderr));
    Ok(Dispatch::new(subscriber))
}

#[cfg(test)]
pub(crate) use capture::CapturedLogs;

#[cfg(test)]
mod capture {
    use std::io::{self, Write};
    use std::sync::{Arc, Mutex};
    use tracing::Dispatch;
    use tracing_subscriber::fmt;

    /// In-memory sink for asserting on log output.
    #[derive(Clone, Default)]
    pub(crate) struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        pub(crate) fn dispatch(&self) -> Dispatch {
            let buffer = self.clone();
            let subscriber = fmt()
                .with_max_level(tracing::Level::INFO)
                .with_ansi(false)
                .with_target(false)
                .with_writer(move || buffer.clone())
                .finish();
            Dispatch::new(subscriber)
        }

        pub(crate) fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
