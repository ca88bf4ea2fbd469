//! Reopenable log target.
//!
//! The tracing subscriber writes through a shared handle whose underlying
//! file can be swapped at runtime, which is what the reopen-logs command
//! needs: close and reopen the path so an external rotator can move the
//! old file away. The handle is cloned into every forked process; each
//! process reopens its own descriptor when told to.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing_subscriber::fmt::MakeWriter;

enum LogSink {
    Stderr,
    File { path: PathBuf, file: File },
}

/// Shared, reopenable destination for the error log.
#[derive(Clone)]
pub struct LogTarget {
    inner: Arc<Mutex<LogSink>>,
}

impl LogTarget {
    pub fn stderr() -> Self {
        Self {
            inner: Arc::new(Mutex::new(LogSink::Stderr)),
        }
    }

    pub fn file(path: PathBuf) -> io::Result<Self> {
        let file = open_log(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(LogSink::File { path, file })),
        })
    }

    /// Close and reopen the log file at its configured path. A stderr
    /// target has nothing to reopen.
    pub fn reopen(&self) -> io::Result<()> {
        let mut sink = self.inner.lock().expect("log sink poisoned");
        if let LogSink::File { path, file } = &mut *sink {
            *file = open_log(path)?;
        }
        Ok(())
    }

    /// Point the target at a different destination (error_log changed on
    /// reload). Subsequent writes from any clone go to the new sink.
    pub fn retarget(&self, path: Option<PathBuf>) -> io::Result<()> {
        let new_sink = match path {
            None => LogSink::Stderr,
            Some(p) => {
                let file = open_log(&p)?;
                LogSink::File { path: p, file }
            }
        };
        let mut sink = self.inner.lock().expect("log sink poisoned");
        *sink = new_sink;
        Ok(())
    }

    pub fn path(&self) -> Option<PathBuf> {
        let sink = self.inner.lock().expect("log sink poisoned");
        match &*sink {
            LogSink::Stderr => None,
            LogSink::File { path, .. } => Some(path.clone()),
        }
    }
}

fn open_log(path: &PathBuf) -> io::Result<File> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            std::fs::create_dir_all(dir)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

pub struct LogWriter {
    inner: Arc<Mutex<LogSink>>,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut sink = self.inner.lock().expect("log sink poisoned");
        match &mut *sink {
            LogSink::Stderr => io::stderr().write(buf),
            LogSink::File { file, .. } => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut sink = self.inner.lock().expect("log sink poisoned");
        match &mut *sink {
            LogSink::Stderr => io::stderr().flush(),
            LogSink::File { file, .. } => file.flush(),
        }
    }
}

impl<'a> MakeWriter<'a> for LogTarget {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: Arc::clone(&self.inner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("palisade-log-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_file_target_writes_and_reopens() {
        let path = scratch_path("reopen");
        let target = LogTarget::file(path.clone()).expect("open");
        {
            let mut w = target.make_writer();
            w.write_all(b"before\n").expect("write");
            w.flush().expect("flush");
        }

        // Simulate rotation: move the file away, then reopen.
        let rotated = scratch_path("rotated");
        std::fs::rename(&path, &rotated).expect("rename");
        target.reopen().expect("reopen");
        {
            let mut w = target.make_writer();
            w.write_all(b"after\n").expect("write");
            w.flush().expect("flush");
        }

        assert_eq!(std::fs::read_to_string(&rotated).unwrap(), "before\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "after\n");
        std::fs::remove_file(&path).ok();
        std::fs::remove_file(&rotated).ok();
    }

    #[test]
    fn test_stderr_target_reopen_is_noop() {
        let target = LogTarget::stderr();
        assert!(target.path().is_none());
        target.reopen().expect("reopen");
    }
}
