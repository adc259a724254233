//! Process-wide log fan-out.
//!
//! The runner-log meta-probe binds a per-run `runner.log` file for the
//! lifetime of its scope. Mirroring how multiple handlers on a root logger
//! behave, every registered sink receives every formatted log line; with
//! concurrent thread groups the files interleave all groups' output.
//!
//! The host process (CLI or test harness) opts in by wiring
//! [`tee_writer`] as an additional subscriber writer.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

static SINKS: OnceLock<Mutex<HashMap<u64, Arc<Mutex<File>>>>> = OnceLock::new();
static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

fn sinks() -> &'static Mutex<HashMap<u64, Arc<Mutex<File>>>> {
    SINKS.get_or_init(|| Mutex::new(HashMap::new()))
}

/// Handle for a registered log sink. The sink stays active until
/// [`LogSinkGuard::release`] (or drop).
#[derive(Debug)]
pub struct LogSinkGuard {
    id: u64,
}

impl LogSinkGuard {
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for LogSinkGuard {
    fn drop(&mut self) {
        sinks().lock().remove(&self.id);
    }
}

/// Creates `path` and registers it to receive all subsequent log output.
pub fn register_sink(path: &Path) -> io::Result<LogSinkGuard> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let id = NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed);
    sinks().lock().insert(id, Arc::new(Mutex::new(file)));
    Ok(LogSinkGuard { id })
}

/// `io::Write` fan-out over all registered sinks. Write errors on single
/// sinks are swallowed so logging can never fail a run.
pub struct TeeWriter;

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let sinks = sinks().lock().values().cloned().collect::<Vec<_>>();
        for sink in sinks {
            let _ = sink.lock().write_all(buf);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        let sinks = sinks().lock().values().cloned().collect::<Vec<_>>();
        for sink in sinks {
            let _ = sink.lock().flush();
        }
        Ok(())
    }
}

/// `MakeWriter`-compatible constructor for subscriber wiring.
pub fn tee_writer() -> TeeWriter {
    TeeWriter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_creates_file_and_receives_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runner.log");
        let guard = register_sink(&path).unwrap();
        assert!(path.is_file());

        let mut writer = TeeWriter;
        writer.write_all(b"hello\n").unwrap();
        writer.flush().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("hello"));

        guard.release();
        writer.write_all(b"after\n").unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("after"));
    }
}
