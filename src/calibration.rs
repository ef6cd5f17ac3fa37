// Calibration stream: a time-bucketed rotating binary file receiving every
// word verbatim. Owned by the readout worker; rotation failures are
// recoverable warnings, the readout never stops for the sink.

use crate::word::Word;
use chrono::Local;
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Rotating raw-word sink. File names encode the local wall-clock time as
/// `<dir>/<prefix>_YYYY-MM-DD_HH.MM.SS.calib`.
#[derive(Debug)]
pub struct CalibrationSink {
    dir: PathBuf,
    prefix: String,
    interval: Duration,
    file: Option<File>,
    current_path: PathBuf,
    last_open: Instant,
}

impl CalibrationSink {
    /// Open the first calibration file. `prefix` is typically the run tag
    /// (`run<N>`); an underscore separator is appended when non-empty.
    pub fn create(dir: &str, prefix: &str, interval: Duration) -> io::Result<Self> {
        let mut prefix = prefix.to_string();
        if !prefix.is_empty() {
            prefix.push('_');
        }
        let mut sink = CalibrationSink {
            dir: PathBuf::from(dir),
            prefix,
            interval,
            file: None,
            current_path: PathBuf::new(),
            last_open: Instant::now(),
        };
        sink.open_file()?;
        Ok(sink)
    }

    fn open_file(&mut self) -> io::Result<()> {
        let stamp = Local::now().format("%Y-%m-%d_%H.%M.%S");
        let path = self.dir.join(format!("{}{}.calib", self.prefix, stamp));
        let file = File::create(&path)?;
        info!(path = %path.display(), "new calibration stream file");
        self.file = Some(file);
        self.current_path = path;
        self.last_open = Instant::now();
        Ok(())
    }

    /// Rotation check, called once per packet: when the current file has been
    /// open for at least the configured interval, close it and open a fresh
    /// one. An open failure drops the sink into a fileless state until the
    /// next rotation attempt.
    pub fn maybe_rotate(&mut self) {
        if self.last_open.elapsed() < self.interval {
            return;
        }
        self.file.take();
        if let Err(e) = self.open_file() {
            warn!(error = %e, "cannot open new calibration file, stream suspended");
        }
    }

    /// Append the raw 16 bytes of a word and flush.
    pub fn append(&mut self, word: &Word) {
        let Some(file) = self.file.as_mut() else {
            return;
        };
        let result = file.write_all(word.raw()).and_then(|()| file.flush());
        if let Err(e) = result {
            warn!(error = %e, path = %self.current_path.display(),
                "calibration write failed, stream suspended");
            self.file = None;
        }
    }

    pub fn current_path(&self) -> &Path {
        &self.current_path
    }
}
