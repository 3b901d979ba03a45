use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::clock::FrameIndex;
use crate::error::{CaptureError, Result};

const HEADER: &str = "frame,frame_time_ms";

/// Append-only CSV of per-frame render times.
pub struct TimingCapture {
    path: PathBuf,
    out: BufWriter<File>,
    rows: u64,
}

impl TimingCapture {
    /// Opens `path` for appending, writing the header when the file is new or empty.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CaptureError::io(parent, source))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| CaptureError::io(&path, source))?;
        let is_empty = file
            .metadata()
            .map_err(|source| CaptureError::io(&path, source))?
            .len()
            == 0;

        let mut out = BufWriter::new(file);
        if is_empty {
            writeln!(out, "{HEADER}").map_err(|source| CaptureError::io(&path, source))?;
        }
        Ok(Self { path, out, rows: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> u64 {
        self.rows
    }

    pub fn record(&mut self, frame: FrameIndex, frame_time_ms: f64) -> Result<()> {
        writeln!(self.out, "{frame},{frame_time_ms:.4}")
            .map_err(|source| CaptureError::io(&self.path, source))?;
        self.rows += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out
            .flush()
            .map_err(|source| CaptureError::io(&self.path, source))
    }
}
