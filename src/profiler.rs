//! Windowed timing statistics.
//!
//! A capture window is opened with [`Profiler::start_capture`], fed with
//! per-frame samples and closed with [`Profiler::end_capture`], which computes
//! a [`Stat`] for every event that received at least one sample.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Serialize;

use crate::error::{CaptureError, Result};

/// Summary of one event's samples, in the samples' unit (milliseconds).
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Stat {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    /// Population standard deviation.
    pub stddev: f64,
}

impl Stat {
    /// Returns `None` for an empty series.
    pub fn from_samples(samples: &[f64]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let count = samples.len() as f64;
        let mean = samples.iter().sum::<f64>() / count;
        let (min, max) = samples
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(min, max), &sample| {
                (min.min(sample), max.max(sample))
            });
        let variance = samples
            .iter()
            .map(|sample| (sample - mean).powi(2))
            .sum::<f64>()
            / count;
        Some(Self {
            mean,
            min,
            max,
            stddev: variance.sqrt(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileEvent {
    pub stats: Stat,
    pub samples: Vec<f64>,
}

/// Closed capture window. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileCapture {
    events: BTreeMap<String, ProfileEvent>,
    frame_count: u64,
    /// False when the window was closed by an abort instead of `end_capture`.
    complete: bool,
}

impl ProfileCapture {
    pub fn events(&self) -> &BTreeMap<String, ProfileEvent> {
        &self.events
    }

    pub fn event(&self, name: &str) -> Result<&ProfileEvent> {
        self.events
            .get(name)
            .ok_or_else(|| CaptureError::UnknownEvent(name.to_owned()))
    }

    pub fn stat(&self, name: &str) -> Result<Stat> {
        self.event(name).map(|event| event.stats)
    }

    pub fn mean(&self, name: &str) -> Result<f64> {
        self.stat(name).map(|stat| stat.mean)
    }

    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|error| CaptureError::Encoding(format!("failed to serialize profile: {error}")))
    }

    pub fn write_json(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| CaptureError::io(parent, source))?;
        }
        let json = self.to_json_pretty()?;
        fs::write(path, json).map_err(|source| CaptureError::io(path, source))
    }
}

#[derive(Debug, Default)]
struct OpenWindow {
    events: BTreeMap<String, Vec<f64>>,
    frames: u64,
}

impl OpenWindow {
    fn close(self, complete: bool) -> ProfileCapture {
        let events = self
            .events
            .into_iter()
            .filter_map(|(name, samples)| {
                Stat::from_samples(&samples).map(|stats| (name, ProfileEvent { stats, samples }))
            })
            .collect();
        ProfileCapture {
            events,
            frame_count: self.frames,
            complete,
        }
    }
}

/// Records named duration samples inside one capture window at a time.
///
/// Samples recorded while no window is open, or while the profiler is
/// disabled, are dropped and `record_sample` returns `false`.
#[derive(Debug)]
pub struct Profiler {
    enabled: bool,
    window: Option<OpenWindow>,
    last: Option<ProfileCapture>,
}

impl Profiler {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            window: None,
            last: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn is_capturing(&self) -> bool {
        self.window.is_some()
    }

    pub fn start_capture(&mut self) -> Result<()> {
        if self.window.is_some() {
            return Err(CaptureError::State(
                "a profiling capture window is already open".to_owned(),
            ));
        }
        self.window = Some(OpenWindow::default());
        log::debug!("profiling capture started");
        Ok(())
    }

    pub fn record_sample(&mut self, event_name: &str, duration_ms: f64) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(window) = self.window.as_mut() else {
            return false;
        };
        if !duration_ms.is_finite() || duration_ms < 0.0 {
            log::warn!("dropping invalid sample {duration_ms} for '{event_name}'");
            return false;
        }
        window
            .events
            .entry(event_name.to_owned())
            .or_default()
            .push(duration_ms);
        true
    }

    /// Marks a frame boundary inside the open window.
    pub fn end_frame(&mut self) {
        if let Some(window) = self.window.as_mut() {
            window.frames += 1;
        }
    }

    pub fn end_capture(&mut self) -> Result<ProfileCapture> {
        let window = self.window.take().ok_or_else(|| {
            CaptureError::State("end_capture called without an open capture window".to_owned())
        })?;
        let capture = window.close(true);
        log::debug!(
            "profiling capture closed: {} frame(s), {} event(s)",
            capture.frame_count,
            capture.events.len()
        );
        self.last = Some(capture.clone());
        Ok(capture)
    }

    /// Closes an open window without completing it. The partial capture is
    /// returned marked incomplete; the profiler is left with no window open.
    pub fn abort(&mut self) -> Option<ProfileCapture> {
        let capture = self.window.take()?.close(false);
        log::warn!(
            "profiling capture aborted after {} frame(s)",
            capture.frame_count
        );
        self.last = Some(capture.clone());
        Some(capture)
    }

    /// Statistics of the most recently closed window.
    pub fn stats(&self, event_name: &str) -> Result<Stat> {
        if self.window.is_some() {
            return Err(CaptureError::State(
                "statistics are not available while a capture window is open".to_owned(),
            ));
        }
        self.last
            .as_ref()
            .ok_or_else(|| CaptureError::State("no profiling capture has been closed".to_owned()))?
            .stat(event_name)
    }
}
