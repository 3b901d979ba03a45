use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::{CaptureError, Result};
use crate::renderer::FRAME_RENDER_GPU_EVENT;
use crate::schedule::{check_frames, check_range, GraphHandle, TimeWindowTrigger};
use crate::session::{ImageFormat, VideoCodec, VideoParams};

pub const MANIFEST_VERSION: u32 = 1;

/// A benchmark run: which graphs to render, how long, and what to capture.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BenchManifest {
    pub version: u32,
    pub graphs: Vec<String>,
    #[serde(default)]
    pub render: RenderSettings,
    #[serde(default)]
    pub scene: SceneSettings,
    #[serde(default)]
    pub clock: ClockSettings,
    #[serde(default)]
    pub frame_capture: Option<FrameCaptureSettings>,
    #[serde(default)]
    pub video_capture: Option<VideoCaptureSettings>,
    #[serde(default)]
    pub timing_capture: Option<TimingCaptureSettings>,
    #[serde(default)]
    pub profiler: Option<ProfilerSettings>,
    #[serde(default)]
    pub writer: WriterSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RenderSettings {
    pub width: u32,
    pub height: u32,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            width: 320,
            height: 180,
        }
    }
}

/// Opaque scene flags forwarded to the frame source.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SceneSettings {
    #[serde(default = "default_true")]
    pub animated: bool,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self { animated: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClockSettings {
    /// Frames `0..exit_frame` are rendered. Derived from the schedules when absent.
    #[serde(default)]
    pub exit_frame: Option<u64>,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default)]
    pub paused: bool,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            exit_frame: None,
            fps: default_fps(),
            paused: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FrameCaptureSettings {
    pub output_dir: PathBuf,
    pub base_filename: String,
    #[serde(default)]
    pub format: ImageFormat,
    #[serde(default = "default_separator")]
    pub separator: String,
    #[serde(default)]
    pub tag_graph: bool,
    /// Still frame indices per graph. Signed so negative input is reported, not mis-parsed.
    #[serde(default)]
    pub frames: BTreeMap<String, Vec<i64>>,
    #[serde(default)]
    pub time_windows: Vec<TimeWindowSettings>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimeWindowSettings {
    pub graph: String,
    pub start: f64,
    pub end: f64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VideoCaptureSettings {
    pub output_dir: PathBuf,
    pub base_filename: String,
    #[serde(default)]
    pub codec: VideoCodec,
    #[serde(default = "default_fps")]
    pub fps: u32,
    /// Mbit/s.
    #[serde(default = "default_bitrate")]
    pub bitrate: f64,
    #[serde(default = "default_gop_size")]
    pub gop_size: u32,
    #[serde(default)]
    pub separator: Option<String>,
    #[serde(default)]
    pub ranges: BTreeMap<String, Vec<[i64; 2]>>,
}

impl VideoCaptureSettings {
    pub fn params(&self) -> VideoParams {
        VideoParams {
            codec: self.codec,
            fps: self.fps,
            bitrate_mbps: self.bitrate,
            gop_size: self.gop_size,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TimingCaptureSettings {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProfilerSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub start_frame: u64,
    /// Window length in frames; the window runs to the end of the run when absent.
    #[serde(default)]
    pub frame_count: Option<u64>,
    #[serde(default)]
    pub output: Option<PathBuf>,
    #[serde(default = "default_report_event")]
    pub report_event: String,
}

impl ProfilerSettings {
    /// First frame after the window. Saturates; `validate` rejects windows that overflow.
    pub fn end_frame(&self) -> Option<u64> {
        self.frame_count
            .map(|count| self.start_frame.saturating_add(count))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WriterSettings {
    #[serde(default)]
    pub background: bool,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

impl Default for WriterSettings {
    fn default() -> Self {
        Self {
            background: false,
            queue_depth: default_queue_depth(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_fps() -> u32 {
    60
}

fn default_bitrate() -> f64 {
    4.0
}

fn default_gop_size() -> u32 {
    10
}

fn default_separator() -> String {
    ".".to_owned()
}

fn default_queue_depth() -> usize {
    8
}

fn default_report_event() -> String {
    FRAME_RENDER_GPU_EVENT.to_owned()
}

impl BenchManifest {
    pub fn validate(&self) -> Result<()> {
        if self.version != MANIFEST_VERSION {
            return Err(CaptureError::Config(format!(
                "unsupported manifest version {}, expected {MANIFEST_VERSION}",
                self.version
            )));
        }
        if self.graphs.is_empty() {
            return Err(CaptureError::Config(
                "manifest must name at least one graph".to_owned(),
            ));
        }
        let mut seen = HashSet::with_capacity(self.graphs.len());
        for graph in &self.graphs {
            if graph.trim().is_empty() {
                return Err(CaptureError::Config("graph names cannot be empty".to_owned()));
            }
            if !seen.insert(graph.as_str()) {
                return Err(CaptureError::Config(format!("duplicate graph '{graph}'")));
            }
        }
        if self.render.width == 0 || self.render.height == 0 {
            return Err(CaptureError::Config(format!(
                "render size must be positive, got {}x{}",
                self.render.width, self.render.height
            )));
        }
        if self.clock.fps == 0 {
            return Err(CaptureError::Config("clock fps must be > 0".to_owned()));
        }
        if self.writer.queue_depth == 0 {
            return Err(CaptureError::Config("writer queue_depth must be > 0".to_owned()));
        }

        if let Some(frame_capture) = &self.frame_capture {
            frame_capture.validate(&seen)?;
        }
        if let Some(video_capture) = &self.video_capture {
            video_capture.validate(&seen)?;
        }
        if let Some(profiler) = &self.profiler {
            if profiler.frame_count == Some(0) {
                return Err(CaptureError::Config(
                    "profiler frame_count must be > 0".to_owned(),
                ));
            }
            if let Some(count) = profiler.frame_count {
                if profiler.start_frame.checked_add(count).is_none() {
                    return Err(CaptureError::Config(format!(
                        "profiler window start_frame {} + frame_count {count} overflows",
                        profiler.start_frame
                    )));
                }
            }
            if profiler.report_event.trim().is_empty() {
                return Err(CaptureError::Config(
                    "profiler report_event cannot be empty".to_owned(),
                ));
            }
        }
        if self.resolved_exit_frame().is_none() {
            return Err(CaptureError::Config(
                "clock.exit_frame is required when nothing bounds the run".to_owned(),
            ));
        }
        Ok(())
    }

    /// The explicit exit frame, or one past the last frame any schedule needs.
    pub fn resolved_exit_frame(&self) -> Option<u64> {
        if let Some(exit_frame) = self.clock.exit_frame {
            return Some(exit_frame);
        }

        let still_max = self.frame_capture.as_ref().and_then(|capture| {
            capture
                .frames
                .values()
                .flatten()
                .filter_map(|frame| u64::try_from(*frame).ok())
                .max()
        });
        let video_max = self.video_capture.as_ref().and_then(|capture| {
            capture
                .ranges
                .values()
                .flatten()
                .filter_map(|[_, end]| u64::try_from(*end).ok())
                .max()
        });
        let profiler_last = self
            .profiler
            .as_ref()
            .and_then(ProfilerSettings::end_frame)
            .map(|end| end.saturating_sub(1));

        [still_max, video_max, profiler_last]
            .into_iter()
            .flatten()
            .max()
            .map(|last| last.saturating_add(1))
    }
}

impl FrameCaptureSettings {
    fn validate(&self, graphs: &HashSet<&str>) -> Result<()> {
        for graph in self
            .frames
            .keys()
            .map(String::as_str)
            .chain(self.time_windows.iter().map(|window| window.graph.as_str()))
        {
            if !graphs.contains(graph) {
                return Err(CaptureError::Config(format!(
                    "frame_capture references unknown graph '{graph}'"
                )));
            }
        }

        let capturing_graphs = self
            .frames
            .keys()
            .map(String::as_str)
            .chain(self.time_windows.iter().map(|window| window.graph.as_str()))
            .collect::<HashSet<_>>();
        if capturing_graphs.len() > 1 && !self.tag_graph {
            return Err(CaptureError::Config(
                "frame_capture targets more than one graph; set tag_graph: true so file names stay unique"
                    .to_owned(),
            ));
        }
        if self.separator.contains(['/', '\\']) {
            return Err(CaptureError::Config(format!(
                "frame_capture separator '{}' cannot contain a path separator",
                self.separator
            )));
        }
        if self.tag_graph && self.separator.is_empty() {
            return Err(CaptureError::Config(
                "frame_capture separator cannot be empty when tag_graph is set".to_owned(),
            ));
        }

        for (graph, frames) in &self.frames {
            check_frames(&GraphHandle::new(graph), frames)?;
        }
        for window in &self.time_windows {
            TimeWindowTrigger::new(window.start, window.end)?;
        }
        Ok(())
    }
}

impl VideoCaptureSettings {
    fn validate(&self, graphs: &HashSet<&str>) -> Result<()> {
        for graph in self.ranges.keys() {
            if !graphs.contains(graph.as_str()) {
                return Err(CaptureError::Config(format!(
                    "video_capture references unknown graph '{graph}'"
                )));
            }
        }
        for (graph, ranges) in &self.ranges {
            let handle = GraphHandle::new(graph);
            for [start, end] in ranges {
                check_range(&handle, *start, *end)?;
            }
        }
        self.params().validate()
    }
}
