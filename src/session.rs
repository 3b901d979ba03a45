use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::clock::FrameIndex;
use crate::error::{CaptureError, Result};
use crate::schedule::GraphHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    #[serde(alias = "jpg")]
    Jpeg,
    Webp,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpeg => "jpg",
            Self::Webp => "webp",
        }
    }

    pub fn to_image_format(self) -> image::ImageFormat {
        match self {
            Self::Png => image::ImageFormat::Png,
            Self::Jpeg => image::ImageFormat::Jpeg,
            Self::Webp => image::ImageFormat::WebP,
        }
    }

    pub fn supports_alpha(self) -> bool {
        !matches!(self, Self::Jpeg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    #[default]
    H264,
    #[serde(alias = "h265")]
    Hevc,
    Mpeg4,
    Vp9,
    #[serde(alias = "prores_ks")]
    ProRes,
}

impl VideoCodec {
    pub fn to_ffmpeg_codec(self) -> &'static str {
        match self {
            Self::H264 => "libx264",
            Self::Hevc => "libx265",
            Self::Mpeg4 => "mpeg4",
            Self::Vp9 => "libvpx-vp9",
            Self::ProRes => "prores_ks",
        }
    }

    pub fn container_extension(self) -> &'static str {
        match self {
            Self::H264 | Self::Hevc | Self::Mpeg4 => "mp4",
            Self::Vp9 => "webm",
            Self::ProRes => "mov",
        }
    }

    pub fn pix_fmt(self) -> &'static str {
        match self {
            Self::ProRes => "yuv422p10le",
            _ => "yuv420p",
        }
    }

    /// Chroma-subsampled formats need even frame dimensions.
    pub fn requires_even_dimensions(self) -> bool {
        self.pix_fmt() == "yuv420p"
    }
}

/// Encoder settings forwarded to the video backend.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoParams {
    pub codec: VideoCodec,
    pub fps: u32,
    /// Target bitrate in Mbit/s.
    pub bitrate_mbps: f64,
    /// Keyframe interval.
    pub gop_size: u32,
}

impl Default for VideoParams {
    fn default() -> Self {
        Self {
            codec: VideoCodec::H264,
            fps: 60,
            bitrate_mbps: 4.0,
            gop_size: 10,
        }
    }
}

impl VideoParams {
    pub fn validate(&self) -> Result<()> {
        if self.fps == 0 {
            return Err(CaptureError::Config("video fps must be > 0".to_owned()));
        }
        if !self.bitrate_mbps.is_finite() || self.bitrate_mbps <= 0.0 {
            return Err(CaptureError::Config(format!(
                "video bitrate must be > 0 Mbit/s, got {}",
                self.bitrate_mbps
            )));
        }
        if self.gop_size == 0 {
            return Err(CaptureError::Config("video gop_size must be > 0".to_owned()));
        }
        Ok(())
    }

    pub fn bitrate_kbps(&self) -> u64 {
        (self.bitrate_mbps * 1000.0).round() as u64
    }
}

/// How output file names are composed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilenamePolicy {
    /// Placed between the base name, the optional graph tag and the frame index.
    pub separator: String,
    /// Zero-padding applied to frame indices.
    pub pad_width: usize,
    /// Insert the graph name, needed when more than one graph writes into a session.
    pub tag_graph: bool,
}

impl Default for FilenamePolicy {
    fn default() -> Self {
        Self {
            separator: ".".to_owned(),
            pad_width: 0,
            tag_graph: false,
        }
    }
}

impl FilenamePolicy {
    /// Pads to the width of the last frame a run bounded by `exit_frame` can render.
    pub fn with_exit_frame(mut self, exit_frame: Option<FrameIndex>) -> Self {
        self.pad_width = exit_frame.map_or(0, |exit_frame| {
            exit_frame.saturating_sub(1).to_string().len()
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionFormat {
    Image(ImageFormat),
    Video(VideoParams),
}

/// Output location and naming for one kind of capture.
///
/// Settings can change until the exporter first writes through the session;
/// after that the session is frozen and setters fail with a state error.
#[derive(Debug, Clone)]
pub struct CaptureSession {
    output_dir: PathBuf,
    base_filename: String,
    format: SessionFormat,
    policy: FilenamePolicy,
    frozen: bool,
}

impl CaptureSession {
    pub fn still(
        output_dir: impl Into<PathBuf>,
        base_filename: impl Into<String>,
        format: ImageFormat,
    ) -> Result<Self> {
        Self::new(output_dir.into(), base_filename.into(), SessionFormat::Image(format))
    }

    pub fn video(
        output_dir: impl Into<PathBuf>,
        base_filename: impl Into<String>,
        params: VideoParams,
    ) -> Result<Self> {
        params.validate()?;
        Self::new(output_dir.into(), base_filename.into(), SessionFormat::Video(params))
    }

    fn new(output_dir: PathBuf, base_filename: String, format: SessionFormat) -> Result<Self> {
        validate_base_filename(&base_filename)?;
        if output_dir.as_os_str().is_empty() {
            return Err(CaptureError::Config("output_dir cannot be empty".to_owned()));
        }
        Ok(Self {
            output_dir,
            base_filename,
            format,
            policy: FilenamePolicy::default(),
            frozen: false,
        })
    }

    pub fn with_policy(mut self, policy: FilenamePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn base_filename(&self) -> &str {
        &self.base_filename
    }

    pub fn format(&self) -> &SessionFormat {
        &self.format
    }

    pub fn policy(&self) -> &FilenamePolicy {
        &self.policy
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    pub fn set_output_dir(&mut self, output_dir: impl Into<PathBuf>) -> Result<()> {
        self.ensure_mutable("output_dir")?;
        self.output_dir = output_dir.into();
        Ok(())
    }

    pub fn set_base_filename(&mut self, base_filename: impl Into<String>) -> Result<()> {
        self.ensure_mutable("base_filename")?;
        let base_filename = base_filename.into();
        validate_base_filename(&base_filename)?;
        self.base_filename = base_filename;
        Ok(())
    }

    pub fn set_policy(&mut self, policy: FilenamePolicy) -> Result<()> {
        self.ensure_mutable("filename policy")?;
        self.policy = policy;
        Ok(())
    }

    pub(crate) fn freeze(&mut self) {
        self.frozen = true;
    }

    fn ensure_mutable(&self, field: &str) -> Result<()> {
        if self.frozen {
            return Err(CaptureError::State(format!(
                "cannot change {field}: session '{}' is already in use",
                self.base_filename
            )));
        }
        Ok(())
    }

    /// `{output_dir}/{base}{sep}[{graph}{sep}]{frame}.{ext}`
    pub fn still_path(&self, graph: &GraphHandle, frame: FrameIndex) -> PathBuf {
        let extension = match &self.format {
            SessionFormat::Image(format) => format.extension(),
            SessionFormat::Video(params) => params.codec.container_extension(),
        };
        let sep = &self.policy.separator;
        let width = self.policy.pad_width;
        let name = if self.policy.tag_graph {
            format!(
                "{}{sep}{}{sep}{frame:0width$}.{extension}",
                self.base_filename,
                graph.name()
            )
        } else {
            format!("{}{sep}{frame:0width$}.{extension}", self.base_filename)
        };
        self.output_dir.join(name)
    }

    /// `{output_dir}/{base}{sep}{range}.{container}`
    pub fn video_path(&self, range: usize) -> PathBuf {
        let extension = match &self.format {
            SessionFormat::Video(params) => params.codec.container_extension(),
            SessionFormat::Image(format) => format.extension(),
        };
        self.output_dir.join(format!(
            "{}{}{range}.{extension}",
            self.base_filename, self.policy.separator
        ))
    }
}

fn validate_base_filename(base_filename: &str) -> Result<()> {
    if base_filename.trim().is_empty() {
        return Err(CaptureError::Config("base_filename cannot be empty".to_owned()));
    }
    if base_filename.contains(['/', '\\']) || base_filename.chars().any(char::is_control) {
        return Err(CaptureError::Config(format!(
            "base_filename '{}' must be a plain file name",
            base_filename.escape_debug()
        )));
    }
    Ok(())
}
