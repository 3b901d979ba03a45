use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::clock::FrameIndex;
use crate::error::{CaptureError, Result};
use crate::renderer::FrameImage;
use crate::schedule::GraphHandle;
use crate::session::{CaptureSession, ImageFormat, SessionFormat, VideoParams};

/// An in-progress video encode.
pub trait VideoStream: Send {
    fn append(&mut self, frame: &FrameImage) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<()>;
}

/// Opens video encodes; the seam between the exporter and a concrete encoder.
pub trait VideoBackend: Send {
    fn open(
        &self,
        output_path: &Path,
        params: &VideoParams,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoStream>>;
}

struct OpenEncode {
    path: PathBuf,
    stream: Box<dyn VideoStream>,
    frames: u64,
}

/// Turns capture actions into files.
///
/// Still paths are unique within the exporter: a second write to a path that
/// was already produced is refused rather than overwriting it. Failed writes
/// are never retried here.
pub struct Exporter {
    stills: Option<CaptureSession>,
    video: Option<CaptureSession>,
    backend: Box<dyn VideoBackend>,
    encodes: BTreeMap<usize, OpenEncode>,
    finalized: BTreeSet<usize>,
    failed: BTreeSet<usize>,
    written: HashSet<PathBuf>,
}

impl Exporter {
    pub fn new(backend: Box<dyn VideoBackend>) -> Self {
        Self {
            stills: None,
            video: None,
            backend,
            encodes: BTreeMap::new(),
            finalized: BTreeSet::new(),
            failed: BTreeSet::new(),
            written: HashSet::new(),
        }
    }

    pub fn with_still_session(mut self, session: CaptureSession) -> Result<Self> {
        if !matches!(session.format(), SessionFormat::Image(_)) {
            return Err(CaptureError::Config(
                "frame capture session must use an image format".to_owned(),
            ));
        }
        self.stills = Some(session);
        Ok(self)
    }

    pub fn with_video_session(mut self, session: CaptureSession) -> Result<Self> {
        if !matches!(session.format(), SessionFormat::Video(_)) {
            return Err(CaptureError::Config(
                "video capture session must use a video codec".to_owned(),
            ));
        }
        self.video = Some(session);
        Ok(self)
    }

    pub fn still_session(&self) -> Option<&CaptureSession> {
        self.stills.as_ref()
    }

    /// Writes one still image synchronously and returns its path.
    pub fn write_still(
        &mut self,
        graph: &GraphHandle,
        frame: FrameIndex,
        image: &FrameImage,
    ) -> Result<PathBuf> {
        let (path, format) = self.prepare_still(graph, frame)?;
        write_image_file(&path, image, format)?;
        log::debug!("wrote still {}", path.display());
        Ok(path)
    }

    /// Reserves the output path for a still and makes sure its directory exists.
    ///
    /// The caller is then responsible for writing the pixels, possibly on
    /// another thread through [`write_image_file`].
    pub fn prepare_still(
        &mut self,
        graph: &GraphHandle,
        frame: FrameIndex,
    ) -> Result<(PathBuf, ImageFormat)> {
        let session = self.stills.as_mut().ok_or_else(|| {
            CaptureError::Config("no frame capture session is configured".to_owned())
        })?;
        let SessionFormat::Image(format) = *session.format() else {
            return Err(CaptureError::Config(
                "frame capture session must use an image format".to_owned(),
            ));
        };
        session.freeze();

        let path = session.still_path(graph, frame);
        if self.written.contains(&path) {
            return Err(CaptureError::State(format!(
                "refusing to overwrite {} captured earlier in this session",
                path.display()
            )));
        }
        ensure_dir(session.output_dir())?;
        self.written.insert(path.clone());
        Ok((path, format))
    }

    /// Appends a frame to the encode for `range`, opening it on first use.
    ///
    /// A failure aborts that range only: its encode is dropped and later frames
    /// for it are ignored.
    pub fn append_video_frame(
        &mut self,
        graph: &GraphHandle,
        range: usize,
        frame: FrameIndex,
        image: &FrameImage,
    ) -> Result<()> {
        if self.failed.contains(&range) {
            log::debug!("skipping frame {frame} for aborted video range #{range}");
            return Ok(());
        }
        if self.finalized.contains(&range) {
            return Err(CaptureError::State(format!(
                "video range #{range} was already finalized"
            )));
        }

        if !self.encodes.contains_key(&range) {
            let encode = self.open_encode(range, image).inspect_err(|_| {
                self.failed.insert(range);
            })?;
            log::info!(
                "graph '{}': recording video range #{} to {}",
                graph,
                range,
                encode.path.display()
            );
            self.encodes.insert(range, encode);
        }

        let Some(encode) = self.encodes.get_mut(&range) else {
            return Err(CaptureError::State(format!("video range #{range} is not open")));
        };
        match encode.stream.append(image) {
            Ok(()) => {
                encode.frames += 1;
                Ok(())
            }
            Err(error) => {
                self.failed.insert(range);
                if let Some(encode) = self.encodes.remove(&range) {
                    // Close the container even though the range is lost.
                    let _ = encode.stream.finish();
                }
                Err(error)
            }
        }
    }

    fn open_encode(&mut self, range: usize, image: &FrameImage) -> Result<OpenEncode> {
        let session = self.video.as_mut().ok_or_else(|| {
            CaptureError::Config("no video capture session is configured".to_owned())
        })?;
        let SessionFormat::Video(params) = session.format().clone() else {
            return Err(CaptureError::Config(
                "video capture session must use a video codec".to_owned(),
            ));
        };
        session.freeze();

        let path = session.video_path(range);
        ensure_dir(session.output_dir())?;
        let stream = self
            .backend
            .open(&path, &params, image.width(), image.height())?;
        Ok(OpenEncode {
            path,
            stream,
            frames: 0,
        })
    }

    /// Closes the encode for `range` and returns the container path. Callable once per range.
    pub fn finalize_video(&mut self, range: usize) -> Result<PathBuf> {
        if self.finalized.contains(&range) {
            return Err(CaptureError::State(format!(
                "video range #{range} was already finalized"
            )));
        }
        let encode = self.encodes.remove(&range).ok_or_else(|| {
            if self.failed.contains(&range) {
                CaptureError::Encoding(format!("video range #{range} was aborted"))
            } else {
                CaptureError::State(format!("video range #{range} has no frames to finalize"))
            }
        })?;
        self.finalized.insert(range);
        encode.stream.finish()?;
        log::info!(
            "finalized video range #{} ({} frames) at {}",
            range,
            encode.frames,
            encode.path.display()
        );
        Ok(encode.path)
    }

    /// Finalizes every open encode, for normal shutdown and for aborts.
    pub fn finalize_all(&mut self) -> Vec<(usize, Result<PathBuf>)> {
        let ranges = self.encodes.keys().copied().collect::<Vec<_>>();
        ranges
            .into_iter()
            .map(|range| (range, self.finalize_video(range)))
            .collect()
    }

    pub fn encoded_frames(&self, range: usize) -> Option<u64> {
        self.encodes.get(&range).map(|encode| encode.frames)
    }
}

impl Drop for Exporter {
    fn drop(&mut self) {
        for (range, result) in self.finalize_all() {
            if let Err(error) = result {
                log::error!("failed to finalize video range #{range} on shutdown: {error}");
            }
        }
    }
}

fn ensure_dir(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).map_err(|source| CaptureError::io(dir, source))
}

/// Encodes `image` into `path` in the given format.
pub fn write_image_file(path: &Path, image: &FrameImage, format: ImageFormat) -> Result<()> {
    let result = if format.supports_alpha() {
        image::save_buffer_with_format(
            path,
            image.rgba(),
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgba8,
            format.to_image_format(),
        )
    } else {
        let rgb = image
            .rgba()
            .chunks_exact(4)
            .flat_map(|pixel| [pixel[0], pixel[1], pixel[2]])
            .collect::<Vec<_>>();
        image::save_buffer_with_format(
            path,
            &rgb,
            image.width(),
            image.height(),
            image::ExtendedColorType::Rgb8,
            format.to_image_format(),
        )
    };

    result.map_err(|error| match error {
        image::ImageError::IoError(source) => CaptureError::io(path, source),
        other => CaptureError::Encoding(format!("{}: {other}", path.display())),
    })
}
