use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use anyhow::{anyhow, bail, Context};

use crate::error::{CaptureError, Result};
use crate::exporter::{VideoBackend, VideoStream};
use crate::renderer::FrameImage;
use crate::session::VideoParams;

const FRAME_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfmpegMode {
    Auto,
    System,
    Sidecar,
}

/// Encodes video ranges by piping raw RGBA frames into an `ffmpeg` process.
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    mode: FfmpegMode,
}

impl FfmpegBackend {
    pub fn new(mode: FfmpegMode) -> Self {
        Self { mode }
    }
}

impl Default for FfmpegBackend {
    fn default() -> Self {
        Self::new(FfmpegMode::Auto)
    }
}

impl VideoBackend for FfmpegBackend {
    fn open(
        &self,
        output_path: &Path,
        params: &VideoParams,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoStream>> {
        let pipe = FfmpegPipe::spawn(self.mode, output_path, params, width, height)
            .map_err(|error| CaptureError::Encoding(format!("{error:#}")))?;
        Ok(Box::new(pipe))
    }
}

/// One in-flight encode. Frames are queued to a writer thread that owns the child process.
pub struct FfmpegPipe {
    width: u32,
    height: u32,
    sender: Option<mpsc::SyncSender<FrameImage>>,
    worker: Option<JoinHandle<anyhow::Result<()>>>,
}

impl FfmpegPipe {
    pub fn spawn(
        mode: FfmpegMode,
        output_path: &Path,
        params: &VideoParams,
        width: u32,
        height: u32,
    ) -> anyhow::Result<Self> {
        let ffmpeg_path = resolve_ffmpeg_path(mode)?;
        let args = ffmpeg_args(params, width, height, output_path);
        let (sender, receiver) = mpsc::sync_channel::<FrameImage>(FRAME_QUEUE_DEPTH);
        let mode_label = mode_label(mode);
        let worker_name = format!("framecap-ffmpeg-{mode_label}");
        let output_path = output_path.to_path_buf();

        let worker = thread::Builder::new()
            .name(worker_name)
            .spawn(move || {
                run_ffmpeg_process(&ffmpeg_path, &args, receiver, &output_path, mode_label)
            })
            .context("failed to spawn ffmpeg writer thread")?;

        Ok(Self {
            width,
            height,
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    fn join(&mut self) -> anyhow::Result<()> {
        drop(self.sender.take());
        let handle = self
            .worker
            .take()
            .ok_or_else(|| anyhow!("ffmpeg worker thread missing"))?;
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(anyhow!("ffmpeg worker thread panicked")),
        }
    }
}

impl VideoStream for FfmpegPipe {
    fn append(&mut self, frame: &FrameImage) -> Result<()> {
        if frame.width() != self.width || frame.height() != self.height {
            return Err(CaptureError::Encoding(format!(
                "frame is {}x{} but the encode was opened at {}x{}",
                frame.width(),
                frame.height(),
                self.width,
                self.height
            )));
        }
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| CaptureError::Encoding("encoder has already been finalized".to_owned()))?;
        if sender.send(frame.clone()).is_ok() {
            return Ok(());
        }
        // The worker hung up early; its result carries the actual failure.
        let cause = match self.join() {
            Ok(()) => anyhow!("ffmpeg stopped accepting frames"),
            Err(error) => error,
        };
        Err(CaptureError::Encoding(format!("{cause:#}")))
    }

    fn finish(mut self: Box<Self>) -> Result<()> {
        self.join()
            .map_err(|error| CaptureError::Encoding(format!("{error:#}")))
    }
}

impl Drop for FfmpegPipe {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(error) = self.join() {
                log::error!("video encode dropped without finalize: {error:#}");
            }
        }
    }
}

fn mode_label(mode: FfmpegMode) -> &'static str {
    match mode {
        FfmpegMode::Auto | FfmpegMode::System => "system",
        FfmpegMode::Sidecar => "sidecar",
    }
}

fn resolve_ffmpeg_path(mode: FfmpegMode) -> anyhow::Result<PathBuf> {
    match mode {
        FfmpegMode::Auto | FfmpegMode::System => Ok(PathBuf::from("ffmpeg")),
        FfmpegMode::Sidecar => {
            #[cfg(feature = "sidecar_ffmpeg")]
            {
                let path = ffmpeg_sidecar::paths::ffmpeg_path();
                if !path.exists() {
                    ffmpeg_sidecar::download::auto_download()
                        .context("failed to auto-download ffmpeg sidecar binary")?;
                }
                Ok(path)
            }
            #[cfg(not(feature = "sidecar_ffmpeg"))]
            {
                Err(anyhow!(
                    "ffmpeg sidecar mode requested but framecap was built without `sidecar_ffmpeg`. Rebuild with `--features sidecar_ffmpeg`."
                ))
            }
        }
    }
}

fn run_ffmpeg_process(
    ffmpeg_path: &Path,
    args: &[String],
    receiver: mpsc::Receiver<FrameImage>,
    output_path: &Path,
    mode_label: &str,
) -> anyhow::Result<()> {
    let path_str = output_path.to_string_lossy();
    if path_str.chars().any(|c| c.is_control()) {
        bail!("output path contains invalid control characters");
    }

    let mut child = Command::new(ffmpeg_path)
        .args(args.iter().map(String::as_str))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                anyhow!(
                    "ffmpeg executable not found (mode={mode_label}, resolved_path={}). Install ffmpeg or build with `--features sidecar_ffmpeg`.",
                    ffmpeg_path.display()
                )
            } else {
                anyhow!(
                    "failed to spawn ffmpeg process (mode={mode_label}, resolved_path={}, args='{}'): {error}",
                    ffmpeg_path.display(),
                    args.join(" ")
                )
            }
        })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("failed to capture ffmpeg stdin"))?;
    let mut stderr_pipe = child.stderr.take();

    while let Ok(frame) = receiver.recv() {
        stdin
            .write_all(frame.rgba())
            .context("failed to write frame to ffmpeg stdin")?;
    }

    stdin.flush().context("failed to flush ffmpeg stdin")?;
    drop(stdin);

    let status = child.wait().context("failed waiting for ffmpeg process")?;
    let stderr_tail = read_stderr_tail(&mut stderr_pipe)?;
    if !status.success() {
        bail!(
            "ffmpeg failed with status {status} (mode={mode_label}, output={}, stderr_tail='{}')",
            output_path.display(),
            stderr_tail
        );
    }

    log::debug!("ffmpeg finished {}", output_path.display());
    Ok(())
}

pub fn ffmpeg_args(params: &VideoParams, width: u32, height: u32, output_path: &Path) -> Vec<String> {
    let mut args = ffmpeg_rawvideo_input_args(width, height, params.fps);
    args.extend(ffmpeg_codec_output_args(params, width, height));
    args.extend(ffmpeg_container_output_args(output_path));
    args.push(output_path.to_string_lossy().into_owned());
    args
}

pub fn ffmpeg_rawvideo_input_args(width: u32, height: u32, fps: u32) -> Vec<String> {
    vec![
        "-hide_banner".to_owned(),
        "-loglevel".to_owned(),
        "error".to_owned(),
        "-y".to_owned(),
        "-f".to_owned(),
        "rawvideo".to_owned(),
        "-pix_fmt".to_owned(),
        "rgba".to_owned(),
        "-s:v".to_owned(),
        format!("{width}x{height}"),
        "-r".to_owned(),
        fps.to_string(),
        "-i".to_owned(),
        "-".to_owned(),
        "-an".to_owned(),
    ]
}

pub fn ffmpeg_codec_output_args(params: &VideoParams, width: u32, height: u32) -> Vec<String> {
    let mut args = vec![
        "-c:v".to_owned(),
        params.codec.to_ffmpeg_codec().to_owned(),
        "-b:v".to_owned(),
        format!("{}k", params.bitrate_kbps()),
        "-g".to_owned(),
        params.gop_size.to_string(),
        "-pix_fmt".to_owned(),
        params.codec.pix_fmt().to_owned(),
    ];

    if params.codec.requires_even_dimensions() && (width % 2 == 1 || height % 2 == 1) {
        args.push("-vf".to_owned());
        args.push("pad=ceil(iw/2)*2:ceil(ih/2)*2".to_owned());
    }
    args
}

pub fn ffmpeg_container_output_args(output_path: &Path) -> Vec<String> {
    let ext = output_path
        .extension()
        .and_then(|ext| ext.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    if matches!(ext.as_str(), "mov" | "mp4" | "m4v") {
        vec!["-movflags".to_owned(), "+faststart".to_owned()]
    } else {
        Vec::new()
    }
}

fn read_stderr_tail(stderr: &mut Option<std::process::ChildStderr>) -> anyhow::Result<String> {
    let Some(mut pipe) = stderr.take() else {
        return Ok(String::new());
    };
    let mut buf = Vec::new();
    pipe.read_to_end(&mut buf)
        .context("failed reading ffmpeg stderr")?;
    let text = String::from_utf8_lossy(&buf).to_string();
    Ok(last_n_chars(&text, 500))
}

fn last_n_chars(s: &str, max_chars: usize) -> String {
    let chars = s.chars().collect::<Vec<_>>();
    let start = chars.len().saturating_sub(max_chars);
    chars[start..].iter().collect::<String>().trim().to_owned()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{ffmpeg_args, last_n_chars};
    use crate::session::{VideoCodec, VideoParams};

    #[test]
    fn ffmpeg_args_carry_codec_bitrate_and_gop() {
        let params = VideoParams {
            codec: VideoCodec::H264,
            fps: 60,
            bitrate_mbps: 4.0,
            gop_size: 10,
        };
        let args = ffmpeg_args(&params, 320, 180, Path::new("out/test_video.0.mp4"));
        let joined = args.join(" ");

        assert!(joined.contains("-s:v 320x180 -r 60 -i -"));
        assert!(joined.contains("-c:v libx264"));
        assert!(joined.contains("-b:v 4000k"));
        assert!(joined.contains("-g 10"));
        assert!(joined.contains("-movflags +faststart"));
        assert!(!joined.contains("pad="));
        assert_eq!(args.last().map(String::as_str), Some("out/test_video.0.mp4"));
    }

    #[test]
    fn odd_dimensions_are_padded_for_subsampled_codecs() {
        let params = VideoParams::default();
        let args = ffmpeg_args(&params, 33, 17, Path::new("clip.mp4"));
        assert!(args.iter().any(|arg| arg.starts_with("pad=")));

        let prores = VideoParams {
            codec: VideoCodec::ProRes,
            ..VideoParams::default()
        };
        let args = ffmpeg_args(&prores, 33, 17, Path::new("clip.mov"));
        assert!(!args.iter().any(|arg| arg.starts_with("pad=")));
    }

    #[test]
    fn stderr_tail_keeps_last_characters() {
        assert_eq!(last_n_chars("abcdef", 3), "def");
        assert_eq!(last_n_chars("  ab ", 10), "ab");
    }
}
