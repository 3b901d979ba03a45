use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Result};

use crate::clock::FrameTick;
use crate::schedule::GraphHandle;

/// Tightly packed RGBA8 pixels for one rendered frame.
#[derive(Debug, Clone)]
pub struct FrameImage {
    width: u32,
    height: u32,
    rgba: Arc<[u8]>,
}

impl FrameImage {
    pub fn new(width: u32, height: u32, rgba: Vec<u8>) -> Result<Self> {
        let expected = width as usize * height as usize * 4;
        if width == 0 || height == 0 {
            bail!("frame dimensions must be positive, got {width}x{height}");
        }
        if rgba.len() != expected {
            bail!(
                "frame buffer holds {} bytes, expected {expected} for {width}x{height} rgba",
                rgba.len()
            );
        }
        Ok(Self {
            width,
            height,
            rgba: rgba.into(),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn rgba(&self) -> &[u8] {
        &self.rgba
    }
}

/// A named duration reported by the renderer for one frame, in milliseconds.
#[derive(Debug, Clone, PartialEq)]
pub struct TimingEvent {
    pub name: String,
    pub duration_ms: f64,
}

impl TimingEvent {
    pub fn new(name: impl Into<String>, duration_ms: f64) -> Self {
        Self {
            name: name.into(),
            duration_ms,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderedFrame {
    pub image: FrameImage,
    pub timings: Vec<TimingEvent>,
}

/// The render graph collaborator: produces one frame per call.
pub trait FrameSource {
    fn render_frame(&mut self, graph: &GraphHandle, tick: FrameTick) -> Result<RenderedFrame>;
}

pub const FRAME_RENDER_GPU_EVENT: &str = "/onFrameRender/gpuTime";
pub const FRAME_RENDER_CPU_EVENT: &str = "/onFrameRender/cpuTime";

/// Deterministic CPU test-pattern renderer.
///
/// Output depends only on the graph name, the frame index and the animation flag,
/// which keeps captured files reproducible across runs.
#[derive(Debug, Clone)]
pub struct SoftwareRenderer {
    width: u32,
    height: u32,
    animated: bool,
}

impl SoftwareRenderer {
    pub fn new(width: u32, height: u32) -> Result<Self> {
        if width == 0 || height == 0 {
            bail!("render size must be positive, got {width}x{height}");
        }
        Ok(Self {
            width,
            height,
            animated: true,
        })
    }

    pub fn with_animation(mut self, animated: bool) -> Self {
        self.animated = animated;
        self
    }

    fn fill(&self, graph: &GraphHandle, tick: FrameTick) -> Vec<u8> {
        let seed = fnv1a32(graph.name().as_bytes());
        let shift = if self.animated {
            (tick.frame % u64::from(self.width)) as u32
        } else {
            0
        };
        let mut rgba = Vec::with_capacity(self.width as usize * self.height as usize * 4);
        for y in 0..self.height {
            for x in 0..self.width {
                let r = (u64::from((x + shift) % self.width) * 255 / u64::from(self.width)) as u8;
                let g = (u64::from(y) * 255 / u64::from(self.height)) as u8;
                let b = (seed >> 24) as u8 ^ ((x ^ y).wrapping_add(shift) as u8);
                rgba.extend_from_slice(&[r, g, b, 255]);
            }
        }
        rgba
    }
}

impl FrameSource for SoftwareRenderer {
    fn render_frame(&mut self, graph: &GraphHandle, tick: FrameTick) -> Result<RenderedFrame> {
        let started = Instant::now();
        let rgba = self.fill(graph, tick);
        let fill_ms = started.elapsed().as_secs_f64() * 1000.0;
        let image = FrameImage::new(self.width, self.height, rgba)?;
        let total_ms = started.elapsed().as_secs_f64() * 1000.0;

        Ok(RenderedFrame {
            image,
            timings: vec![
                TimingEvent::new(FRAME_RENDER_GPU_EVENT, fill_ms),
                TimingEvent::new(FRAME_RENDER_CPU_EVENT, total_ms),
            ],
        })
    }
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash = 0x811c_9dc5_u32;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}
