use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};

use crate::clock::{FrameClock, FrameIndex};
use crate::error::CaptureError;
use crate::exporter::{Exporter, VideoBackend};
use crate::profiler::{ProfileCapture, Profiler};
use crate::renderer::{FrameImage, FrameSource};
use crate::schedule::{CaptureAction, CaptureScheduler, GraphHandle};
use crate::schema::BenchManifest;
use crate::session::{CaptureSession, FilenamePolicy};
use crate::timing::TimingCapture;
use crate::writer::{StillWriter, WriteOutcome};

/// A capture that failed during the run. The run itself continues.
#[derive(Debug)]
pub struct CaptureFailure {
    pub frame: FrameIndex,
    pub graph: Option<GraphHandle>,
    pub error: CaptureError,
}

#[derive(Debug, Default)]
pub struct RunReport {
    pub frames_rendered: u64,
    pub stills: Vec<PathBuf>,
    pub videos: Vec<PathBuf>,
    pub failures: Vec<CaptureFailure>,
    pub profile: Option<ProfileCapture>,
    /// Schedule entries the run never reached.
    pub unreached: Vec<String>,
    pub aborted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Rendered(FrameIndex),
    Paused,
    Finished,
}

#[derive(Debug, Clone, Copy)]
struct ProfileWindow {
    start: FrameIndex,
    end: Option<FrameIndex>,
}

/// Drives the frame loop: render, schedule, export, profile, advance.
///
/// Every configured graph is rendered once per tick. Timing events of the
/// first (active) graph keep their names; events of other graphs are prefixed
/// with `/{graph}`.
pub struct Harness<S: FrameSource> {
    source: S,
    graphs: Vec<GraphHandle>,
    clock: FrameClock,
    scheduler: CaptureScheduler,
    exporter: Exporter,
    profiler: Profiler,
    writer: Option<StillWriter>,
    timing: Option<TimingCapture>,
    profile_window: Option<ProfileWindow>,
    report: RunReport,
    interrupted: Option<RunReport>,
    cancel: Arc<AtomicBool>,
}

impl<S: FrameSource> Harness<S> {
    pub fn new(
        source: S,
        graphs: Vec<GraphHandle>,
        clock: FrameClock,
        scheduler: CaptureScheduler,
        exporter: Exporter,
        profiler: Profiler,
    ) -> Self {
        Self {
            source,
            graphs,
            clock,
            scheduler,
            exporter,
            profiler,
            writer: None,
            timing: None,
            profile_window: None,
            report: RunReport::default(),
            interrupted: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds every component from a validated manifest.
    pub fn from_manifest(
        manifest: &BenchManifest,
        source: S,
        backend: Box<dyn VideoBackend>,
    ) -> Result<Self> {
        let graphs = manifest
            .graphs
            .iter()
            .map(GraphHandle::new)
            .collect::<Vec<_>>();
        let exit_frame = manifest.resolved_exit_frame();

        let mut clock = FrameClock::new(manifest.clock.fps);
        clock.set_exit_frame(exit_frame);
        if manifest.clock.paused {
            clock.pause();
        }

        let mut scheduler = CaptureScheduler::new();
        let mut exporter = Exporter::new(backend);

        if let Some(frame_capture) = &manifest.frame_capture {
            for (graph, frames) in &frame_capture.frames {
                scheduler.add_frames(&GraphHandle::new(graph), frames)?;
            }
            for window in &frame_capture.time_windows {
                scheduler.add_time_window(&GraphHandle::new(&window.graph), window.start, window.end)?;
            }
            let policy = FilenamePolicy {
                separator: frame_capture.separator.clone(),
                pad_width: 0,
                tag_graph: frame_capture.tag_graph,
            }
            .with_exit_frame(exit_frame);
            let session = CaptureSession::still(
                &frame_capture.output_dir,
                &frame_capture.base_filename,
                frame_capture.format,
            )?
            .with_policy(policy);
            exporter = exporter.with_still_session(session)?;
        }

        if let Some(video_capture) = &manifest.video_capture {
            for (graph, ranges) in &video_capture.ranges {
                let ranges = ranges
                    .iter()
                    .map(|[start, end]| (*start, *end))
                    .collect::<Vec<_>>();
                scheduler.add_ranges(&GraphHandle::new(graph), &ranges)?;
            }
            let mut policy = FilenamePolicy::default();
            if let Some(separator) = &video_capture.separator {
                policy.separator = separator.clone();
            }
            let session = CaptureSession::video(
                &video_capture.output_dir,
                &video_capture.base_filename,
                video_capture.params(),
            )?
            .with_policy(policy);
            exporter = exporter.with_video_session(session)?;
        }

        let profiler = Profiler::new(
            manifest
                .profiler
                .as_ref()
                .map_or(false, |profiler| profiler.enabled),
        );
        let mut harness = Self::new(source, graphs, clock, scheduler, exporter, profiler);

        if let Some(settings) = &manifest.profiler {
            harness = harness.with_profile_window(settings.start_frame, settings.end_frame());
        }
        if manifest.writer.background && manifest.frame_capture.is_some() {
            harness = harness.with_still_writer(StillWriter::spawn(manifest.writer.queue_depth)?);
        }
        if let Some(timing) = &manifest.timing_capture {
            harness = harness.with_timing_capture(TimingCapture::open(&timing.path)?);
        }
        Ok(harness)
    }

    pub fn with_still_writer(mut self, writer: StillWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn with_timing_capture(mut self, timing: TimingCapture) -> Self {
        self.timing = Some(timing);
        self
    }

    /// Opens a profiling window at `start` and closes it before frame `end`
    /// (or at the end of the run).
    pub fn with_profile_window(mut self, start: FrameIndex, end: Option<FrameIndex>) -> Self {
        self.profile_window = Some(ProfileWindow { start, end });
        self
    }

    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    pub fn clock_mut(&mut self) -> &mut FrameClock {
        &mut self.clock
    }

    pub fn scheduler_mut(&mut self) -> &mut CaptureScheduler {
        &mut self.scheduler
    }

    pub fn profiler(&self) -> &Profiler {
        &self.profiler
    }

    /// Setting the flag makes [`Harness::run`] abort before the next frame.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Report of the last run that stopped on an error, already flushed.
    pub fn take_interrupted_report(&mut self) -> Option<RunReport> {
        self.interrupted.take()
    }

    /// Runs until the exit frame, or until cancelled.
    ///
    /// When a frame fails, the run is aborted before the error is returned, so
    /// encodes are finalized and no profiling window is left open. The partial
    /// report is then available from [`Harness::take_interrupted_report`].
    pub fn run(&mut self) -> Result<RunReport> {
        if self.clock.is_paused() {
            return Err(CaptureError::State(
                "the frame clock is paused; resume it before running".to_owned(),
            )
            .into());
        }

        match self.run_frames() {
            Ok(true) => self.finish(),
            Ok(false) => Ok(self.abort()),
            Err(error) => {
                let partial = self.abort();
                log::error!(
                    "run stopped at frame {} after {} frame(s): {error:#}",
                    self.clock.current_frame(),
                    partial.frames_rendered
                );
                self.interrupted = Some(partial);
                Err(error)
            }
        }
    }

    /// Steps until the exit frame (`true`) or a cancellation (`false`).
    fn run_frames(&mut self) -> Result<bool> {
        loop {
            if self.cancel.load(Ordering::Relaxed) {
                log::warn!("run cancelled at frame {}", self.clock.current_frame());
                return Ok(false);
            }
            match self.step()? {
                StepOutcome::Rendered(_) => {}
                StepOutcome::Finished => return Ok(true),
                StepOutcome::Paused => {
                    return Err(CaptureError::State(format!(
                        "the frame clock was paused at frame {} during the run",
                        self.clock.current_frame()
                    ))
                    .into());
                }
            }
        }
    }

    /// Renders and processes exactly one frame.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.clock.is_finished() {
            return Ok(StepOutcome::Finished);
        }
        if self.clock.is_paused() {
            return Ok(StepOutcome::Paused);
        }

        let tick = self.clock.tick();
        if let Some(window) = self.profile_window {
            if window.start == tick.frame {
                self.profiler.start_capture()?;
            }
        }

        let frame_started = Instant::now();
        for index in 0..self.graphs.len() {
            let graph = self.graphs[index].clone();
            let rendered = self
                .source
                .render_frame(&graph, tick)
                .with_context(|| format!("failed to render frame {} of graph '{}'", tick.frame, graph))?;

            for event in &rendered.timings {
                if index == 0 {
                    self.profiler.record_sample(&event.name, event.duration_ms);
                } else {
                    let name = format!("/{}{}", graph.name(), event.name);
                    self.profiler.record_sample(&name, event.duration_ms);
                }
            }

            for action in self.scheduler.on_frame(&graph, tick) {
                self.dispatch(action, &rendered.image);
            }
        }
        let frame_time_ms = frame_started.elapsed().as_secs_f64() * 1000.0;

        if let Some(timing) = self.timing.as_mut() {
            if let Err(error) = timing.record(tick.frame, frame_time_ms) {
                log::error!("frame {}: timing capture failed: {error}", tick.frame);
                self.report.failures.push(CaptureFailure {
                    frame: tick.frame,
                    graph: None,
                    error,
                });
            }
        }

        self.profiler.end_frame();
        if let Some(ProfileWindow { end: Some(end), .. }) = self.profile_window {
            if end == tick.frame + 1 && self.profiler.is_capturing() {
                self.report.profile = Some(self.profiler.end_capture()?);
            }
        }

        if let Some(writer) = self.writer.as_mut() {
            let outcomes = writer.poll();
            self.collect_writes(outcomes);
        }

        self.report.frames_rendered += 1;
        if tick.frame % u64::from(self.clock.fps()) == 0 {
            match self.clock.exit_frame() {
                Some(exit_frame) => log::info!("rendered frame {}/{}", tick.frame + 1, exit_frame),
                None => log::info!("rendered frame {}", tick.frame + 1),
            }
        }

        self.clock.advance();
        Ok(StepOutcome::Rendered(tick.frame))
    }

    fn dispatch(&mut self, action: CaptureAction, image: &FrameImage) {
        match action {
            CaptureAction::Still { graph, frame } => {
                let result = match self.writer.as_mut() {
                    Some(writer) => self
                        .exporter
                        .prepare_still(&graph, frame)
                        .and_then(|(path, format)| {
                            writer.submit(graph.clone(), frame, path, image.clone(), format)
                        })
                        .map(|()| None),
                    None => self.exporter.write_still(&graph, frame, image).map(Some),
                };
                match result {
                    Ok(Some(path)) => self.report.stills.push(path),
                    Ok(None) => {}
                    Err(error) => self.record_failure(frame, Some(graph), error),
                }
            }
            CaptureAction::VideoFrame {
                graph,
                range,
                frame,
                finalize,
            } => {
                if let Err(error) = self.exporter.append_video_frame(&graph, range, frame, image) {
                    self.record_failure(frame, Some(graph.clone()), error);
                }
                if finalize {
                    match self.exporter.finalize_video(range) {
                        Ok(path) => self.report.videos.push(path),
                        Err(error) => self.record_failure(frame, Some(graph), error),
                    }
                }
            }
        }
    }

    fn record_failure(&mut self, frame: FrameIndex, graph: Option<GraphHandle>, error: CaptureError) {
        match &graph {
            Some(graph) => log::error!("frame {frame}, graph '{graph}': capture skipped: {error}"),
            None => log::error!("frame {frame}: capture skipped: {error}"),
        }
        self.report.failures.push(CaptureFailure { frame, graph, error });
    }

    fn collect_writes(&mut self, outcomes: Vec<WriteOutcome>) {
        for outcome in outcomes {
            match outcome.result {
                Ok(()) => self.report.stills.push(outcome.path),
                Err(error) => self.record_failure(outcome.frame, Some(outcome.graph), error),
            }
        }
    }

    /// Finalizes open encodes, drains pending writes and flushes the timing file.
    fn flush_outputs(&mut self) {
        for (range, result) in self.exporter.finalize_all() {
            match result {
                Ok(path) => {
                    log::warn!("video range #{range} was cut short by the end of the run");
                    self.report.videos.push(path);
                }
                Err(error) => self.record_failure(self.clock.current_frame(), None, error),
            }
        }

        if let Some(writer) = self.writer.as_mut() {
            let outcomes = writer.shutdown();
            self.collect_writes(outcomes);
        }

        if let Some(timing) = self.timing.as_mut() {
            if let Err(error) = timing.flush() {
                self.record_failure(self.clock.current_frame(), None, error);
            }
        }

        self.report.unreached = self.scheduler.unreached();
        for line in &self.report.unreached {
            log::warn!("unreached capture request: {line}");
        }
    }

    fn finish(&mut self) -> Result<RunReport> {
        if self.profiler.is_capturing() {
            let requested_end = self.profile_window.and_then(|window| window.end);
            match requested_end {
                Some(end) if end > self.clock.current_frame() => {
                    log::warn!(
                        "profiling window ends at frame {end} but the run stopped at frame {}",
                        self.clock.current_frame()
                    );
                    self.report.profile = self.profiler.abort();
                }
                _ => self.report.profile = Some(self.profiler.end_capture()?),
            }
        }
        self.flush_outputs();
        self.report.stills.sort();
        Ok(std::mem::take(&mut self.report))
    }

    /// Stops the run where it is. Open encodes are still finalized, pending
    /// writes drained, and an open profiling window is closed as incomplete.
    pub fn abort(&mut self) -> RunReport {
        if let Some(partial) = self.profiler.abort() {
            self.report.profile = Some(partial);
        }
        self.flush_outputs();
        self.report.stills.sort();
        self.report.aborted = true;
        std::mem::take(&mut self.report)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use anyhow::Result;

    use super::{Harness, StepOutcome};
    use crate::clock::{FrameClock, FrameTick};
    use crate::error::{find_capture_error, CaptureError};
    use crate::exporter::tests::RecordingBackend;
    use crate::exporter::Exporter;
    use crate::profiler::Profiler;
    use crate::renderer::{FrameImage, FrameSource, RenderedFrame, TimingEvent};
    use crate::schedule::{CaptureScheduler, GraphHandle};
    use crate::session::{CaptureSession, FilenamePolicy, ImageFormat, VideoParams};

    /// Emits a constant image and a gpu time equal to the frame index.
    struct CountingSource;

    impl FrameSource for CountingSource {
        fn render_frame(&mut self, _graph: &GraphHandle, tick: FrameTick) -> Result<RenderedFrame> {
            Ok(RenderedFrame {
                image: FrameImage::new(2, 2, vec![64; 16])?,
                timings: vec![TimingEvent::new("/onFrameRender/gpuTime", tick.frame as f64)],
            })
        }
    }

    /// Like [`CountingSource`] but fails to render from `fail_at` on.
    struct FailingSource {
        fail_at: u64,
    }

    impl FrameSource for FailingSource {
        fn render_frame(&mut self, graph: &GraphHandle, tick: FrameTick) -> Result<RenderedFrame> {
            if tick.frame >= self.fail_at {
                anyhow::bail!("device lost while rendering '{graph}'");
            }
            CountingSource.render_frame(graph, tick)
        }
    }

    fn harness(exit_frame: u64, backend: RecordingBackend, out: &std::path::Path) -> Harness<CountingSource> {
        harness_with(CountingSource, exit_frame, backend, out)
    }

    fn harness_with<S: FrameSource>(
        source: S,
        exit_frame: u64,
        backend: RecordingBackend,
        out: &std::path::Path,
    ) -> Harness<S> {
        let graph = GraphHandle::new("restir");
        let stills = CaptureSession::still(out, "frame", ImageFormat::Png)
            .expect("still session")
            .with_policy(FilenamePolicy::default().with_exit_frame(Some(exit_frame)));
        let video = CaptureSession::video(out, "clip", VideoParams::default()).expect("video session");
        let exporter = Exporter::new(Box::new(backend))
            .with_still_session(stills)
            .expect("still session accepted")
            .with_video_session(video)
            .expect("video session accepted");
        Harness::new(
            source,
            vec![graph],
            FrameClock::new(60).with_exit_frame(exit_frame),
            CaptureScheduler::new(),
            exporter,
            Profiler::new(true),
        )
    }

    #[test]
    fn run_captures_scheduled_frames_and_profiles_window() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = RecordingBackend::default();
        let graph = GraphHandle::new("restir");
        let mut harness = harness(12, backend.clone(), dir.path()).with_profile_window(2, Some(5));
        harness
            .scheduler_mut()
            .add_frames(&graph, &[3, 11, 40])
            .expect("frames");
        harness
            .scheduler_mut()
            .add_ranges(&graph, &[(4, 6)])
            .expect("ranges");

        let report = harness.run().expect("run should succeed");
        assert_eq!(report.frames_rendered, 12);
        assert_eq!(
            report.stills,
            vec![dir.path().join("frame.03.png"), dir.path().join("frame.11.png")]
        );
        assert_eq!(report.videos, vec![dir.path().join("clip.0.mp4")]);
        assert!(report.failures.is_empty());
        assert_eq!(report.unreached.len(), 1);

        let profile = report.profile.expect("profile window should close");
        assert_eq!(profile.frame_count(), 3);
        let stat = profile.stat("/onFrameRender/gpuTime").expect("event");
        assert_eq!((stat.min, stat.max, stat.mean), (2.0, 4.0, 3.0));

        let log = backend.log.lock().expect("log lock");
        assert_eq!(log[0].1, 3);
        assert!(log[0].2);
    }

    #[test]
    fn cancelled_run_finalizes_video_and_marks_profile_incomplete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = RecordingBackend::default();
        let graph = GraphHandle::new("restir");
        let mut harness = harness(100, backend.clone(), dir.path()).with_profile_window(0, None);
        harness
            .scheduler_mut()
            .add_ranges(&graph, &[(0, 50)])
            .expect("ranges");

        for _ in 0..5 {
            assert!(matches!(harness.step().expect("step"), StepOutcome::Rendered(_)));
        }
        harness.cancel_handle().store(true, Ordering::Relaxed);
        let report = harness.run().expect("cancelled run still reports");

        assert!(report.aborted);
        assert_eq!(report.videos.len(), 1);
        let profile = report.profile.expect("partial profile");
        assert!(!profile.is_complete());
        assert_eq!(profile.frame_count(), 5);
        assert!(!harness.profiler().is_capturing());

        let log = backend.log.lock().expect("log lock");
        assert_eq!((log[0].1, log[0].2), (5, true));
    }

    #[test]
    fn paused_clock_refuses_to_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut harness = harness(10, RecordingBackend::default(), dir.path());
        harness.clock_mut().pause();
        assert_eq!(harness.step().expect("step"), StepOutcome::Paused);

        let error = harness.run().expect_err("paused run should fail");
        assert!(matches!(
            find_capture_error(&error),
            Some(CaptureError::State(_))
        ));
    }

    #[test]
    fn overlapping_profile_start_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut harness = harness(10, RecordingBackend::default(), dir.path()).with_profile_window(1, None);
        harness.step().expect("frame 0");
        harness.profiler.start_capture().expect("manual window");

        let error = harness.step().expect_err("second window should fail");
        assert!(matches!(
            find_capture_error(&error),
            Some(CaptureError::State(_))
        ));
    }

    #[test]
    fn render_error_still_finalizes_video_and_closes_profile() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = RecordingBackend::default();
        let graph = GraphHandle::new("restir");
        let mut harness = harness_with(FailingSource { fail_at: 5 }, 100, backend.clone(), dir.path())
            .with_profile_window(0, None);
        harness
            .scheduler_mut()
            .add_frames(&graph, &[2])
            .expect("frames");
        harness
            .scheduler_mut()
            .add_ranges(&graph, &[(0, 50)])
            .expect("ranges");

        let error = harness.run().expect_err("render failure should stop the run");
        assert!(format!("{error:#}").contains("device lost"));
        assert!(!harness.profiler().is_capturing());

        let partial = harness
            .take_interrupted_report()
            .expect("partial report should be kept");
        assert!(partial.aborted);
        assert_eq!(partial.frames_rendered, 5);
        assert_eq!(partial.stills, vec![dir.path().join("frame.02.png")]);
        assert_eq!(partial.videos, vec![dir.path().join("clip.0.mp4")]);
        assert!(!partial.profile.expect("partial profile").is_complete());
        assert!(harness.take_interrupted_report().is_none());

        let log = backend.log.lock().expect("log lock");
        assert_eq!((log[0].1, log[0].2), (5, true));
    }

    #[test]
    fn profile_window_cut_short_by_exit_is_incomplete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut harness = harness(6, RecordingBackend::default(), dir.path()).with_profile_window(2, Some(10));

        let report = harness.run().expect("run should succeed");
        let profile = report.profile.expect("profile should be reported");
        assert!(!profile.is_complete());
        assert_eq!(profile.frame_count(), 4);
        assert!(!report.aborted);
    }
}
