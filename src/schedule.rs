use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::clock::{FrameIndex, FrameTick};
use crate::error::{CaptureError, Result};

/// Names a render graph instance. Schedules are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GraphHandle(String);

impl GraphHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GraphHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Work the exporter must do for one graph at one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureAction {
    Still {
        graph: GraphHandle,
        frame: FrameIndex,
    },
    VideoFrame {
        graph: GraphHandle,
        /// Index of the range in registration order; also names the output file.
        range: usize,
        frame: FrameIndex,
        /// Set on the range's last frame: the encode must be finalized after appending.
        finalize: bool,
    },
}

/// Decides whether a still capture is due on a given tick.
///
/// Policies are polled once per rendered frame, in frame order.
pub trait TriggerPolicy: fmt::Debug + Send {
    fn fires(&mut self, tick: FrameTick) -> bool;

    /// Human readable description of requests that have not fired yet.
    fn pending(&self) -> Option<String>;
}

/// Fires on an exact set of frame indices, each at most once.
#[derive(Debug, Clone, Default)]
pub struct FrameSetTrigger {
    frames: BTreeSet<FrameIndex>,
}

impl FrameSetTrigger {
    pub fn insert(&mut self, frame: FrameIndex) -> bool {
        self.frames.insert(frame)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn contains(&self, frame: FrameIndex) -> bool {
        self.frames.contains(&frame)
    }
}

impl TriggerPolicy for FrameSetTrigger {
    fn fires(&mut self, tick: FrameTick) -> bool {
        self.frames.remove(&tick.frame)
    }

    fn pending(&self) -> Option<String> {
        if self.frames.is_empty() {
            return None;
        }
        let frames = self
            .frames
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("frames [{frames}]"))
    }
}

/// Fires on every frame whose simulation time lies in `[start, end]`.
///
/// Each matching frame yields its own capture; the window is inclusive on both ends.
#[derive(Debug, Clone)]
pub struct TimeWindowTrigger {
    start: f64,
    end: f64,
    fired: usize,
    passed: bool,
}

impl TimeWindowTrigger {
    pub fn new(start: f64, end: f64) -> Result<Self> {
        if !start.is_finite() || !end.is_finite() || start < 0.0 {
            return Err(CaptureError::InvalidSchedule(format!(
                "time window [{start}, {end}] must be finite and non-negative"
            )));
        }
        if start > end {
            return Err(CaptureError::InvalidSchedule(format!(
                "time window start {start} is after end {end}"
            )));
        }
        Ok(Self {
            start,
            end,
            fired: 0,
            passed: false,
        })
    }
}

impl TriggerPolicy for TimeWindowTrigger {
    fn fires(&mut self, tick: FrameTick) -> bool {
        if tick.time > self.end {
            self.passed = true;
            return false;
        }
        if tick.time >= self.start {
            self.fired += 1;
            return true;
        }
        false
    }

    fn pending(&self) -> Option<String> {
        if self.passed || self.fired > 0 {
            return None;
        }
        Some(format!("time window [{}, {}]", self.start, self.end))
    }
}

/// Rejects negative still frame indices.
pub fn check_frames(graph: &GraphHandle, frames: &[i64]) -> Result<()> {
    match frames.iter().find(|frame| **frame < 0) {
        Some(bad) => Err(CaptureError::InvalidSchedule(format!(
            "frame index {bad} for graph '{graph}' is negative"
        ))),
        None => Ok(()),
    }
}

/// Rejects inclusive video ranges that start below zero or end before they start.
pub fn check_range(graph: &GraphHandle, start: i64, end: i64) -> Result<()> {
    if start < 0 {
        return Err(CaptureError::InvalidSchedule(format!(
            "video range [{start}, {end}] for graph '{graph}' starts at a negative frame"
        )));
    }
    if start > end {
        return Err(CaptureError::InvalidSchedule(format!(
            "video range [{start}, {end}] for graph '{graph}' has start after end"
        )));
    }
    Ok(())
}

#[derive(Debug, Default)]
struct GraphSchedule {
    frames: FrameSetTrigger,
    triggers: Vec<Box<dyn TriggerPolicy>>,
    last_still: Option<FrameIndex>,
}

#[derive(Debug, Clone)]
struct VideoRange {
    graph: GraphHandle,
    start: FrameIndex,
    end: FrameIndex,
    next: FrameIndex,
    closed: bool,
}

/// Holds still-frame and video-range requests and turns frame boundaries into
/// [`CaptureAction`]s.
///
/// A still for a given graph and frame is dispatched at most once, and a video
/// range receives each of its frames at most once, so re-querying a frame that
/// was already handled yields nothing.
#[derive(Debug, Default)]
pub struct CaptureScheduler {
    graphs: BTreeMap<GraphHandle, GraphSchedule>,
    ranges: Vec<VideoRange>,
}

impl CaptureScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers still captures. Duplicates collapse; returns how many indices were new.
    ///
    /// Any negative index rejects the whole call and leaves the schedule untouched.
    pub fn add_frames(&mut self, graph: &GraphHandle, frames: &[i64]) -> Result<usize> {
        check_frames(graph, frames)?;

        let schedule = self.graphs.entry(graph.clone()).or_default();
        let added = frames
            .iter()
            .filter(|frame| schedule.frames.insert(**frame as FrameIndex))
            .count();
        log::debug!(
            "graph '{}': {} still frame(s) registered, {} new",
            graph,
            frames.len(),
            added
        );
        Ok(added)
    }

    /// Registers video ranges (inclusive). Returns the index assigned to each range.
    pub fn add_ranges(&mut self, graph: &GraphHandle, ranges: &[(i64, i64)]) -> Result<Vec<usize>> {
        for &(start, end) in ranges {
            check_range(graph, start, end)?;
        }

        let mut indices = Vec::with_capacity(ranges.len());
        for &(start, end) in ranges {
            indices.push(self.ranges.len());
            self.ranges.push(VideoRange {
                graph: graph.clone(),
                start: start as FrameIndex,
                end: end as FrameIndex,
                next: start as FrameIndex,
                closed: false,
            });
        }
        Ok(indices)
    }

    /// Registers a time-window still trigger for `graph`.
    pub fn add_time_window(&mut self, graph: &GraphHandle, start: f64, end: f64) -> Result<()> {
        let trigger = TimeWindowTrigger::new(start, end)?;
        self.add_trigger(graph, Box::new(trigger));
        Ok(())
    }

    pub fn add_trigger(&mut self, graph: &GraphHandle, trigger: Box<dyn TriggerPolicy>) {
        self.graphs
            .entry(graph.clone())
            .or_default()
            .triggers
            .push(trigger);
    }

    /// Called once per rendered frame and graph.
    pub fn on_frame(&mut self, graph: &GraphHandle, tick: FrameTick) -> Vec<CaptureAction> {
        let mut actions = Vec::new();

        if let Some(schedule) = self.graphs.get_mut(graph) {
            // Every policy is polled so each sees the tick, even when an earlier one fired.
            let mut fired = schedule.frames.fires(tick);
            for trigger in &mut schedule.triggers {
                fired |= trigger.fires(tick);
            }
            if fired && schedule.last_still != Some(tick.frame) {
                schedule.last_still = Some(tick.frame);
                actions.push(CaptureAction::Still {
                    graph: graph.clone(),
                    frame: tick.frame,
                });
            }
        }

        for (index, range) in self.ranges.iter_mut().enumerate() {
            if range.closed || &range.graph != graph {
                continue;
            }
            if tick.frame < range.next || tick.frame > range.end {
                continue;
            }
            let finalize = tick.frame == range.end;
            range.next = tick.frame + 1;
            range.closed = finalize;
            actions.push(CaptureAction::VideoFrame {
                graph: graph.clone(),
                range: index,
                frame: tick.frame,
                finalize,
            });
        }

        actions
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Ranges that started appending but never reached their last frame.
    pub fn open_ranges(&self) -> Vec<usize> {
        self.ranges
            .iter()
            .enumerate()
            .filter(|(_, range)| !range.closed && range.next > range.start)
            .map(|(index, _)| index)
            .collect()
    }

    /// Requests that were never dispatched, one line per graph or range.
    pub fn unreached(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (graph, schedule) in &self.graphs {
            if let Some(pending) = schedule.frames.pending() {
                lines.push(format!("graph '{graph}': {pending}"));
            }
            for trigger in &schedule.triggers {
                if let Some(pending) = trigger.pending() {
                    lines.push(format!("graph '{graph}': {pending}"));
                }
            }
        }
        for (index, range) in self.ranges.iter().enumerate() {
            if !range.closed {
                lines.push(format!(
                    "graph '{}': video range #{index} [{}, {}] stopped at frame {}",
                    range.graph, range.start, range.end, range.next
                ));
            }
        }
        lines
    }
}

#[cfg(test)]
mod tests {
    use super::{CaptureAction, CaptureScheduler, GraphHandle};
    use crate::clock::FrameTick;
    use crate::error::CaptureError;

    fn tick(frame: u64) -> FrameTick {
        FrameTick::at(frame, 60)
    }

    fn stills(actions: &[CaptureAction]) -> Vec<u64> {
        actions
            .iter()
            .filter_map(|action| match action {
                CaptureAction::Still { frame, .. } => Some(*frame),
                CaptureAction::VideoFrame { .. } => None,
            })
            .collect()
    }

    #[test]
    fn duplicate_frames_dispatch_once() {
        let graph = GraphHandle::new("restir");
        let mut scheduler = CaptureScheduler::new();
        let added = scheduler
            .add_frames(&graph, &[100, 100, 200])
            .expect("frames should register");
        assert_eq!(added, 2);

        let mut dispatched = Vec::new();
        for frame in 0..=300 {
            dispatched.extend(stills(&scheduler.on_frame(&graph, tick(frame))));
        }
        assert_eq!(dispatched, vec![100, 200]);
    }

    #[test]
    fn requery_of_same_frame_returns_nothing() {
        let graph = GraphHandle::new("restir");
        let mut scheduler = CaptureScheduler::new();
        scheduler
            .add_frames(&graph, &[5])
            .expect("frames should register");
        scheduler
            .add_time_window(&graph, 0.0, 1.0)
            .expect("window should register");

        assert_eq!(stills(&scheduler.on_frame(&graph, tick(5))), vec![5]);
        assert!(scheduler.on_frame(&graph, tick(5)).is_empty());
    }

    #[test]
    fn negative_frame_is_rejected_without_touching_schedule() {
        let graph = GraphHandle::new("restir");
        let mut scheduler = CaptureScheduler::new();
        scheduler
            .add_frames(&graph, &[10])
            .expect("frames should register");

        let error = scheduler
            .add_frames(&graph, &[20, -1])
            .expect_err("negative frame should fail");
        assert!(matches!(error, CaptureError::InvalidSchedule(_)));

        assert!(stills(&scheduler.on_frame(&graph, tick(20))).is_empty());
        assert_eq!(stills(&scheduler.on_frame(&graph, tick(10))), vec![10]);
    }

    #[test]
    fn inverted_range_is_rejected() {
        let graph = GraphHandle::new("restir");
        let mut scheduler = CaptureScheduler::new();
        let error = scheduler
            .add_ranges(&graph, &[(0, 10), (30, 20)])
            .expect_err("inverted range should fail");
        assert!(matches!(error, CaptureError::InvalidSchedule(_)));
        assert_eq!(scheduler.range_count(), 0);
    }

    #[test]
    fn video_range_appends_every_frame_once_and_finalizes_on_last() {
        let graph = GraphHandle::new("restir");
        let mut scheduler = CaptureScheduler::new();
        let indices = scheduler
            .add_ranges(&graph, &[(3, 6)])
            .expect("range should register");
        assert_eq!(indices, vec![0]);

        let mut appended = Vec::new();
        let mut finalized = 0;
        for frame in 0..10 {
            for action in scheduler.on_frame(&graph, tick(frame)) {
                if let CaptureAction::VideoFrame {
                    frame, finalize, ..
                } = action
                {
                    appended.push(frame);
                    finalized += usize::from(finalize);
                }
            }
            // Re-query must not double-append.
            assert!(scheduler.on_frame(&graph, tick(frame)).is_empty());
        }
        assert_eq!(appended, vec![3, 4, 5, 6]);
        assert_eq!(finalized, 1);
        assert!(scheduler.unreached().is_empty());
    }

    #[test]
    fn still_and_overlapping_ranges_fire_independently() {
        let graph = GraphHandle::new("restir");
        let mut scheduler = CaptureScheduler::new();
        scheduler
            .add_frames(&graph, &[4])
            .expect("frames should register");
        scheduler
            .add_ranges(&graph, &[(0, 4), (4, 8)])
            .expect("ranges should register");

        let mut actions = Vec::new();
        for frame in 0..=4 {
            actions = scheduler.on_frame(&graph, tick(frame));
        }
        assert_eq!(actions.len(), 3);
        assert!(actions.contains(&CaptureAction::Still {
            graph: graph.clone(),
            frame: 4
        }));
        assert!(actions.contains(&CaptureAction::VideoFrame {
            graph: graph.clone(),
            range: 0,
            frame: 4,
            finalize: true
        }));
        assert!(actions.contains(&CaptureAction::VideoFrame {
            graph: graph.clone(),
            range: 1,
            frame: 4,
            finalize: false
        }));
        assert_eq!(scheduler.open_ranges(), vec![1]);
    }

    #[test]
    fn schedules_are_keyed_by_graph() {
        let primary = GraphHandle::new("restir");
        let other = GraphHandle::new("reference");
        let mut scheduler = CaptureScheduler::new();
        scheduler
            .add_frames(&primary, &[1])
            .expect("frames should register");

        assert!(scheduler.on_frame(&other, tick(1)).is_empty());
        assert_eq!(stills(&scheduler.on_frame(&primary, tick(1))), vec![1]);
    }

    #[test]
    fn time_window_captures_each_frame_inside_window() {
        let graph = GraphHandle::new("restir");
        let mut scheduler = CaptureScheduler::new();
        scheduler
            .add_time_window(&graph, 0.5, 0.55)
            .expect("window should register");

        let mut dispatched = Vec::new();
        for frame in 0..60 {
            dispatched.extend(stills(&scheduler.on_frame(&graph, tick(frame))));
        }
        // 0.5s..0.55s at 60 fps covers frames 30, 31, 32, 33.
        assert_eq!(dispatched, vec![30, 31, 32, 33]);
        assert!(scheduler.unreached().is_empty());
    }

    #[test]
    fn unreached_reports_frames_beyond_run() {
        let graph = GraphHandle::new("restir");
        let mut scheduler = CaptureScheduler::new();
        scheduler
            .add_frames(&graph, &[2, 500])
            .expect("frames should register");
        for frame in 0..10 {
            scheduler.on_frame(&graph, tick(frame));
        }
        let unreached = scheduler.unreached();
        assert_eq!(unreached.len(), 1);
        assert!(unreached[0].contains("500"));
    }
}
