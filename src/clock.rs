/// Ordinal count of rendered frames since the start of a run.
pub type FrameIndex = u64;

/// Frame/time snapshot handed to schedulers and frame sources.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameTick {
    pub frame: FrameIndex,
    /// Simulation time in seconds, derived from the frame index and the clock rate.
    pub time: f64,
}

impl FrameTick {
    pub fn at(frame: FrameIndex, fps: u32) -> Self {
        Self {
            frame,
            time: frame as f64 / f64::from(fps.max(1)),
        }
    }
}

/// Result of [`FrameClock::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Continue,
    Paused,
    Exit,
}

impl Advance {
    pub fn is_exit(self) -> bool {
        matches!(self, Self::Exit)
    }
}

/// Authoritative frame counter for a run.
///
/// The index only moves forward. Pausing freezes both the index and the
/// simulation time; the exit frame bounds the run and may be changed at any
/// point, including below the current frame.
#[derive(Debug, Clone)]
pub struct FrameClock {
    frame: FrameIndex,
    fps: u32,
    exit_frame: Option<FrameIndex>,
    paused: bool,
}

impl FrameClock {
    pub fn new(fps: u32) -> Self {
        debug_assert!(fps > 0);
        Self {
            frame: 0,
            fps: fps.max(1),
            exit_frame: None,
            paused: false,
        }
    }

    pub fn with_exit_frame(mut self, exit_frame: FrameIndex) -> Self {
        self.exit_frame = Some(exit_frame);
        self
    }

    pub fn current_frame(&self) -> FrameIndex {
        self.frame
    }

    pub fn time(&self) -> f64 {
        self.tick().time
    }

    pub fn tick(&self) -> FrameTick {
        FrameTick::at(self.frame, self.fps)
    }

    pub fn fps(&self) -> u32 {
        self.fps
    }

    pub fn exit_frame(&self) -> Option<FrameIndex> {
        self.exit_frame
    }

    pub fn set_exit_frame(&mut self, exit_frame: Option<FrameIndex>) {
        self.exit_frame = exit_frame;
    }

    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// True once the current frame has reached the exit frame.
    pub fn is_finished(&self) -> bool {
        self.exit_frame
            .map_or(false, |exit_frame| self.frame >= exit_frame)
    }

    /// Moves to the next frame and reports whether the run should stop.
    pub fn advance(&mut self) -> Advance {
        if self.paused {
            return if self.is_finished() {
                Advance::Exit
            } else {
                Advance::Paused
            };
        }

        self.frame += 1;
        if self.is_finished() {
            Advance::Exit
        } else {
            Advance::Continue
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Advance, FrameClock, FrameTick};

    #[test]
    fn advance_reports_exit_at_exit_frame() {
        let mut clock = FrameClock::new(60).with_exit_frame(3);
        assert_eq!(clock.advance(), Advance::Continue);
        assert_eq!(clock.advance(), Advance::Continue);
        assert_eq!(clock.advance(), Advance::Exit);
        assert_eq!(clock.current_frame(), 3);
    }

    #[test]
    fn pause_freezes_frame_and_time() {
        let mut clock = FrameClock::new(10).with_exit_frame(100);
        clock.advance();
        clock.pause();
        assert_eq!(clock.advance(), Advance::Paused);
        assert_eq!(clock.current_frame(), 1);
        assert!((clock.time() - 0.1).abs() < 1e-12);

        clock.resume();
        assert_eq!(clock.advance(), Advance::Continue);
        assert_eq!(clock.current_frame(), 2);
    }

    #[test]
    fn lowering_exit_frame_below_current_stops_on_next_advance() {
        let mut clock = FrameClock::new(30).with_exit_frame(50);
        for _ in 0..10 {
            clock.advance();
        }
        clock.set_exit_frame(Some(4));
        assert_eq!(clock.advance(), Advance::Exit);
        assert_eq!(clock.current_frame(), 11);
    }

    #[test]
    fn unbounded_clock_never_exits() {
        let mut clock = FrameClock::new(30);
        for _ in 0..1000 {
            assert!(!clock.advance().is_exit());
        }
        assert!(!clock.is_finished());
    }

    #[test]
    fn tick_time_follows_frame_rate() {
        let tick = FrameTick::at(90, 60);
        assert_eq!(tick.frame, 90);
        assert!((tick.time - 1.5).abs() < 1e-12);
    }
}
