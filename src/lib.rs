//! Deterministic frame-indexed capture scheduling and profiling for offline
//! render benchmarks.
//!
//! A [`harness::Harness`] advances a [`clock::FrameClock`], asks the
//! [`schedule::CaptureScheduler`] what to capture on each frame, hands the
//! resulting actions to the [`exporter::Exporter`], and feeds renderer timing
//! events into the [`profiler::Profiler`].

pub mod clock;
pub mod encoding;
pub mod error;
pub mod exporter;
pub mod harness;
pub mod logging;
pub mod manifest;
pub mod profiler;
pub mod renderer;
pub mod schedule;
pub mod schema;
pub mod session;
pub mod timing;
pub mod writer;
