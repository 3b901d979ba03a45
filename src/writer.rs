use std::path::PathBuf;
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use crate::clock::FrameIndex;
use crate::error::{CaptureError, Result};
use crate::exporter::write_image_file;
use crate::renderer::FrameImage;
use crate::schedule::GraphHandle;
use crate::session::ImageFormat;

struct WriteJob {
    graph: GraphHandle,
    frame: FrameIndex,
    path: PathBuf,
    image: FrameImage,
    format: ImageFormat,
}

/// Result of one offloaded still write.
#[derive(Debug)]
pub struct WriteOutcome {
    pub graph: GraphHandle,
    /// Frame the still was captured at.
    pub frame: FrameIndex,
    pub path: PathBuf,
    pub result: Result<()>,
}

/// Encodes still images on a background thread so frame production does not
/// stall on PNG/JPEG compression.
///
/// Every submitted job produces exactly one [`WriteOutcome`]; [`StillWriter::drain`]
/// blocks until all submitted jobs are done.
pub struct StillWriter {
    sender: Option<mpsc::SyncSender<WriteJob>>,
    outcomes: mpsc::Receiver<WriteOutcome>,
    worker: Option<JoinHandle<()>>,
    pending: usize,
}

impl StillWriter {
    pub fn spawn(queue_depth: usize) -> Result<Self> {
        let (sender, jobs) = mpsc::sync_channel::<WriteJob>(queue_depth.max(1));
        let (outcome_sender, outcomes) = mpsc::channel::<WriteOutcome>();

        let worker = thread::Builder::new()
            .name("framecap-still-writer".to_owned())
            .spawn(move || {
                while let Ok(job) = jobs.recv() {
                    let result = write_image_file(&job.path, &job.image, job.format);
                    let outcome = WriteOutcome {
                        graph: job.graph,
                        frame: job.frame,
                        path: job.path,
                        result,
                    };
                    if outcome_sender.send(outcome).is_err() {
                        break;
                    }
                }
            })
            .map_err(|source| CaptureError::io("framecap-still-writer", source))?;

        Ok(Self {
            sender: Some(sender),
            outcomes,
            worker: Some(worker),
            pending: 0,
        })
    }

    /// Queues a write; blocks only when the queue is full.
    pub fn submit(
        &mut self,
        graph: GraphHandle,
        frame: FrameIndex,
        path: PathBuf,
        image: FrameImage,
        format: ImageFormat,
    ) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| CaptureError::State("still writer has been shut down".to_owned()))?;
        sender
            .send(WriteJob {
                graph,
                frame,
                path,
                image,
                format,
            })
            .map_err(|_| CaptureError::State("still writer thread stopped".to_owned()))?;
        self.pending += 1;
        Ok(())
    }

    pub fn pending(&self) -> usize {
        self.pending
    }

    /// Collects outcomes that are already available without blocking.
    pub fn poll(&mut self) -> Vec<WriteOutcome> {
        let mut done = Vec::new();
        while let Ok(outcome) = self.outcomes.try_recv() {
            self.pending -= 1;
            done.push(outcome);
        }
        done
    }

    /// Waits for every submitted write to complete.
    pub fn drain(&mut self) -> Vec<WriteOutcome> {
        let mut done = Vec::with_capacity(self.pending);
        while self.pending > 0 {
            match self.outcomes.recv() {
                Ok(outcome) => {
                    self.pending -= 1;
                    done.push(outcome);
                }
                Err(_) => {
                    log::error!(
                        "still writer stopped with {} write(s) unaccounted for",
                        self.pending
                    );
                    self.pending = 0;
                }
            }
        }
        done
    }

    /// Drains outstanding writes and stops the worker thread.
    pub fn shutdown(&mut self) -> Vec<WriteOutcome> {
        let done = self.drain();
        drop(self.sender.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("still writer thread panicked");
            }
        }
        done
    }
}

impl Drop for StillWriter {
    fn drop(&mut self) {
        for outcome in self.shutdown() {
            if let Err(error) = outcome.result {
                log::error!("still write failed during shutdown: {error}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::StillWriter;
    use crate::error::CaptureError;
    use crate::renderer::FrameImage;
    use crate::schedule::GraphHandle;
    use crate::session::ImageFormat;

    fn image() -> FrameImage {
        FrameImage::new(2, 2, vec![200; 16]).expect("image should build")
    }

    #[test]
    fn drain_waits_for_all_writes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = StillWriter::spawn(2).expect("writer should spawn");
        for frame in 0..6 {
            writer
                .submit(
                    GraphHandle::new("restir"),
                    frame,
                    dir.path().join(format!("frame.{frame}.png")),
                    image(),
                    ImageFormat::Png,
                )
                .expect("submit should succeed");
        }

        let mut outcomes = writer.drain();
        assert_eq!(writer.pending(), 0);
        outcomes.extend(writer.poll());
        assert_eq!(outcomes.len(), 6);
        for outcome in outcomes {
            assert!(outcome.result.is_ok());
            assert!(outcome.path.is_file());
        }
    }

    #[test]
    fn failed_write_is_reported_not_swallowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut writer = StillWriter::spawn(1).expect("writer should spawn");
        writer
            .submit(
                GraphHandle::new("restir"),
                7,
                dir.path().join("missing/frame.7.png"),
                image(),
                ImageFormat::Png,
            )
            .expect("submit should succeed");

        let outcomes = writer.shutdown();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0].result, Err(CaptureError::Io { .. })));
        assert_eq!(outcomes[0].frame, 7);
        assert_eq!(outcomes[0].graph.name(), "restir");
        assert!(writer
            .submit(
                GraphHandle::new("restir"),
                8,
                dir.path().join("late.png"),
                image(),
                ImageFormat::Png
            )
            .is_err());
    }
}
