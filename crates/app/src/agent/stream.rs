//! Stream dispatcher: one worker turning [`StreamJob`]s into annotated,
//! JPEG/base64-encoded frames for the dashboard.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use tracing::debug;

use crate::agent::{
    annotation,
    channel::ChannelError,
    config::StreamSettings,
    data::{StreamJob, StreamPayload},
    encoding,
    faults::{FaultCounters, FaultKind},
    worker::{
        DispatchStats, DispatcherReport, ErrorTracker, SubmitOutcome, Worker, WorkerFlags,
        try_enqueue, wait_for_drain,
    },
};

/// Sink for encoded frames.
pub trait FramePublisher: Send + Sync {
    /// Frames are only encoded and published while this is true.
    fn is_connected(&self) -> bool;

    fn publish_frame(&self, payload: &StreamPayload) -> Result<(), ChannelError>;
}

pub struct StreamDispatcher {
    jobs: Sender<StreamJob>,
    stats: Arc<DispatchStats>,
    worker: Worker,
}

impl StreamDispatcher {
    pub fn spawn(
        publisher: Arc<dyn FramePublisher>,
        settings: &StreamSettings,
        subject: impl Into<String>,
        faults: Arc<FaultCounters>,
    ) -> Result<Self> {
        let (jobs_tx, jobs_rx) = crossbeam_channel::bounded(settings.queue_capacity.max(1));
        let stats = Arc::new(DispatchStats::default());
        let worker_state = StreamWorker {
            publisher,
            jobs: jobs_rx,
            stats: stats.clone(),
            faults,
            errors: ErrorTracker::new("Frame publish", settings.error_log_threshold),
            jpeg_quality: settings.jpeg_quality,
            subject: subject.into(),
            dequeue_timeout: settings.dequeue_timeout,
        };
        let worker = Worker::spawn("stream-worker", move |flags| worker_state.run(flags))
            .context("Failed to spawn stream worker")?;
        Ok(Self {
            jobs: jobs_tx,
            stats,
            worker,
        })
    }

    /// Non-blocking; when the queue is full the new frame is dropped.
    pub fn submit(&self, job: StreamJob) -> SubmitOutcome {
        try_enqueue(&self.jobs, job, "stream", &self.stats)
    }

    pub fn pending(&self) -> usize {
        self.jobs.len() + usize::from(self.worker.is_busy())
    }

    pub fn shutdown(mut self, drain_timeout: Duration, join_timeout: Duration) -> DispatcherReport {
        let drained = wait_for_drain(|| self.pending(), drain_timeout);
        let join = self.worker.stop(join_timeout);
        DispatcherReport {
            drained,
            join,
            stats: self.stats.snapshot(),
        }
    }
}

struct StreamWorker {
    publisher: Arc<dyn FramePublisher>,
    jobs: Receiver<StreamJob>,
    stats: Arc<DispatchStats>,
    faults: Arc<FaultCounters>,
    errors: ErrorTracker,
    jpeg_quality: u8,
    subject: String,
    dequeue_timeout: Duration,
}

impl StreamWorker {
    fn run(mut self, flags: WorkerFlags) {
        let span = tracing::info_span!("stream.worker", quality = self.jpeg_quality);
        let _guard = span.enter();

        while flags.is_running() {
            match self.jobs.recv_timeout(self.dequeue_timeout) {
                Ok(job) => {
                    let _busy = flags.busy();
                    self.process(job);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        debug!("Stream worker stopped");
    }

    fn process(&mut self, job: StreamJob) {
        if !self.publisher.is_connected() {
            self.stats.record_skipped(1);
            return;
        }
        let sequence = job.frame.sequence;
        let payload = match self.render(&job) {
            Ok(payload) => payload,
            Err(err) => {
                self.stats.record_failed();
                self.faults.record(FaultKind::Transport);
                self.errors
                    .record_failure(&format!("frame #{sequence} not encoded: {err:#}"));
                return;
            }
        };
        match self.publisher.publish_frame(&payload) {
            Ok(()) => {
                self.stats.record_delivered();
                self.errors.record_success();
                metrics::counter!("agent_frames_published_total").increment(1);
            }
            Err(err) => {
                self.stats.record_failed();
                self.faults.record(FaultKind::Transport);
                self.errors.record_failure(&err);
            }
        }
    }

    fn render(&self, job: &StreamJob) -> Result<StreamPayload> {
        let mut image = encoding::frame_to_rgb(&job.frame)?;
        annotation::annotate(&mut image, &job.boxes, &job.dominant, &self.subject, job.fps);
        let frame = encoding::encode_for_transport(&image, self.jpeg_quality)?;
        Ok(StreamPayload {
            frame,
            timestamp_ms: job.frame.timestamp_ms,
        })
    }
}
