//! Main loop tying together the camera, the inference gate, both
//! dispatchers and the control channel.
//!
//! The loop owns the camera handle and runs one capture tick per iteration.
//! Everything it hands to other threads goes through the two bounded
//! dispatcher queues; the only shared mutable value it reads is
//! [`ControlState`].

use std::{
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Once,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use ml_core::Classifier;
use tracing::{debug, error, info, warn};
use video_ingest::{CameraManager, CameraOpener, CaptureError, FailureOutcome, InitOutcome};

use crate::agent::{
    actuation::{ActuationDispatcher, ActuatorClient},
    channel::{ChannelTransport, RemoteControlChannel},
    config::AgentConfig,
    control::ControlState,
    data::{FpsWindow, StreamJob, Throttle},
    faults::{FaultCounters, FaultKind},
    gate::InferenceGate,
    stream::{FramePublisher, StreamDispatcher},
    worker::{DispatcherReport, SubmitOutcome, wait_for_drain},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AgentState {
    Starting,
    Running,
    /// No usable camera; control traffic is still serviced.
    Degraded,
    Stopping,
    Stopped,
}

/// External capabilities the agent is built from.
pub struct Collaborators<O, A> {
    pub opener: O,
    /// `None` runs with detection disabled.
    pub classifier: Option<Box<dyn Classifier>>,
    pub actuator: A,
    /// `None` runs standalone.
    pub transport: Option<Arc<dyn ChannelTransport>>,
}

/// Result of one loop iteration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    /// Stop flag observed.
    Stopped,
    /// Disabled or degraded; slept one idle interval.
    Idle,
    ReadFailed,
    /// Frame captured and dispatched.
    Frame(u64),
}

#[derive(Clone, Debug)]
pub struct ShutdownReport {
    pub actuation: Option<DispatcherReport>,
    pub stream: Option<DispatcherReport>,
    pub frames: u64,
    pub faults: u64,
}

pub struct Agent<O: CameraOpener> {
    config: AgentConfig,
    state: AgentState,
    camera: CameraManager<O>,
    gate: InferenceGate,
    control: Arc<ControlState>,
    channel: Arc<RemoteControlChannel>,
    actuation: Option<ActuationDispatcher>,
    stream: Option<StreamDispatcher>,
    faults: Arc<FaultCounters>,
    fps: FpsWindow,
    actuation_throttle: Throttle,
    frame_throttle: Throttle,
    stop: Arc<AtomicBool>,
    frames: u64,
    report: Option<ShutdownReport>,
}

impl<O: CameraOpener> Agent<O> {
    /// STARTING: camera, actuation worker, control channel, stream worker.
    /// A missing camera or unreachable server degrades; only failing to
    /// spawn a worker is an error.
    pub fn start<A: ActuatorClient>(
        config: AgentConfig,
        parts: Collaborators<O, A>,
        stop: Arc<AtomicBool>,
    ) -> Result<Self> {
        let faults = Arc::new(FaultCounters::new());
        let control = Arc::new(ControlState::new(config.start_enabled));

        let mut camera = CameraManager::new(parts.opener, config.camera, config.reinit);
        let state = match camera.initialize() {
            InitOutcome::Ready(_) => AgentState::Running,
            InitOutcome::Degraded => {
                faults.record(FaultKind::Camera);
                AgentState::Degraded
            }
        };

        let actuation = ActuationDispatcher::spawn(
            parts.actuator,
            &config.actuation,
            control.clone(),
            faults.clone(),
        )?;
        if config.probe_actuator {
            actuation.submit_zero();
        }

        let channel = RemoteControlChannel::new(
            parts.transport,
            control.clone(),
            actuation.handle(),
            faults.clone(),
            config.actuation.error_log_threshold,
        );
        channel.connect();

        let publisher: Arc<dyn FramePublisher> = channel.clone();
        let stream = StreamDispatcher::spawn(
            publisher,
            &config.stream,
            config.inference.target_label.clone(),
            faults.clone(),
        )?;

        let gate = InferenceGate::new(
            parts.classifier,
            config.inference.skip_factor,
            config.inference.confidence_threshold,
            config.inference.target_label.clone(),
            faults.clone(),
        );
        if !gate.is_enabled() {
            warn!("No classifier available; detection disabled");
        }

        info!(
            "Agent started ({:?}); capture {}",
            state,
            if control.snapshot() {
                "enabled"
            } else {
                "waiting for a start command"
            }
        );

        Ok(Self {
            fps: FpsWindow::new(config.fps_window),
            actuation_throttle: Throttle::new(config.actuation_interval),
            frame_throttle: Throttle::new(config.frame_interval),
            config,
            state,
            camera,
            gate,
            control,
            channel,
            actuation: Some(actuation),
            stream: Some(stream),
            faults,
            stop,
            frames: 0,
            report: None,
        })
    }

    /// Run ticks until the stop flag is set or a tick fails, then shut down.
    pub fn run(mut self) -> ShutdownReport {
        let span = tracing::info_span!(
            "agent.pipeline",
            width = self.config.camera.width,
            height = self.config.camera.height,
            skip = self.config.inference.skip_factor,
            camera = ?self.camera.info().map(|info| info.index),
            channel = self.channel.is_connected()
        );
        let _guard = span.enter();

        loop {
            match panic::catch_unwind(AssertUnwindSafe(|| self.tick())) {
                Ok(Ok(Tick::Stopped)) => {
                    info!("Stop requested");
                    break;
                }
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    self.faults.record(FaultKind::Unhandled);
                    error!("Capture loop failed: {err:#}");
                    break;
                }
                Err(_) => {
                    self.faults.record(FaultKind::Unhandled);
                    error!("Capture loop panicked");
                    break;
                }
            }
        }
        self.shutdown()
    }

    /// One iteration of the main loop.
    pub fn tick(&mut self) -> Result<Tick> {
        if self.stop.load(Ordering::SeqCst) || self.report.is_some() {
            return Ok(Tick::Stopped);
        }
        let enabled = self.control.snapshot();
        if !enabled || self.state == AgentState::Degraded {
            thread::sleep(self.config.idle_interval);
            return Ok(Tick::Idle);
        }

        let frame = match self.camera.read_frame() {
            Ok(frame) => frame,
            Err(err) => {
                self.on_read_failure(err);
                thread::sleep(self.config.idle_interval);
                return Ok(Tick::ReadFailed);
            }
        };
        self.camera.record_success();
        self.frames = self.frames.wrapping_add(1);
        self.fps.push(frame.captured_at);
        let fps = self.fps.fps();
        metrics::gauge!("agent_capture_fps").set(fps as f64);

        let sequence = frame.sequence;
        let capture_span = tracing::info_span!("capture.frame", frame = sequence, fps = fps);
        let _capture_guard = capture_span.enter();

        let decision = self.gate.process(&frame);
        if sequence % 30 == 0 {
            debug!("Capture heartbeat: frame #{sequence}, {fps:.1} fps, gate {decision:?}");
        }

        // a stop may have arrived while the read or classification blocked
        if !self.control.snapshot() {
            debug!("Capture disabled mid-frame; dropping frame #{sequence}");
            return Ok(Tick::Idle);
        }

        let now = Instant::now();
        if self.actuation_throttle.ready(now) {
            let dominant = self.gate.current();
            let outcome = self
                .actuation
                .as_ref()
                .map(|actuation| actuation.submit(dominant.area(), dominant.confidence()));
            if outcome == Some(SubmitOutcome::Closed) {
                bail!("actuation worker is no longer accepting commands");
            }
            self.channel.emit_detection(dominant);
        }

        if self.frame_throttle.ready(now) {
            if let Some(stream) = &self.stream {
                let job = StreamJob {
                    frame,
                    boxes: self.gate.overlay().to_vec(),
                    dominant: self.gate.current().clone(),
                    fps,
                };
                if stream.submit(job) == SubmitOutcome::Closed {
                    bail!("stream worker is no longer accepting frames");
                }
            }
        }

        Ok(Tick::Frame(sequence))
    }

    fn on_read_failure(&mut self, err: CaptureError) {
        self.faults.record(FaultKind::Camera);
        match self.camera.record_failure() {
            FailureOutcome::Counted(count) => {
                debug!("Frame read failed ({count} in a row): {err}");
            }
            FailureOutcome::Reinitialized(outcome) => {
                metrics::counter!("agent_camera_reinit_total").increment(1);
                if outcome.is_ready() {
                    info!("Camera recovered after reinitialisation");
                } else {
                    self.faults.record(FaultKind::Camera);
                    warn!("Camera reinitialisation failed; entering degraded mode");
                    self.state = AgentState::Degraded;
                }
            }
        }
    }

    /// STOPPING: stop flag, zero command, bounded drain, bounded join,
    /// camera release, final status and channel close. Idempotent.
    pub fn shutdown(&mut self) -> ShutdownReport {
        if let Some(report) = &self.report {
            return report.clone();
        }
        self.state = AgentState::Stopping;
        self.stop.store(true, Ordering::SeqCst);
        self.control.disable();
        info!("Stopping agent");

        if let Some(actuation) = &self.actuation {
            let outcome = actuation.submit_zero();
            debug!("Shutdown zero command: {outcome:?}");
        }

        let drained = wait_for_drain(
            || {
                self.actuation.as_ref().map_or(0, |a| a.pending())
                    + self.stream.as_ref().map_or(0, |s| s.pending())
            },
            self.config.drain_timeout,
        );
        if !drained {
            warn!(
                "Dispatch queues not drained within {:?}; continuing shutdown",
                self.config.drain_timeout
            );
        }

        let join_timeout = self.config.join_timeout;
        let actuation = self
            .actuation
            .take()
            .map(|a| a.shutdown(Duration::ZERO, join_timeout));
        let stream = self
            .stream
            .take()
            .map(|s| s.shutdown(Duration::ZERO, join_timeout));

        self.camera.release();
        self.channel.disconnect();
        self.state = AgentState::Stopped;

        if let Some(report) = &actuation {
            info!("Actuation: {} ({:?})", report.stats, report.join);
        }
        if let Some(report) = &stream {
            info!("Stream: {} ({:?})", report.stats, report.join);
        }
        info!(
            "Agent stopped after {} frames ({} of {} gated frames classified); faults: {}",
            self.frames,
            self.gate.classified(),
            self.gate.frames_seen(),
            self.faults
        );

        let report = ShutdownReport {
            actuation,
            stream,
            frames: self.frames,
            faults: self.faults.total(),
        };
        self.report = Some(report.clone());
        report
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn control(&self) -> &Arc<ControlState> {
        &self.control
    }

    pub fn channel(&self) -> &Arc<RemoteControlChannel> {
        &self.channel
    }

    pub fn faults(&self) -> &Arc<FaultCounters> {
        &self.faults
    }

    pub fn camera(&self) -> &CameraManager<O> {
        &self.camera
    }

    pub fn gate(&self) -> &InferenceGate {
        &self.gate
    }

    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }
}

impl<O: CameraOpener> Drop for Agent<O> {
    fn drop(&mut self) {
        if self.report.is_none() {
            self.shutdown();
        }
    }
}

/// Route Ctrl+C into `stop`. Installed once per process.
pub fn install_interrupt_handler(stop: Arc<AtomicBool>) {
    static CTRL_HANDLER: Once = Once::new();
    CTRL_HANDLER.call_once(move || {
        if let Err(err) = ctrlc::set_handler(move || {
            info!("Interrupt received, shutting down");
            stop.store(true, Ordering::SeqCst);
        }) {
            warn!("Failed to install Ctrl+C handler: {err}");
        }
    });
}

/// Start the agent, run until interrupted, and shut down cleanly.
pub fn run<O: CameraOpener, A: ActuatorClient>(
    config: AgentConfig,
    parts: Collaborators<O, A>,
) -> Result<ShutdownReport> {
    let stop = Arc::new(AtomicBool::new(false));
    install_interrupt_handler(stop.clone());
    let agent = Agent::start(config, parts, stop)?;
    Ok(agent.run())
}
