//! Actuation dispatcher: one worker thread delivering [`ActuationCommand`]s
//! to the actuator, fed by a bounded queue plus a one-slot priority lane for
//! the "all clear" command.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TrySendError, select};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::{
    config::ActuationSettings,
    control::ControlState,
    data::ActuationCommand,
    faults::{FaultCounters, FaultKind},
    worker::{
        DispatchStats, DispatcherReport, ErrorTracker, SubmitOutcome, Worker, WorkerFlags,
        try_enqueue, wait_for_drain,
    },
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(u16),
    #[error("{0}")]
    Other(String),
}

/// Something that can deliver a command to the actuator.
///
/// Only the actuation worker calls this, so at most one send is in flight.
pub trait ActuatorClient: Send + 'static {
    fn send(&mut self, command: &ActuationCommand) -> Result<(), TransportError>;

    /// Human-readable target for log lines.
    fn describe(&self) -> String {
        "actuator".to_string()
    }
}

impl ActuatorClient for Box<dyn ActuatorClient> {
    fn send(&mut self, command: &ActuationCommand) -> Result<(), TransportError> {
        (**self).send(command)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

/// Form-encoded POST of `fire_area` and `confidence`; only `200` counts as
/// accepted.
pub struct HttpActuator {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpActuator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build actuator HTTP client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl ActuatorClient for HttpActuator {
    fn send(&mut self, command: &ActuationCommand) -> Result<(), TransportError> {
        let form = [
            ("fire_area", command.area.to_string()),
            ("confidence", format!("{:.2}", command.confidence)),
        ];
        let response = self.client.post(&self.url).form(&form).send()?;
        let status = response.status();
        if status == reqwest::StatusCode::OK {
            Ok(())
        } else {
            Err(TransportError::Status(status.as_u16()))
        }
    }

    fn describe(&self) -> String {
        self.url.clone()
    }
}

/// Cloneable submission side of the dispatcher.
#[derive(Clone)]
pub struct ActuationHandle {
    commands: Sender<ActuationCommand>,
    zero: Sender<ActuationCommand>,
    stats: Arc<DispatchStats>,
}

impl ActuationHandle {
    /// Non-blocking; a full queue drops the command.
    pub fn submit(&self, area: u64, confidence: f32) -> SubmitOutcome {
        let outcome = try_enqueue(
            &self.commands,
            ActuationCommand::new(area, confidence),
            "actuation",
            &self.stats,
        );
        if outcome == SubmitOutcome::Dropped {
            debug!("Actuation queue full, dropping area={area}");
        }
        outcome
    }

    /// Queue an "all clear" on the priority slot. Never throttled and never
    /// stuck behind the regular queue; a zero already pending absorbs this one.
    pub fn submit_zero(&self) -> SubmitOutcome {
        match self.zero.try_send(ActuationCommand::zero()) {
            Ok(()) => SubmitOutcome::Queued,
            Err(TrySendError::Full(_)) => SubmitOutcome::Coalesced,
            Err(TrySendError::Disconnected(_)) => SubmitOutcome::Closed,
        }
    }

    /// Commands waiting in either lane.
    pub fn queued(&self) -> usize {
        self.commands.len() + self.zero.len()
    }
}

pub struct ActuationDispatcher {
    handle: ActuationHandle,
    worker: Worker,
}

impl ActuationDispatcher {
    pub fn spawn<C: ActuatorClient>(
        client: C,
        settings: &ActuationSettings,
        control: Arc<ControlState>,
        faults: Arc<FaultCounters>,
    ) -> Result<Self> {
        let (commands_tx, commands_rx) = crossbeam_channel::bounded(settings.queue_capacity.max(1));
        let (zero_tx, zero_rx) = crossbeam_channel::bounded(1);
        let stats = Arc::new(DispatchStats::default());

        let worker_state = ActuationWorker {
            client,
            commands: commands_rx,
            zero: zero_rx,
            stats: stats.clone(),
            control,
            faults,
            errors: ErrorTracker::new("Actuator delivery", settings.error_log_threshold),
            dequeue_timeout: settings.dequeue_timeout,
            first_delivery: true,
        };
        let worker = Worker::spawn("actuation-worker", move |flags| worker_state.run(flags))
            .context("Failed to spawn actuation worker")?;

        Ok(Self {
            handle: ActuationHandle {
                commands: commands_tx,
                zero: zero_tx,
                stats,
            },
            worker,
        })
    }

    pub fn submit(&self, area: u64, confidence: f32) -> SubmitOutcome {
        self.handle.submit(area, confidence)
    }

    pub fn submit_zero(&self) -> SubmitOutcome {
        self.handle.submit_zero()
    }

    pub fn handle(&self) -> ActuationHandle {
        self.handle.clone()
    }

    /// Queued plus in-flight commands.
    pub fn pending(&self) -> usize {
        self.handle.queued() + usize::from(self.worker.is_busy())
    }

    /// Wait for the queues to drain (bounded), then stop and join the worker
    /// (bounded). A pending zero is flushed by the worker before it exits.
    pub fn shutdown(mut self, drain_timeout: Duration, join_timeout: Duration) -> DispatcherReport {
        let drained = wait_for_drain(|| self.pending(), drain_timeout);
        if !drained {
            warn!(
                "Actuation queue not drained within {:?} ({} pending)",
                drain_timeout,
                self.pending()
            );
        }
        let join = self.worker.stop(join_timeout);
        DispatcherReport {
            drained,
            join,
            stats: self.handle.stats.snapshot(),
        }
    }
}

struct ActuationWorker<C> {
    client: C,
    commands: Receiver<ActuationCommand>,
    zero: Receiver<ActuationCommand>,
    stats: Arc<DispatchStats>,
    /// Non-zero commands dequeued while capture is disabled are stale.
    control: Arc<ControlState>,
    faults: Arc<FaultCounters>,
    errors: ErrorTracker,
    dequeue_timeout: Duration,
    first_delivery: bool,
}

impl<C: ActuatorClient> ActuationWorker<C> {
    fn run(mut self, flags: WorkerFlags) {
        let span = tracing::info_span!("actuation.worker", endpoint = %self.client.describe());
        let _guard = span.enter();
        let zero = self.zero.clone();
        let commands = self.commands.clone();

        while flags.is_running() {
            if let Ok(command) = zero.try_recv() {
                let _busy = flags.busy();
                self.deliver_zero(command);
                continue;
            }
            select! {
                recv(zero) -> msg => {
                    if let Ok(command) = msg {
                        let _busy = flags.busy();
                        self.deliver_zero(command);
                    }
                }
                recv(commands) -> msg => match msg {
                    Ok(command) => {
                        let _busy = flags.busy();
                        self.deliver_if_enabled(&command);
                    }
                    Err(_) => break,
                },
                default(self.dequeue_timeout) => {}
            }
        }

        if let Ok(command) = zero.try_recv() {
            self.deliver_zero(command);
        }
        let abandoned = self.commands.try_iter().count() as u64;
        if abandoned > 0 {
            self.stats.record_skipped(abandoned);
            debug!("Discarded {abandoned} undelivered actuation commands on exit");
        }
        debug!("Actuation worker stopped");
    }

    /// Commands still queued behind a zero are stale once the zero is sent.
    fn deliver_zero(&mut self, command: ActuationCommand) {
        let superseded = self.commands.try_iter().count() as u64;
        if superseded > 0 {
            self.stats.record_skipped(superseded);
            debug!("All-clear superseded {superseded} queued actuation commands");
        }
        self.deliver(&command);
    }

    /// A `stop` can land after the capture loop read the flag but before it
    /// queued this command. Delivering it would leave the actuator active
    /// behind the zero.
    fn deliver_if_enabled(&mut self, command: &ActuationCommand) {
        if command.is_zero() || self.control.snapshot() {
            self.deliver(command);
        } else {
            self.stats.record_skipped(1);
            debug!(
                area = command.area,
                "Capture disabled, skipping queued actuation command"
            );
        }
    }

    fn deliver(&mut self, command: &ActuationCommand) {
        let started = Instant::now();
        let result = self.client.send(command);
        metrics::histogram!("agent_actuation_latency_seconds")
            .record(started.elapsed().as_secs_f64());
        let probe = std::mem::replace(&mut self.first_delivery, false);

        match result {
            Ok(()) => {
                self.stats.record_delivered();
                metrics::counter!("agent_actuation_sent_total", "outcome" => "ok").increment(1);
                self.errors.record_success();
                if probe {
                    info!("Actuator reachable at {}", self.client.describe());
                }
                debug!(
                    area = command.area,
                    confidence = command.confidence,
                    queued_for_ms = command.enqueued_at.elapsed().as_millis() as u64,
                    "Actuation command delivered"
                );
            }
            Err(err) => {
                self.stats.record_failed();
                self.faults.record(FaultKind::Transport);
                metrics::counter!("agent_actuation_sent_total", "outcome" => "error").increment(1);
                if probe {
                    warn!(
                        "Actuator unreachable at {} ({err}), continuing",
                        self.client.describe()
                    );
                }
                self.errors.record_failure(&err);
            }
        }
    }
}
