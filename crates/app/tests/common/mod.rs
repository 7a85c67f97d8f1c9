//! In-process doubles for driving the agent without hardware or network.
//!
//! Every double appends to one shared [`CallLog`] so tests can assert on the
//! relative order of camera, actuator and channel calls.

#![allow(dead_code)]

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
    thread,
    time::{Duration, Instant},
};

use fire_agent::agent::{
    ChannelError, ChannelTransport, HandlerRegistry,
    actuation::{ActuatorClient, TransportError},
    channel::InboundKind,
    config::AgentConfig,
    data::ActuationCommand,
};
use ml_core::{BoundingBox, Classifier, ClassifierError, Detection, DetectionSet};
use serde_json::Value;
use video_ingest::{
    Backend, CameraDevice, CameraOpener, CameraProperty, CaptureError, Frame, FrameFormat,
    RawImage, ReinitPolicy,
};

pub const WIDTH: i32 = 160;
pub const HEIGHT: i32 = 120;

#[derive(Clone, Debug, PartialEq)]
pub enum Call {
    CameraOpened(i32),
    CameraRead,
    CameraReleased,
    Actuated { area: u64, confidence: f32 },
    /// The actuation worker let go of its client, i.e. the worker exited.
    ActuatorDropped,
    Emitted { event: String, payload: Value },
    TransportClosed,
}

#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<Call>>>);

impl CallLog {
    pub fn push(&self, call: Call) {
        self.lock().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().clone()
    }

    pub fn actuated(&self) -> Vec<u64> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                Call::Actuated { area, .. } => Some(*area),
                _ => None,
            })
            .collect()
    }

    pub fn emitted(&self, event: &str) -> Vec<Value> {
        self.lock()
            .iter()
            .filter_map(|call| match call {
                Call::Emitted { event: e, payload } if e == event => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, wanted: &Call) -> usize {
        self.lock().iter().filter(|call| *call == wanted).count()
    }

    /// Index of the first call matching `predicate`.
    pub fn position(&self, predicate: impl Fn(&Call) -> bool) -> Option<usize> {
        self.lock().iter().position(predicate)
    }

    /// Index of the last call matching `predicate`.
    pub fn last_position(&self, predicate: impl Fn(&Call) -> bool) -> Option<usize> {
        self.lock().iter().rposition(predicate)
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Call>> {
        self.0.lock().expect("call log lock")
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

type ReadHook = Box<dyn FnOnce() + Send>;

/// Camera at index 0 whose reads follow a shared script (`true` = good frame).
/// Once the script runs out every read succeeds.
pub struct FakeOpener {
    available: bool,
    reads: Arc<Mutex<VecDeque<bool>>>,
    hook: Arc<Mutex<Option<(usize, ReadHook)>>>,
    log: CallLog,
}

impl FakeOpener {
    pub fn new(log: &CallLog) -> Self {
        Self {
            available: true,
            reads: Arc::default(),
            hook: Arc::default(),
            log: log.clone(),
        }
    }

    /// No device ever opens.
    pub fn missing(log: &CallLog) -> Self {
        Self {
            available: false,
            ..Self::new(log)
        }
    }

    pub fn with_reads(self, reads: impl IntoIterator<Item = bool>) -> Self {
        self.reads.lock().expect("script lock").extend(reads);
        self
    }

    /// Run `hook` inside the `nth` read (1-based, counting the startup read),
    /// before that read returns.
    pub fn on_read(self, nth: usize, hook: impl FnOnce() + Send + 'static) -> Self {
        *self.hook.lock().expect("hook lock") = Some((nth, Box::new(hook)));
        self
    }
}

impl CameraOpener for FakeOpener {
    type Device = FakeCamera;

    fn open(&mut self, index: i32, backend: Backend) -> Result<FakeCamera, CaptureError> {
        if !self.available || index != 0 {
            return Err(CaptureError::Open { index, backend });
        }
        self.log.push(Call::CameraOpened(index));
        Ok(FakeCamera {
            reads: self.reads.clone(),
            hook: self.hook.clone(),
            log: self.log.clone(),
        })
    }

    fn backends(&self) -> Vec<Backend> {
        vec![Backend::Any]
    }
}

pub struct FakeCamera {
    reads: Arc<Mutex<VecDeque<bool>>>,
    hook: Arc<Mutex<Option<(usize, ReadHook)>>>,
    log: CallLog,
}

impl CameraDevice for FakeCamera {
    fn read(&mut self) -> Result<RawImage, CaptureError> {
        self.log.push(Call::CameraRead);
        let reads = self.log.count(&Call::CameraRead);
        let due = {
            let mut hook = self.hook.lock().expect("hook lock");
            match hook.take() {
                Some((nth, run)) if nth == reads => Some(run),
                pending => {
                    *hook = pending;
                    None
                }
            }
        };
        if let Some(run) = due {
            run();
        }
        let ok = self.reads.lock().expect("script lock").pop_front().unwrap_or(true);
        if !ok {
            return Err(CaptureError::EmptyFrame);
        }
        Ok(RawImage {
            data: vec![40; (WIDTH * HEIGHT * 3) as usize],
            width: WIDTH,
            height: HEIGHT,
            format: FrameFormat::Bgr8,
        })
    }

    fn set(&mut self, _property: CameraProperty, _value: f64) -> Result<bool, CaptureError> {
        Ok(true)
    }

    fn get(&self, property: CameraProperty) -> Result<f64, CaptureError> {
        Ok(match property {
            CameraProperty::FrameWidth => f64::from(WIDTH),
            CameraProperty::FrameHeight => f64::from(HEIGHT),
            CameraProperty::Fps => 30.0,
            _ => 0.0,
        })
    }

    fn release(&mut self) {
        self.log.push(Call::CameraReleased);
    }
}

/// Actuator that records every command it accepts.
pub struct RecordingActuator {
    log: CallLog,
}

impl RecordingActuator {
    pub fn new(log: &CallLog) -> Self {
        Self { log: log.clone() }
    }
}

impl ActuatorClient for RecordingActuator {
    fn send(&mut self, command: &ActuationCommand) -> Result<(), TransportError> {
        self.log.push(Call::Actuated {
            area: command.area,
            confidence: command.confidence,
        });
        Ok(())
    }
}

impl Drop for RecordingActuator {
    fn drop(&mut self) {
        self.log.push(Call::ActuatorDropped);
    }
}

/// Control channel transport that keeps the registered handlers so tests can
/// play the server's part.
pub struct RecordingTransport {
    refuse: bool,
    handlers: Mutex<Option<HandlerRegistry>>,
    log: CallLog,
}

impl RecordingTransport {
    pub fn new(log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            refuse: false,
            handlers: Mutex::new(None),
            log: log.clone(),
        })
    }

    pub fn unreachable(log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            refuse: true,
            handlers: Mutex::new(None),
            log: log.clone(),
        })
    }

    pub fn as_transport(self: &Arc<Self>) -> Option<Arc<dyn ChannelTransport>> {
        let transport: Arc<dyn ChannelTransport> = self.clone();
        Some(transport)
    }

    /// Deliver an inbound event as the server would.
    pub fn deliver(&self, kind: InboundKind, payload: Value) {
        let registry = self
            .handlers
            .lock()
            .expect("handler lock")
            .clone()
            .expect("transport connected");
        assert!(registry.dispatch(kind, payload), "no handler for {kind:?}");
    }
}

impl ChannelTransport for RecordingTransport {
    fn connect(&self, handlers: HandlerRegistry) -> Result<(), ChannelError> {
        if self.refuse {
            return Err(ChannelError::Connect {
                url: self.describe(),
                reason: "connection refused".into(),
            });
        }
        *self.handlers.lock().expect("handler lock") = Some(handlers);
        Ok(())
    }

    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
        self.log.push(Call::Emitted {
            event: event.to_string(),
            payload,
        });
        Ok(())
    }

    fn disconnect(&self) -> Result<(), ChannelError> {
        self.log.push(Call::TransportClosed);
        Ok(())
    }

    fn describe(&self) -> String {
        "test://dashboard".to_string()
    }
}

pub fn fire(w: i32, h: i32, confidence: f32) -> Detection {
    Detection::new(BoundingBox::new(10, 10, 10 + w, 10 + h), confidence, "fire")
}

/// Classifier returning the same detections for every frame.
pub fn fixed_classifier(detections: DetectionSet) -> Box<dyn Classifier> {
    Box::new(
        move |_frame: &Frame, _threshold: f32| -> Result<DetectionSet, ClassifierError> {
            Ok(detections.clone())
        },
    )
}

/// Fast timings, capture enabled, no startup probe.
pub fn test_config() -> AgentConfig {
    let mut config = AgentConfig::default();
    config.camera.max_index = 1;
    config.reinit = ReinitPolicy {
        failure_threshold: 3,
        delay: Duration::ZERO,
    };
    config.inference.skip_factor = 1;
    config.actuation.dequeue_timeout = Duration::from_millis(10);
    config.stream.dequeue_timeout = Duration::from_millis(10);
    config.actuation_interval = Duration::ZERO;
    config.frame_interval = Duration::ZERO;
    config.idle_interval = Duration::from_millis(5);
    config.drain_timeout = Duration::from_secs(2);
    config.join_timeout = Duration::from_secs(2);
    config.start_enabled = true;
    config.probe_actuator = false;
    config
}
