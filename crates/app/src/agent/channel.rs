//! Remote control channel.
//!
//! The transport is a black box that owns its own delivery thread and calls
//! back into the handlers registered here. Handlers only touch
//! [`ControlState`] through its lock and hand blocking actuation work to the
//! [`ActuationHandle`].

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use ml_core::DominantDetection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::agent::{
    actuation::ActuationHandle,
    control::{ControlAction, ControlState},
    data::{CameraStatus, CameraStatusEvent, FireDetectionEvent, StreamPayload, VideoFrameEvent},
    faults::{FaultCounters, FaultKind},
    stream::FramePublisher,
    worker::ErrorTracker,
};

pub const CAMERA_STATUS: &str = "camera-status";
pub const FIRE_DETECTION: &str = "fire-detection";
pub const VIDEO_FRAME: &str = "video-frame";
pub const CAMERA_CONTROL: &str = "camera-control";
pub const GET_CAMERA_STATUS: &str = "get-camera-status";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("failed to connect to {url}: {reason}")]
    Connect { url: String, reason: String },
    #[error("emit failed: {0}")]
    Emit(String),
    #[error("control channel is not connected")]
    NotConnected,
    #[error("invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Event-typed, bidirectional connection to the dashboard server.
pub trait ChannelTransport: Send + Sync {
    /// Open the connection and route inbound events to `handlers`.
    fn connect(&self, handlers: HandlerRegistry) -> Result<(), ChannelError>;

    fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError>;

    fn disconnect(&self) -> Result<(), ChannelError>;

    fn describe(&self) -> String;
}

/// Inbound event kinds a handler can be registered for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InboundKind {
    CameraControl,
    StatusQuery,
    /// The transport (re)established its connection.
    Connected,
    /// The transport lost its connection.
    Disconnected,
}

impl InboundKind {
    pub const ALL: [InboundKind; 4] = [
        InboundKind::CameraControl,
        InboundKind::StatusQuery,
        InboundKind::Connected,
        InboundKind::Disconnected,
    ];

    /// Wire name for application events; `None` for transport lifecycle.
    pub fn event_name(self) -> Option<&'static str> {
        match self {
            InboundKind::CameraControl => Some(CAMERA_CONTROL),
            InboundKind::StatusQuery => Some(GET_CAMERA_STATUS),
            InboundKind::Connected | InboundKind::Disconnected => None,
        }
    }
}

pub type Handler = Arc<dyn Fn(Value) + Send + Sync>;

/// One handler per inbound event kind.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<InboundKind, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`, replacing any previous one.
    pub fn on<F>(mut self, kind: InboundKind, handler: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn handler(&self, kind: InboundKind) -> Option<Handler> {
        self.handlers.get(&kind).cloned()
    }

    /// Invoke the handler for `kind`; false if none is registered.
    pub fn dispatch(&self, kind: InboundKind, payload: Value) -> bool {
        match self.handlers.get(&kind) {
            Some(handler) => {
                handler(payload);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Deserialize)]
struct ControlMessage {
    action: ControlAction,
}

/// Accepts `{"action": "start"}` or a bare `"start"`.
pub fn parse_control(payload: Value) -> Result<ControlAction, ChannelError> {
    match payload {
        Value::String(_) => Ok(serde_json::from_value(payload)?),
        other => Ok(serde_json::from_value::<ControlMessage>(other)?.action),
    }
}

pub struct RemoteControlChannel {
    transport: Option<Arc<dyn ChannelTransport>>,
    state: Mutex<ChannelState>,
    control: Arc<ControlState>,
    actuation: ActuationHandle,
    faults: Arc<FaultCounters>,
    ever_connected: AtomicBool,
    closing: AtomicBool,
    emit_errors: Mutex<ErrorTracker>,
}

impl RemoteControlChannel {
    /// `transport: None` runs standalone: every emit is skipped.
    pub fn new(
        transport: Option<Arc<dyn ChannelTransport>>,
        control: Arc<ControlState>,
        actuation: ActuationHandle,
        faults: Arc<FaultCounters>,
        error_log_threshold: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            state: Mutex::new(ChannelState::Disconnected),
            control,
            actuation,
            faults,
            ever_connected: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            emit_errors: Mutex::new(ErrorTracker::new("Channel emit", error_log_threshold)),
        })
    }

    /// Connect and announce the current state. Failure leaves the channel
    /// disconnected and the agent standalone.
    pub fn connect(self: &Arc<Self>) -> ChannelState {
        let Some(transport) = self.transport.clone() else {
            info!("No control channel configured; running standalone");
            return ChannelState::Disconnected;
        };
        self.set_state(ChannelState::Connecting);
        info!("Connecting control channel to {}", transport.describe());

        match transport.connect(self.registry()) {
            Ok(()) => {
                self.set_state(ChannelState::Connected);
                self.ever_connected.store(true, Ordering::SeqCst);
                info!("Control channel connected");
                self.emit_status(CameraStatus::Connected);
                ChannelState::Connected
            }
            Err(err) => {
                self.set_state(ChannelState::Disconnected);
                self.faults.record(FaultKind::ChannelConnect);
                warn!("{err}; continuing standalone");
                ChannelState::Disconnected
            }
        }
    }

    fn registry(self: &Arc<Self>) -> HandlerRegistry {
        let weak = Arc::downgrade(self);
        let route = move |f: fn(&RemoteControlChannel, Value)| {
            let weak: Weak<Self> = weak.clone();
            move |payload: Value| {
                if let Some(channel) = weak.upgrade() {
                    f(&channel, payload);
                }
            }
        };
        HandlerRegistry::new()
            .on(InboundKind::CameraControl, route(Self::handle_control))
            .on(InboundKind::StatusQuery, route(|channel, _| channel.handle_status_query()))
            .on(InboundKind::Connected, route(|channel, _| channel.on_transport_connected()))
            .on(
                InboundKind::Disconnected,
                route(|channel, _| channel.on_transport_disconnected()),
            )
    }

    /// `camera-control` handler.
    pub fn handle_control(&self, payload: Value) {
        match parse_control(payload) {
            Ok(action) => self.apply_control(action),
            Err(err) => warn!("Ignoring {CAMERA_CONTROL} event: {err}"),
        }
    }

    /// Set the flag, acknowledge, and on `stop` queue an immediate zero.
    pub fn apply_control(&self, action: ControlAction) {
        let enabled = self.control.apply(action);
        info!(
            "Capture {} by remote command",
            if enabled { "enabled" } else { "disabled" }
        );
        self.send(
            CAMERA_STATUS,
            &CameraStatusEvent {
                status: CameraStatus::for_enabled(enabled),
                enabled,
            },
        );
        if action == ControlAction::Stop {
            let outcome = self.actuation.submit_zero();
            debug!("Zero command after stop: {outcome:?}");
        }
    }

    /// `get-camera-status` handler. Never mutates state.
    pub fn handle_status_query(&self) {
        let enabled = self.control.snapshot();
        self.send(
            CAMERA_STATUS,
            &CameraStatusEvent {
                status: CameraStatus::for_enabled(enabled),
                enabled,
            },
        );
    }

    fn on_transport_connected(&self) {
        if self.closing.load(Ordering::SeqCst) || !self.ever_connected.load(Ordering::SeqCst) {
            return;
        }
        let previous = self.replace_state(ChannelState::Connected);
        if previous == ChannelState::Disconnected {
            info!("Control channel reconnected");
            self.emit_status(CameraStatus::Connected);
        }
    }

    fn on_transport_disconnected(&self) {
        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        let previous = self.replace_state(ChannelState::Disconnected);
        if previous == ChannelState::Connected {
            self.faults.record(FaultKind::ChannelConnect);
            warn!("Control channel lost its connection");
        }
    }

    pub fn emit_status(&self, status: CameraStatus) -> bool {
        let enabled = self.control.snapshot();
        self.send(CAMERA_STATUS, &CameraStatusEvent { status, enabled })
    }

    pub fn emit_detection(&self, dominant: &DominantDetection) -> bool {
        self.send(FIRE_DETECTION, &FireDetectionEvent::from(dominant))
    }

    /// Final `disconnected` status, then close the transport.
    pub fn disconnect(&self) {
        let Some(transport) = self.transport.as_ref() else {
            return;
        };
        self.closing.store(true, Ordering::SeqCst);
        if self.state() != ChannelState::Connected {
            self.set_state(ChannelState::Disconnected);
            return;
        }
        self.emit_status(CameraStatus::Disconnected);
        self.set_state(ChannelState::Disconnected);
        match transport.disconnect() {
            Ok(()) => info!("Control channel closed"),
            Err(err) => debug!("Control channel close failed: {err}"),
        }
    }

    pub fn state(&self) -> ChannelState {
        *self.lock_state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Emit if connected. Failures are counted and rate-limited in the log.
    fn send<T: Serialize>(&self, event: &str, payload: &T) -> bool {
        match self.try_send(event, payload) {
            Ok(sent) => sent,
            Err(err) => {
                self.faults.record(FaultKind::Transport);
                self.lock_errors().record_failure(&format!("{event}: {err}"));
                false
            }
        }
    }

    fn try_send<T: Serialize>(&self, event: &str, payload: &T) -> Result<bool, ChannelError> {
        let Some(transport) = self.transport.as_ref() else {
            return Ok(false);
        };
        if !self.is_connected() {
            return Ok(false);
        }
        let value = serde_json::to_value(payload)?;
        transport.emit(event, value)?;
        self.lock_errors().record_success();
        Ok(true)
    }

    fn set_state(&self, state: ChannelState) {
        *self.lock_state() = state;
    }

    fn replace_state(&self, state: ChannelState) -> ChannelState {
        std::mem::replace(&mut *self.lock_state(), state)
    }

    fn lock_state(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_errors(&self) -> MutexGuard<'_, ErrorTracker> {
        self.emit_errors.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl FramePublisher for RemoteControlChannel {
    fn is_connected(&self) -> bool {
        RemoteControlChannel::is_connected(self)
    }

    fn publish_frame(&self, payload: &StreamPayload) -> Result<(), ChannelError> {
        let event = VideoFrameEvent {
            frame: payload.frame.clone(),
        };
        match self.try_send(VIDEO_FRAME, &event)? {
            true => Ok(()),
            false => Err(ChannelError::NotConnected),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::agent::{
        actuation::{ActuationDispatcher, ActuatorClient, TransportError},
        config::ActuationSettings,
        data::ActuationCommand,
    };

    #[derive(Default)]
    struct FakeTransport {
        refuse: bool,
        emitted: Mutex<Vec<(String, Value)>>,
        registry: Mutex<Option<HandlerRegistry>>,
        closed: AtomicBool,
    }

    impl FakeTransport {
        fn fire(&self, kind: InboundKind, payload: Value) {
            let registry = self.registry.lock().expect("lock").clone().expect("connected");
            assert!(registry.dispatch(kind, payload));
        }

        fn statuses(&self) -> Vec<Value> {
            self.emitted
                .lock()
                .expect("lock")
                .iter()
                .filter(|(event, _)| event == CAMERA_STATUS)
                .map(|(_, payload)| payload.clone())
                .collect()
        }
    }

    impl ChannelTransport for FakeTransport {
        fn connect(&self, handlers: HandlerRegistry) -> Result<(), ChannelError> {
            if self.refuse {
                return Err(ChannelError::Connect {
                    url: "http://dashboard.test".into(),
                    reason: "connection refused".into(),
                });
            }
            *self.registry.lock().expect("lock") = Some(handlers);
            Ok(())
        }

        fn emit(&self, event: &str, payload: Value) -> Result<(), ChannelError> {
            self.emitted
                .lock()
                .expect("lock")
                .push((event.to_string(), payload));
            Ok(())
        }

        fn disconnect(&self) -> Result<(), ChannelError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn describe(&self) -> String {
            "fake".into()
        }
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<u64>>>);

    impl ActuatorClient for Recorder {
        fn send(&mut self, command: &ActuationCommand) -> Result<(), TransportError> {
            self.0.lock().expect("lock").push(command.area);
            Ok(())
        }
    }

    struct Fixture {
        transport: Arc<FakeTransport>,
        channel: Arc<RemoteControlChannel>,
        control: Arc<ControlState>,
        dispatcher: ActuationDispatcher,
        sent: Recorder,
    }

    fn fixture(transport: FakeTransport) -> Fixture {
        let transport = Arc::new(transport);
        let control = Arc::new(ControlState::new(false));
        let faults = Arc::new(FaultCounters::new());
        let sent = Recorder::default();
        let settings = ActuationSettings {
            url: "http://actuator.test".into(),
            request_timeout: Duration::from_millis(50),
            queue_capacity: 4,
            error_log_threshold: 3,
            dequeue_timeout: Duration::from_millis(5),
        };
        let dispatcher =
            ActuationDispatcher::spawn(sent.clone(), &settings, control.clone(), faults.clone())
                .expect("spawn");
        let dyn_transport: Arc<dyn ChannelTransport> = transport.clone();
        let channel = RemoteControlChannel::new(
            Some(dyn_transport),
            control.clone(),
            dispatcher.handle(),
            faults,
            3,
        );
        Fixture {
            transport,
            channel,
            control,
            dispatcher,
            sent,
        }
    }

    #[test]
    fn connect_announces_current_state() {
        let f = fixture(FakeTransport::default());
        assert_eq!(f.channel.connect(), ChannelState::Connected);
        assert_eq!(
            f.transport.statuses(),
            vec![json!({"status": "connected", "enabled": false})]
        );
    }

    #[test]
    fn refused_connection_runs_standalone() {
        let f = fixture(FakeTransport {
            refuse: true,
            ..FakeTransport::default()
        });
        assert_eq!(f.channel.connect(), ChannelState::Disconnected);
        assert!(!f.channel.emit_detection(&DominantDetection::None));
        assert!(f.transport.emitted.lock().expect("lock").is_empty());
    }

    #[test]
    fn control_events_toggle_and_acknowledge() {
        let f = fixture(FakeTransport::default());
        f.channel.connect();

        f.transport.fire(InboundKind::CameraControl, json!({"action": "start"}));
        assert!(f.control.snapshot());
        f.transport.fire(InboundKind::CameraControl, json!("stop"));
        assert!(!f.control.snapshot());
        f.transport.fire(InboundKind::CameraControl, json!({"action": "explode"}));
        assert!(!f.control.snapshot());

        assert_eq!(
            f.transport.statuses()[1..].to_vec(),
            vec![
                json!({"status": "active", "enabled": true}),
                json!({"status": "inactive", "enabled": false}),
            ]
        );
    }

    #[test]
    fn stop_submits_exactly_one_zero() {
        let f = fixture(FakeTransport::default());
        f.channel.connect();

        f.transport.fire(InboundKind::CameraControl, json!({"action": "stop"}));
        f.dispatcher
            .shutdown(Duration::from_secs(2), Duration::from_secs(2));

        assert_eq!(*f.sent.0.lock().expect("lock"), vec![0]);
    }

    #[test]
    fn status_query_does_not_mutate() {
        let f = fixture(FakeTransport::default());
        f.channel.connect();
        f.control.apply(ControlAction::Start);

        f.transport.fire(InboundKind::StatusQuery, json!({}));

        assert!(f.control.snapshot());
        assert_eq!(
            f.transport.statuses().last(),
            Some(&json!({"status": "active", "enabled": true}))
        );
    }

    #[test]
    fn reconnect_reemits_status() {
        let f = fixture(FakeTransport::default());
        f.channel.connect();

        f.transport.fire(InboundKind::Disconnected, Value::Null);
        assert_eq!(f.channel.state(), ChannelState::Disconnected);
        f.transport.fire(InboundKind::Connected, Value::Null);
        assert_eq!(f.channel.state(), ChannelState::Connected);

        assert_eq!(f.transport.statuses().len(), 2);
    }

    #[test]
    fn disconnect_sends_final_status_then_closes() {
        let f = fixture(FakeTransport::default());
        f.channel.connect();

        f.channel.disconnect();

        assert_eq!(
            f.transport.statuses().last(),
            Some(&json!({"status": "disconnected", "enabled": false}))
        );
        assert!(f.transport.closed.load(Ordering::SeqCst));
        assert!(!f.channel.is_connected());
        // lifecycle events after close are ignored
        f.transport.fire(InboundKind::Connected, Value::Null);
        assert!(!f.channel.is_connected());
    }

    #[test]
    fn frames_are_refused_while_disconnected() {
        let f = fixture(FakeTransport::default());
        let payload = StreamPayload {
            frame: "abc".into(),
            timestamp_ms: 1,
        };
        assert!(matches!(
            f.channel.publish_frame(&payload),
            Err(ChannelError::NotConnected)
        ));
        f.channel.connect();
        f.channel.publish_frame(&payload).expect("published");
        let emitted = f.transport.emitted.lock().expect("lock");
        assert_eq!(
            emitted.last(),
            Some(&(VIDEO_FRAME.to_string(), json!({"frame": "abc"})))
        );
    }
}
