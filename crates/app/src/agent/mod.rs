//! The fire detection agent.
//!
//! One capture thread ([`pipeline::Agent`]) feeds two bounded dispatchers:
//! [`actuation`] posts detection commands to the actuator and [`stream`]
//! publishes annotated frames over the [`channel`]. Remote `start`/`stop`
//! commands land in [`control::ControlState`].

pub mod actuation;
pub mod annotation;
pub mod channel;
pub mod config;
pub mod control;
pub mod data;
pub mod encoding;
pub mod faults;
pub mod gate;
pub mod pipeline;
#[cfg(feature = "socketio")]
pub mod socketio;
pub mod stream;
pub mod telemetry;
pub mod worker;

pub use actuation::{ActuationDispatcher, ActuationHandle, ActuatorClient, HttpActuator};
pub use channel::{ChannelError, ChannelTransport, HandlerRegistry, RemoteControlChannel};
pub use config::{AgentCliArgs, AgentConfig};
pub use control::{ControlAction, ControlState};
pub use faults::{FaultCounters, FaultKind};
pub use pipeline::{Agent, AgentState, Collaborators, ShutdownReport, run};
#[cfg(feature = "socketio")]
pub use socketio::SocketIoTransport;
