pub mod agent;

pub use agent::{AgentCliArgs, AgentConfig};
