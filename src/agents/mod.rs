//! Agent subprocess lifecycle.

pub mod supervisor;

pub use supervisor::{AgentPool, AgentProcess, AgentProcessConfig, OutputCallback};
