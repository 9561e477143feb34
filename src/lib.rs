//! Remote training agent.
//!
//! Connects outward to a control server, runs the training jobs it dispatches
//! one at a time, streams their output back and uploads the model artifact
//! each successful run leaves behind.

pub mod agent;
pub mod artifact;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod endpoints;
pub mod error;
pub mod job;
pub mod protocol;
pub mod session;
pub mod snapshot;
pub mod system_info;
pub mod upload;

pub use agent::Agent;
pub use config::AgentSettings;
