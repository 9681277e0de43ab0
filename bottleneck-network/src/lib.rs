pub mod backend;
pub mod network;
pub mod orchestrator;
pub mod session;

pub use crate::network::TopologyError;
pub use crate::orchestrator::{Orchestrator, OrchestratorError, StopReport, run};
