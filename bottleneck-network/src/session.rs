use crate::backend::NodeHandle;
use crate::network::topology::Topology;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("interactive session I/O failed")]
    Io(#[from] std::io::Error),
    #[error("interactive session failed: {0}")]
    Other(String),
}

/// What an interactive session gets to see of a started network
pub struct RunningNetwork<'a> {
    pub topology: &'a Topology,
    pub(crate) handles: &'a HashMap<Arc<str>, NodeHandle>,
}

impl RunningNetwork<'_> {
    pub fn handle(&self, node_id: &str) -> Option<NodeHandle> {
        self.handles.get(node_id).copied()
    }
}

/// Hands control to an operator while the network is up
pub trait InteractiveSession {
    /// Blocks until the operator ends the session
    fn enter_interactive(&mut self, network: &RunningNetwork<'_>) -> Result<(), SessionError>;
}

/// A session that ends as soon as it starts, for unattended runs
pub struct NoSession;

impl InteractiveSession for NoSession {
    fn enter_interactive(&mut self, _network: &RunningNetwork<'_>) -> Result<(), SessionError> {
        Ok(())
    }
}
