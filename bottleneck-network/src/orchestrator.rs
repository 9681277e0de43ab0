//! Drives an emulation backend through the lifetime of one network run
//!
//! The orchestrator owns every resource the backend creates on its behalf and is the only place
//! where those resources are released. A run always goes `Built -> Started -> (SessionActive) ->
//! Stopped`; once stopped, a new orchestrator is needed for another run.

use crate::backend::{BackendError, EmulationBackend, LinkHandle, NodeHandle, Resource};
use crate::network::node::NodeRole;
use crate::network::router::{ForwardingRouter, ForwardingState};
use crate::network::topology::Topology;
use crate::session::{InteractiveSession, RunningNetwork, SessionError};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum OrchestratorState {
    Built,
    Started,
    SessionActive,
    Stopped,
}

impl Display for OrchestratorState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OrchestratorState::Built => "built",
            OrchestratorState::Started => "started",
            OrchestratorState::SessionActive => "session active",
            OrchestratorState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error(
        "failed to start the network ({} error(s) while rolling back)",
        .rollback_errors.len()
    )]
    StartFailed {
        #[source]
        error: BackendError,
        rollback_errors: Vec<BackendError>,
    },
    #[error("failed to tear down the network ({} error(s))", .errors.len())]
    TeardownFailed {
        errors: Vec<BackendError>,
        warnings: Vec<BackendError>,
    },
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("cannot {operation} a network that is {state}")]
    InvalidTransition {
        state: OrchestratorState,
        operation: &'static str,
    },
}

/// Problems that did not prevent a clean teardown
#[derive(Debug, Default)]
pub struct StopReport {
    pub warnings: Vec<BackendError>,
}

#[derive(Default)]
struct Teardown {
    errors: Vec<BackendError>,
    warnings: Vec<BackendError>,
}

pub struct Orchestrator<B: EmulationBackend> {
    topology: Topology,
    backend: B,
    state: OrchestratorState,
    /// Nodes in creation order
    nodes: Vec<(Arc<str>, NodeHandle)>,
    handles: HashMap<Arc<str>, NodeHandle>,
    /// Links in creation order
    links: Vec<LinkHandle>,
    routers: Vec<ForwardingRouter>,
}

impl<B: EmulationBackend> Orchestrator<B> {
    pub fn new(topology: Topology, backend: B) -> Self {
        Self {
            topology,
            backend,
            state: OrchestratorState::Built,
            nodes: Vec::new(),
            handles: HashMap::new(),
            links: Vec::new(),
            routers: Vec::new(),
        }
    }

    pub fn state(&self) -> OrchestratorState {
        self.state
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn router_state(&self, router_id: &str) -> Option<ForwardingState> {
        self.routers
            .iter()
            .find(|r| &**r.id() == router_id)
            .map(|r| r.state())
    }

    /// Creates every node and link of the topology and enables forwarding on the routers
    ///
    /// If the backend fails along the way, everything created so far is torn down again before
    /// returning, and the orchestrator ends up stopped.
    pub fn start(&mut self) -> Result<(), OrchestratorError> {
        if self.state != OrchestratorState::Built {
            return Err(OrchestratorError::InvalidTransition {
                state: self.state,
                operation: "start",
            });
        }

        info!(
            nodes = self.topology.nodes().count(),
            links = self.topology.links().len(),
            "starting network"
        );

        match self.bring_up() {
            Ok(()) => {
                self.state = OrchestratorState::Started;
                info!("network started");
                Ok(())
            }
            Err(error) => {
                warn!(%error, "network failed to start, rolling back");
                let teardown = self.tear_down();
                self.state = OrchestratorState::Stopped;
                Err(OrchestratorError::StartFailed {
                    error,
                    rollback_errors: teardown.errors,
                })
            }
        }
    }

    fn bring_up(&mut self) -> Result<(), BackendError> {
        let Self {
            topology,
            backend,
            nodes,
            handles,
            links,
            routers,
            ..
        } = self;

        for node in topology.nodes() {
            let handle = match node.role() {
                NodeRole::Switch => backend.create_switch(node)?,
                NodeRole::Host | NodeRole::Router => backend.create_namespace_node(node)?,
            };
            debug!(node = &**node.id(), role = %node.role(), ?handle, "node created");

            nodes.push((node.id().clone(), handle));
            handles.insert(node.id().clone(), handle);
            if node.role() == NodeRole::Router {
                routers.push(ForwardingRouter::new(node.id().clone(), handle));
            }
        }

        for link in topology.links() {
            let node_a = handles[&link.a.node];
            let node_b = handles[&link.b.node];
            let handle = backend.create_virtual_link(node_a, &link.a, node_b, &link.b)?;
            links.push(handle);
            debug!(a = %link.a, b = %link.b, ?handle, "link created");

            backend.apply_shaping(handle, &link.shaping)?;
            if !link.shaping.is_unshaped() {
                debug!(?handle, shaping = %link.shaping, "link shaped");
            }
        }

        for node in topology.nodes() {
            if let Some(gateway) = node.default_route() {
                backend.set_default_route(handles[node.id()], gateway)?;
            }
        }

        for router in routers.iter_mut() {
            router.on_config(backend)?;
        }

        backend.network_ready()
    }

    /// Hands control to `session` until the operator ends it
    pub fn run_session<S: InteractiveSession + ?Sized>(
        &mut self,
        session: &mut S,
    ) -> Result<(), OrchestratorError> {
        if self.state != OrchestratorState::Started {
            return Err(OrchestratorError::InvalidTransition {
                state: self.state,
                operation: "run a session on",
            });
        }

        self.state = OrchestratorState::SessionActive;
        let network = RunningNetwork {
            topology: &self.topology,
            handles: &self.handles,
        };
        session.enter_interactive(&network)?;
        debug!("interactive session ended");
        Ok(())
    }

    /// Releases every resource of the run
    ///
    /// All teardown steps are attempted, even if some of them fail. Calling this again after the
    /// network was stopped has no effect.
    pub fn stop(&mut self) -> Result<StopReport, OrchestratorError> {
        match self.state {
            OrchestratorState::Stopped => {
                debug!("network already stopped");
                return Ok(StopReport::default());
            }
            OrchestratorState::Built => {
                self.state = OrchestratorState::Stopped;
                return Ok(StopReport::default());
            }
            OrchestratorState::Started | OrchestratorState::SessionActive => {}
        }

        info!("stopping network");
        let teardown = self.tear_down();
        self.state = OrchestratorState::Stopped;

        if teardown.errors.is_empty() {
            info!(warnings = teardown.warnings.len(), "network stopped");
            Ok(StopReport {
                warnings: teardown.warnings,
            })
        } else {
            Err(OrchestratorError::TeardownFailed {
                errors: teardown.errors,
                warnings: teardown.warnings,
            })
        }
    }

    /// Routers first, then links, then nodes, each in reverse creation order
    fn tear_down(&mut self) -> Teardown {
        let mut teardown = Teardown::default();

        for router in self.routers.iter_mut().rev() {
            if let Some(warning) = router.on_terminate(&mut self.backend) {
                teardown.warnings.push(warning);
            }
        }

        for link in self.links.drain(..).rev() {
            if let Err(e) = self.backend.destroy(Resource::Link(link)) {
                warn!(error = %e, ?link, "failed to destroy link");
                teardown.errors.push(e);
            }
        }

        for (id, node) in self.nodes.drain(..).rev() {
            if let Err(e) = self.backend.destroy(Resource::Node(node)) {
                warn!(error = %e, node = &*id, "failed to destroy node");
                teardown.errors.push(e);
            }
        }
        self.handles.clear();

        teardown
    }
}

impl<B: EmulationBackend> Drop for Orchestrator<B> {
    fn drop(&mut self) {
        if matches!(
            self.state,
            OrchestratorState::Started | OrchestratorState::SessionActive
        ) {
            warn!(
                nodes = self.nodes.len(),
                links = self.links.len(),
                "network dropped without being stopped, its resources were not released"
            );
        }
    }
}

/// Starts the network, runs the interactive session and stops the network again
///
/// Once the network started, it is always stopped, even if the session fails. A teardown failure
/// takes precedence over a session failure in the returned error.
pub fn run<B: EmulationBackend, S: InteractiveSession + ?Sized>(
    topology: Topology,
    backend: B,
    session: &mut S,
) -> Result<StopReport, OrchestratorError> {
    let mut orchestrator = Orchestrator::new(topology, backend);
    orchestrator.start()?;

    let session_result = orchestrator.run_session(session);
    let stop_result = orchestrator.stop();

    match (session_result, stop_result) {
        (Ok(()), stop_result) => stop_result,
        (Err(session_error), Ok(_)) => Err(session_error),
        (Err(session_error), Err(teardown_error)) => {
            warn!(error = %session_error, "interactive session failed");
            Err(teardown_error)
        }
    }
}
