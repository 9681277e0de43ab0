use crate::backend::{BackendError, BackendOperation, EmulationBackend, NodeHandle};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ForwardingState {
    Unconfigured,
    ForwardingEnabled,
    Terminated,
}

/// Keeps IP forwarding enabled on a router for exactly as long as the router is in use
///
/// Forwarding is switched on once the router's links exist, and switched off again before any of
/// the router's resources are reclaimed, so no forwarding state outlives the run.
#[derive(Debug)]
pub struct ForwardingRouter {
    id: Arc<str>,
    node: Option<NodeHandle>,
    state: ForwardingState,
}

impl ForwardingRouter {
    pub fn new(id: Arc<str>, node: NodeHandle) -> Self {
        Self {
            id,
            node: Some(node),
            state: ForwardingState::Unconfigured,
        }
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn state(&self) -> ForwardingState {
        self.state
    }

    /// Enables forwarding; a failure leaves the router unconfigured and must abort the start-up
    pub fn on_config<B: EmulationBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Result<(), BackendError> {
        match (self.state, self.node) {
            (ForwardingState::ForwardingEnabled, _) => Ok(()),
            (ForwardingState::Unconfigured, Some(node)) => {
                backend.set_forwarding(node, true)?;
                self.state = ForwardingState::ForwardingEnabled;
                info!(router = &*self.id, "ip forwarding enabled");
                Ok(())
            }
            (ForwardingState::Terminated, _) | (_, None) => Err(BackendError::new(
                BackendOperation::SetForwarding,
                format!("router `{}` was already terminated", self.id),
            )),
        }
    }

    /// Clears forwarding and releases the router's node
    ///
    /// Always runs to completion: a failure to clear the flag is logged and handed back as a
    /// warning, so it never blocks the teardown of the remaining resources.
    pub fn on_terminate<B: EmulationBackend + ?Sized>(
        &mut self,
        backend: &mut B,
    ) -> Option<BackendError> {
        if self.state == ForwardingState::Terminated {
            return None;
        }

        let warning = match self.node.take() {
            Some(node) => match backend.set_forwarding(node, false) {
                Ok(()) => {
                    debug!(router = &*self.id, "ip forwarding disabled");
                    None
                }
                Err(e) => {
                    warn!(router = &*self.id, error = %e, "failed to disable ip forwarding");
                    Some(e)
                }
            },
            None => None,
        };

        self.state = ForwardingState::Terminated;
        warning
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::backend::recording::{BackendCall, RecordingBackend};
    use crate::backend::{EmulationBackend, Resource};
    use crate::network::node::NodeDescriptor;

    fn router_on(backend: &mut RecordingBackend) -> ForwardingRouter {
        let descriptor = NodeDescriptor::router(
            "r1",
            vec!["10.0.0.1/24".parse().unwrap(), "10.1.0.1/24".parse().unwrap()],
        )
        .unwrap();
        let node = backend.create_namespace_node(&descriptor).unwrap();
        ForwardingRouter::new(descriptor.id().clone(), node)
    }

    fn forwarding_calls(backend: &RecordingBackend) -> Vec<bool> {
        backend
            .log()
            .snapshot()
            .into_iter()
            .filter_map(|c| match c {
                BackendCall::SetForwarding { enabled, .. } => Some(enabled),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_lifecycle() {
        let mut backend = RecordingBackend::new();
        let mut router = router_on(&mut backend);
        assert_eq!(router.state(), ForwardingState::Unconfigured);

        router.on_config(&mut backend).unwrap();
        assert_eq!(router.state(), ForwardingState::ForwardingEnabled);

        // Idempotent
        router.on_config(&mut backend).unwrap();
        assert_eq!(forwarding_calls(&backend), [true]);

        assert!(router.on_terminate(&mut backend).is_none());
        assert_eq!(router.state(), ForwardingState::Terminated);
        assert_eq!(forwarding_calls(&backend), [true, false]);

        // Terminating again does nothing, and a terminated router cannot be revived
        assert!(router.on_terminate(&mut backend).is_none());
        assert!(router.on_config(&mut backend).is_err());
        assert_eq!(forwarding_calls(&backend), [true, false]);

        // The node itself is still there, it is reclaimed separately
        assert_eq!(backend.resident_resources(), [Resource::Node(NodeHandle(0))]);
    }

    #[test]
    fn test_failed_config_still_clears_on_terminate() {
        let mut backend = RecordingBackend::new().fail_on(BackendOperation::SetForwarding, 1);
        let mut router = router_on(&mut backend);

        assert!(router.on_config(&mut backend).is_err());
        assert_eq!(router.state(), ForwardingState::Unconfigured);

        assert!(router.on_terminate(&mut backend).is_none());
        assert_eq!(router.state(), ForwardingState::Terminated);
        assert_eq!(forwarding_calls(&backend), [false]);
    }

    #[test]
    fn test_failed_terminate_is_a_warning() {
        let mut backend = RecordingBackend::new().fail_on(BackendOperation::SetForwarding, 2);
        let mut router = router_on(&mut backend);

        router.on_config(&mut backend).unwrap();
        let warning = router.on_terminate(&mut backend).unwrap();
        assert_eq!(warning.operation, BackendOperation::SetForwarding);
        assert_eq!(router.state(), ForwardingState::Terminated);
    }
}
