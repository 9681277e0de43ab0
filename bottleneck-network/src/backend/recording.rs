//! A backend that realizes nothing and remembers every call it receives
//!
//! Used for dry runs and as the test double of the orchestrator. Failures can be injected for any
//! operation, so teardown paths can be exercised without touching the kernel.

use crate::backend::{
    BackendError, BackendOperation, EmulationBackend, LinkHandle, NodeHandle, Resource,
};
use crate::network::node::{NodeDescriptor, NodeRole};
use crate::network::shaping::LinkShaping;
use crate::network::topology::Interface;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    CreateNode {
        node: Arc<str>,
        role: NodeRole,
        handle: NodeHandle,
    },
    CreateSwitch {
        node: Arc<str>,
        handle: NodeHandle,
    },
    CreateLink {
        a: Interface,
        b: Interface,
        handle: LinkHandle,
    },
    ApplyShaping {
        link: LinkHandle,
        shaping: LinkShaping,
    },
    SetForwarding {
        node: Arc<str>,
        enabled: bool,
    },
    SetDefaultRoute {
        node: Arc<str>,
        gateway: Ipv4Addr,
    },
    NetworkReady,
    Destroy {
        resource: Resource,
        name: String,
    },
}

impl BackendCall {
    pub fn operation(&self) -> BackendOperation {
        match self {
            BackendCall::CreateNode { .. } => BackendOperation::CreateNode,
            BackendCall::CreateSwitch { .. } => BackendOperation::CreateSwitch,
            BackendCall::CreateLink { .. } => BackendOperation::CreateLink,
            BackendCall::ApplyShaping { .. } => BackendOperation::ApplyShaping,
            BackendCall::SetForwarding { .. } => BackendOperation::SetForwarding,
            BackendCall::SetDefaultRoute { .. } => BackendOperation::SetDefaultRoute,
            BackendCall::NetworkReady => BackendOperation::NetworkReady,
            BackendCall::Destroy { .. } => BackendOperation::Destroy,
        }
    }
}

impl Display for BackendCall {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendCall::CreateNode { node, role, handle } => {
                write!(f, "create {role} {node} -> {}", Resource::Node(*handle))
            }
            BackendCall::CreateSwitch { node, handle } => {
                write!(f, "create switch {node} -> {}", Resource::Node(*handle))
            }
            BackendCall::CreateLink { a, b, handle } => {
                write!(f, "create link {a} <-> {b} -> {}", Resource::Link(*handle))
            }
            BackendCall::ApplyShaping { link, shaping } => {
                write!(f, "shape {}: {shaping}", Resource::Link(*link))
            }
            BackendCall::SetForwarding { node, enabled } => {
                let action = if *enabled { "enable" } else { "disable" };
                write!(f, "{action} forwarding on {node}")
            }
            BackendCall::SetDefaultRoute { node, gateway } => {
                write!(f, "default route on {node} via {gateway}")
            }
            BackendCall::NetworkReady => f.write_str("network ready"),
            BackendCall::Destroy { resource, name } => write!(f, "destroy {resource} ({name})"),
        }
    }
}

/// Shared view on the calls recorded by a [`RecordingBackend`]
///
/// Remains readable after the backend itself has been handed over to an orchestrator.
#[derive(Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<BackendCall>>>,
}

impl CallLog {
    pub fn snapshot(&self) -> Vec<BackendCall> {
        self.calls.lock().clone()
    }

    pub fn count(&self, operation: BackendOperation) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.operation() == operation)
            .count()
    }

    fn push(&self, call: BackendCall) {
        self.calls.lock().push(call);
    }
}

#[derive(Default)]
pub struct RecordingBackend {
    log: CallLog,
    next_handle: u64,
    nodes: BTreeMap<NodeHandle, Arc<str>>,
    links: BTreeMap<LinkHandle, String>,
    attempts: HashMap<BackendOperation, usize>,
    failures: HashMap<BackendOperation, Vec<usize>>,
    forbid_parallel_links: bool,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the `nth` (1-based) attempt at `operation` fail
    pub fn fail_on(mut self, operation: BackendOperation, nth: usize) -> Self {
        self.failures.entry(operation).or_default().push(nth);
        self
    }

    pub fn forbid_parallel_links(mut self) -> Self {
        self.forbid_parallel_links = true;
        self
    }

    pub fn log(&self) -> CallLog {
        self.log.clone()
    }

    /// Resources that were created and not destroyed yet
    pub fn resident_resources(&self) -> Vec<Resource> {
        self.nodes
            .keys()
            .map(|&n| Resource::Node(n))
            .chain(self.links.keys().map(|&l| Resource::Link(l)))
            .collect()
    }

    fn attempt(&mut self, operation: BackendOperation) -> Result<(), BackendError> {
        let attempt = self.attempts.entry(operation).or_default();
        *attempt += 1;

        let should_fail = self
            .failures
            .get(&operation)
            .is_some_and(|f| f.contains(attempt));
        if should_fail {
            Err(BackendError::new(
                operation,
                format!("injected failure (attempt #{attempt})"),
            ))
        } else {
            Ok(())
        }
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn node_name(
        &self,
        operation: BackendOperation,
        node: NodeHandle,
    ) -> Result<Arc<str>, BackendError> {
        self.nodes.get(&node).cloned().ok_or_else(|| {
            BackendError::new(operation, format!("unknown {}", Resource::Node(node)))
        })
    }
}

impl EmulationBackend for RecordingBackend {
    fn create_namespace_node(&mut self, node: &NodeDescriptor) -> Result<NodeHandle, BackendError> {
        self.attempt(BackendOperation::CreateNode)?;
        let handle = NodeHandle(self.next_handle());
        self.nodes.insert(handle, node.id().clone());
        self.log.push(BackendCall::CreateNode {
            node: node.id().clone(),
            role: node.role(),
            handle,
        });
        Ok(handle)
    }

    fn create_switch(&mut self, node: &NodeDescriptor) -> Result<NodeHandle, BackendError> {
        self.attempt(BackendOperation::CreateSwitch)?;
        let handle = NodeHandle(self.next_handle());
        self.nodes.insert(handle, node.id().clone());
        self.log.push(BackendCall::CreateSwitch {
            node: node.id().clone(),
            handle,
        });
        Ok(handle)
    }

    fn create_virtual_link(
        &mut self,
        node_a: NodeHandle,
        interface_a: &Interface,
        node_b: NodeHandle,
        interface_b: &Interface,
    ) -> Result<LinkHandle, BackendError> {
        self.attempt(BackendOperation::CreateLink)?;
        self.node_name(BackendOperation::CreateLink, node_a)?;
        self.node_name(BackendOperation::CreateLink, node_b)?;

        let handle = LinkHandle(self.next_handle());
        self.links.insert(
            handle,
            format!("{}<->{}", interface_a.name, interface_b.name),
        );
        self.log.push(BackendCall::CreateLink {
            a: interface_a.clone(),
            b: interface_b.clone(),
            handle,
        });
        Ok(handle)
    }

    fn apply_shaping(
        &mut self,
        link: LinkHandle,
        shaping: &LinkShaping,
    ) -> Result<(), BackendError> {
        self.attempt(BackendOperation::ApplyShaping)?;
        if !self.links.contains_key(&link) {
            return Err(BackendError::new(
                BackendOperation::ApplyShaping,
                format!("unknown {}", Resource::Link(link)),
            ));
        }

        self.log.push(BackendCall::ApplyShaping {
            link,
            shaping: shaping.clone(),
        });
        Ok(())
    }

    fn set_forwarding(&mut self, node: NodeHandle, enabled: bool) -> Result<(), BackendError> {
        self.attempt(BackendOperation::SetForwarding)?;
        let node = self.node_name(BackendOperation::SetForwarding, node)?;
        self.log.push(BackendCall::SetForwarding { node, enabled });
        Ok(())
    }

    fn set_default_route(
        &mut self,
        node: NodeHandle,
        gateway: Ipv4Addr,
    ) -> Result<(), BackendError> {
        self.attempt(BackendOperation::SetDefaultRoute)?;
        let node = self.node_name(BackendOperation::SetDefaultRoute, node)?;
        self.log.push(BackendCall::SetDefaultRoute { node, gateway });
        Ok(())
    }

    fn network_ready(&mut self) -> Result<(), BackendError> {
        self.attempt(BackendOperation::NetworkReady)?;
        self.log.push(BackendCall::NetworkReady);
        Ok(())
    }

    fn destroy(&mut self, resource: Resource) -> Result<(), BackendError> {
        self.attempt(BackendOperation::Destroy)?;
        let name = match resource {
            Resource::Node(node) => self.nodes.remove(&node).map(|n| n.to_string()),
            Resource::Link(link) => self.links.remove(&link),
        };

        let Some(name) = name else {
            return Err(BackendError::new(
                BackendOperation::Destroy,
                format!("unknown {resource}"),
            ));
        };

        self.log.push(BackendCall::Destroy { resource, name });
        Ok(())
    }

    fn supports_parallel_links(&self) -> bool {
        !self.forbid_parallel_links
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_handles_are_tracked_until_destroyed() {
        let mut backend = RecordingBackend::new();
        let log = backend.log();

        let s1 = backend
            .create_switch(&NodeDescriptor::switch("s1").unwrap())
            .unwrap();
        let s2 = backend
            .create_switch(&NodeDescriptor::switch("s2").unwrap())
            .unwrap();
        let interface = |node: &str, name: &str| Interface {
            node: node.into(),
            name: name.to_string(),
            address: None,
        };
        let link = backend
            .create_virtual_link(s1, &interface("s1", "s1-eth1"), s2, &interface("s2", "s2-eth1"))
            .unwrap();
        assert_eq!(backend.resident_resources().len(), 3);

        backend.destroy(Resource::Link(link)).unwrap();
        backend.destroy(Resource::Node(s2)).unwrap();
        backend.destroy(Resource::Node(s1)).unwrap();
        assert!(backend.resident_resources().is_empty());

        // Destroying twice is an error
        assert!(backend.destroy(Resource::Node(s1)).is_err());

        assert_eq!(log.count(BackendOperation::CreateSwitch), 2);
        assert_eq!(log.count(BackendOperation::Destroy), 3);
        assert_eq!(
            log.snapshot()[2].to_string(),
            "create link s1:s1-eth1 <-> s2:s2-eth1 -> link#2"
        );
    }

    #[test]
    fn test_injected_failures() {
        let mut backend = RecordingBackend::new().fail_on(BackendOperation::CreateSwitch, 2);
        let log = backend.log();

        assert!(
            backend
                .create_switch(&NodeDescriptor::switch("s1").unwrap())
                .is_ok()
        );
        let err = backend
            .create_switch(&NodeDescriptor::switch("s2").unwrap())
            .unwrap_err();
        assert_eq!(err.operation, BackendOperation::CreateSwitch);
        assert!(
            backend
                .create_switch(&NodeDescriptor::switch("s3").unwrap())
                .is_ok()
        );

        // Failed calls are not recorded
        assert_eq!(log.count(BackendOperation::CreateSwitch), 2);
        assert_eq!(backend.resident_resources().len(), 2);
    }
}
