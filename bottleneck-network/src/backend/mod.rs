//! The boundary between the topology model and whatever actually emulates the network
//!
//! Backends own every runtime resource they create. The orchestrator only ever refers to those
//! resources through the opaque handles returned here.

pub mod netns;
pub mod recording;

use crate::network::node::NodeDescriptor;
use crate::network::shaping::LinkShaping;
use crate::network::topology::Interface;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeHandle(pub u64);

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkHandle(pub u64);

/// Anything a backend can tear down
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    Node(NodeHandle),
    Link(LinkHandle),
}

impl Display for Resource {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Resource::Node(NodeHandle(n)) => write!(f, "node#{n}"),
            Resource::Link(LinkHandle(l)) => write!(f, "link#{l}"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BackendOperation {
    CreateNode,
    CreateSwitch,
    CreateLink,
    ApplyShaping,
    SetForwarding,
    SetDefaultRoute,
    NetworkReady,
    Destroy,
}

impl Display for BackendOperation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BackendOperation::CreateNode => "create node",
            BackendOperation::CreateSwitch => "create switch",
            BackendOperation::CreateLink => "create link",
            BackendOperation::ApplyShaping => "apply shaping",
            BackendOperation::SetForwarding => "set forwarding",
            BackendOperation::SetDefaultRoute => "set default route",
            BackendOperation::NetworkReady => "finalize network",
            BackendOperation::Destroy => "destroy",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("backend failed to {operation}: {message}")]
pub struct BackendError {
    pub operation: BackendOperation,
    pub message: String,
}

impl BackendError {
    pub fn new(operation: BackendOperation, message: impl Into<String>) -> Self {
        Self {
            operation,
            message: message.into(),
        }
    }
}

/// Primitives consumed from a network emulation engine
///
/// Calls are issued sequentially from a single thread. Interfaces are created by
/// [`EmulationBackend::create_virtual_link`] and carry the address assigned to them by the
/// topology, if any.
pub trait EmulationBackend {
    /// Creates an isolated node with its own network stack (hosts and routers)
    fn create_namespace_node(&mut self, node: &NodeDescriptor) -> Result<NodeHandle, BackendError>;

    /// Creates a node that bridges all of its interfaces together
    fn create_switch(&mut self, node: &NodeDescriptor) -> Result<NodeHandle, BackendError>;

    fn create_virtual_link(
        &mut self,
        node_a: NodeHandle,
        interface_a: &Interface,
        node_b: NodeHandle,
        interface_b: &Interface,
    ) -> Result<LinkHandle, BackendError>;

    /// Applies `shaping` to both directions of `link`, replacing whatever was applied before
    fn apply_shaping(&mut self, link: LinkHandle, shaping: &LinkShaping)
    -> Result<(), BackendError>;

    fn set_forwarding(&mut self, node: NodeHandle, enabled: bool) -> Result<(), BackendError>;

    fn set_default_route(&mut self, node: NodeHandle, gateway: Ipv4Addr)
    -> Result<(), BackendError>;

    /// Called once all nodes and links exist and have been configured
    fn network_ready(&mut self) -> Result<(), BackendError> {
        Ok(())
    }

    fn destroy(&mut self, resource: Resource) -> Result<(), BackendError>;

    /// Whether the backend can realize more than one link between the same pair of nodes
    fn supports_parallel_links(&self) -> bool {
        true
    }
}
