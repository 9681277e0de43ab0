//! Static description of the emulated network
//!
//! Nodes and links are validated as they are defined, and assembled into an immutable
//! [`topology::Topology`] that the orchestrator later hands to an emulation backend.

pub mod ip;
pub mod node;
pub mod preset;
pub mod router;
pub mod shaping;
pub mod spec;
pub mod topology;

use crate::network::node::NodeRole;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TopologyError {
    #[error("invalid configuration for node `{id}`: {reason}")]
    InvalidNodeConfig { id: String, reason: String },
    #[error("invalid link shaping: {reason}")]
    InvalidShapingConfig { reason: String },
    #[error("network node `{id}` was defined more than once")]
    DuplicateNode { id: String },
    #[error("network node `{id}` was referenced but does not exist")]
    UnknownNode { id: String },
    #[error("network node `{id}` cannot be linked to itself")]
    SelfLink { id: String },
    #[error(
        "network nodes `{a}` and `{b}` are already linked, and the backend does not support parallel links"
    )]
    DuplicateLink { a: String, b: String },
    #[error("the network is not connected (unreachable from `{from}`: {})", .unreachable.join(", "))]
    DisconnectedTopology {
        from: String,
        unreachable: Vec<String>,
    },
    #[error("expected {expected} node(s) with role {role}, but found {found}")]
    RoleCountViolation {
        role: NodeRole,
        expected: usize,
        found: usize,
    },
    #[error("invalid interface `{interface}` on network node `{node}`: {reason}")]
    InterfaceConflict {
        node: String,
        interface: String,
        reason: String,
    },
}
