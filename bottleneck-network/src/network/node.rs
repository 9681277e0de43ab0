use crate::network::TopologyError;
use crate::network::ip::Ipv4Cidr;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::sync::Arc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NodeRole {
    Host,
    Switch,
    Router,
}

impl Display for NodeRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NodeRole::Host => "host",
            NodeRole::Switch => "switch",
            NodeRole::Router => "router",
        };
        f.write_str(name)
    }
}

/// A validated network endpoint
///
/// Hosts and routers are addressed (routers once per attached subnet), switches are not. A default
/// route, when present, must point to a gateway that is reachable through one of the node's own
/// subnets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    id: Arc<str>,
    role: NodeRole,
    addresses: Vec<Ipv4Cidr>,
    default_route: Option<Ipv4Addr>,
}

impl NodeDescriptor {
    pub fn new(
        id: impl Into<String>,
        role: NodeRole,
        addresses: Vec<Ipv4Cidr>,
        default_route: Option<Ipv4Addr>,
    ) -> Result<Self, TopologyError> {
        let id: String = id.into();
        let invalid = |reason: &str| TopologyError::InvalidNodeConfig {
            id: id.clone(),
            reason: reason.to_string(),
        };

        if id.trim().is_empty() {
            return Err(invalid("node id cannot be empty"));
        }

        match role {
            NodeRole::Switch => {
                if !addresses.is_empty() {
                    return Err(invalid("switches cannot have addresses"));
                }
                if default_route.is_some() {
                    return Err(invalid("switches cannot have a default route"));
                }
            }
            NodeRole::Host => {
                if addresses.is_empty() {
                    return Err(invalid("hosts need at least one address"));
                }
            }
            NodeRole::Router => {
                if addresses.len() < 2 {
                    return Err(invalid(
                        "routers need one address per attached subnet (at least two)",
                    ));
                }
            }
        }

        if let Some(gateway) = default_route {
            if !addresses.iter().any(|a| a.contains(gateway)) {
                return Err(invalid(&format!(
                    "default gateway {gateway} is not on any of the node's subnets"
                )));
            }
        }

        Ok(Self {
            id: id.into(),
            role,
            addresses,
            default_route,
        })
    }

    pub fn host(
        id: impl Into<String>,
        address: Ipv4Cidr,
        default_route: Option<Ipv4Addr>,
    ) -> Result<Self, TopologyError> {
        Self::new(id, NodeRole::Host, vec![address], default_route)
    }

    pub fn switch(id: impl Into<String>) -> Result<Self, TopologyError> {
        Self::new(id, NodeRole::Switch, Vec::new(), None)
    }

    pub fn router(id: impl Into<String>, addresses: Vec<Ipv4Cidr>) -> Result<Self, TopologyError> {
        Self::new(id, NodeRole::Router, addresses, None)
    }

    pub fn id(&self) -> &Arc<str> {
        &self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn addresses(&self) -> &[Ipv4Cidr] {
        &self.addresses
    }

    pub fn default_route(&self) -> Option<Ipv4Addr> {
        self.default_route
    }
}
