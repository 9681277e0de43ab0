use crate::network::ip::Ipv4Cidr;
use crate::network::node::NodeRole;
use crate::network::shaping::ShapingDiscipline;
use crate::network::topology::LinkOverrides;
use std::net::Ipv4Addr;
use std::time::Duration;

/// Plain-data description of a network, validated by [`Topology::from_spec`]
///
/// [`Topology::from_spec`]: crate::network::topology::Topology::from_spec
#[derive(Debug, Clone, Default)]
pub struct NetworkSpec {
    pub nodes: Vec<NetworkNodeSpec>,
    pub links: Vec<NetworkLinkSpec>,
}

#[derive(Debug, Clone)]
pub struct NetworkNodeSpec {
    pub id: String,
    pub role: NodeRole,
    pub addresses: Vec<Ipv4Cidr>,
    pub default_route: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkLinkSpec {
    pub a: String,
    pub b: String,
    pub bandwidth_mbps: Option<f64>,
    pub delay: Option<Duration>,
    pub jitter: Option<Duration>,
    pub loss_percent: Option<f64>,
    pub max_queue_packets: Option<u32>,
    pub discipline: Option<ShapingDiscipline>,
    pub overrides: LinkOverrides,
}
