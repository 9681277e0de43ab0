use bottleneck_network::network::ip::Ipv4Cidr;
use bottleneck_network::network::node::NodeRole;
use bottleneck_network::network::shaping::ShapingDiscipline;
use bottleneck_network::network::spec::{NetworkLinkSpec, NetworkNodeSpec, NetworkSpec};
use bottleneck_network::network::topology::{EndpointOverride, LinkOverrides};
use serde::Deserialize;
use serde_with::{DisplayFromStr, serde_as};
use std::net::Ipv4Addr;
use std::time::Duration;

#[derive(Deserialize, Clone)]
pub struct NetworkSpecJson {
    nodes: Vec<NetworkNodeJson>,
    links: Vec<NetworkLinkJson>,
}

#[serde_as]
#[derive(Deserialize, Clone)]
struct NetworkNodeJson {
    id: String,
    #[serde(rename = "type")]
    #[serde(default = "default_network_node_kind")]
    kind: NetworkNodeKindJson,
    #[serde_as(as = "Vec<DisplayFromStr>")]
    #[serde(default)]
    addresses: Vec<Ipv4Cidr>,
    #[serde_as(as = "Option<DisplayFromStr>")]
    default_route: Option<Ipv4Addr>,
}

fn default_network_node_kind() -> NetworkNodeKindJson {
    NetworkNodeKindJson::Host
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
enum NetworkNodeKindJson {
    Host,
    Switch,
    Router,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
enum ShapingDisciplineJson {
    Tbf,
    Htb,
}

#[serde_as]
#[derive(Deserialize, Clone, Default)]
struct NetworkEndpointJson {
    /// Replaces the generated `<node>-eth<n>` interface name
    interface: Option<String>,
    /// Replaces the address the node would otherwise use on this link
    #[serde_as(as = "Option<DisplayFromStr>")]
    address: Option<Ipv4Cidr>,
}

#[derive(Deserialize, Clone)]
struct NetworkLinkJson {
    a: String,
    b: String,
    #[serde(default)]
    a_endpoint: NetworkEndpointJson,
    #[serde(default)]
    b_endpoint: NetworkEndpointJson,
    /// The link's bandwidth, in megabits per second
    bandwidth_mbps: Option<f64>,
    /// The delay of the link, in milliseconds
    delay_ms: Option<u64>,
    /// Random variation of the delay, in milliseconds
    jitter_ms: Option<u64>,
    /// The percentage of packets that will be lost (the value must be between 0 and 100)
    loss_percent: Option<f64>,
    max_queue_packets: Option<u32>,
    /// Required as soon as any of the shaping parameters is set
    discipline: Option<ShapingDisciplineJson>,
}

impl From<NetworkSpecJson> for NetworkSpec {
    fn from(json: NetworkSpecJson) -> Self {
        let nodes = json
            .nodes
            .into_iter()
            .map(|n| NetworkNodeSpec {
                id: n.id,
                role: match n.kind {
                    NetworkNodeKindJson::Host => NodeRole::Host,
                    NetworkNodeKindJson::Switch => NodeRole::Switch,
                    NetworkNodeKindJson::Router => NodeRole::Router,
                },
                addresses: n.addresses,
                default_route: n.default_route,
            })
            .collect();

        let links = json.links.into_iter().map(|l| l.into()).collect();

        Self { nodes, links }
    }
}

impl From<NetworkEndpointJson> for EndpointOverride {
    fn from(e: NetworkEndpointJson) -> Self {
        EndpointOverride {
            interface_name: e.interface,
            address: e.address,
        }
    }
}

impl From<NetworkLinkJson> for NetworkLinkSpec {
    fn from(l: NetworkLinkJson) -> Self {
        NetworkLinkSpec {
            a: l.a,
            b: l.b,
            bandwidth_mbps: l.bandwidth_mbps,
            delay: l.delay_ms.map(Duration::from_millis),
            jitter: l.jitter_ms.map(Duration::from_millis),
            loss_percent: l.loss_percent,
            max_queue_packets: l.max_queue_packets,
            discipline: l.discipline.map(|d| match d {
                ShapingDisciplineJson::Tbf => ShapingDiscipline::TokenBucket,
                ShapingDisciplineJson::Htb => ShapingDiscipline::HierarchicalTokenBucket,
            }),
            overrides: LinkOverrides {
                a: l.a_endpoint.into(),
                b: l.b_endpoint.into(),
            },
        }
    }
}
