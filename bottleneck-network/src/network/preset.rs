//! The canonical bottleneck network
//!
//! Two senders (`tx1`, `tx2`) share a switched subnet with the router `r1`, which forwards their
//! traffic over a narrow link into a second switched subnet holding the receiver `rx1`:
//!
//! ```text
//! tx1 --+
//!       s1 -- r1 ==(bottleneck)== s2 -- rx1
//! tx2 --+
//! ```

use crate::network::TopologyError;
use crate::network::ip::Ipv4Cidr;
use crate::network::node::NodeRole;
use crate::network::shaping::ShapingDiscipline;
use crate::network::spec::{NetworkLinkSpec, NetworkNodeSpec, NetworkSpec};
use crate::network::topology::{EndpointOverride, LinkOverrides, ParallelLinks, Topology};
use std::net::Ipv4Addr;
use std::time::Duration;

const SENDER_SUBNET_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const RECEIVER_SUBNET_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 1, 0, 1);

/// Tunable parameters of the bottleneck network
#[derive(Debug, Clone, PartialEq)]
pub struct BottleneckParams {
    pub bottleneck_mbps: f64,
    pub bottleneck_delay: Duration,
    pub bottleneck_loss_percent: f64,
    pub bottleneck_queue_packets: u32,
    /// Bandwidth of the links between the senders and their switch
    pub access_mbps: f64,
}

impl Default for BottleneckParams {
    fn default() -> Self {
        Self {
            bottleneck_mbps: 10.0,
            bottleneck_delay: Duration::from_millis(20),
            bottleneck_loss_percent: 0.0,
            bottleneck_queue_packets: 10_000,
            access_mbps: 100.0,
        }
    }
}

impl BottleneckParams {
    pub fn spec(&self) -> NetworkSpec {
        let sender_gateway = Ipv4Cidr::from_parts(SENDER_SUBNET_GATEWAY, 24);
        let receiver_gateway = Ipv4Cidr::from_parts(RECEIVER_SUBNET_GATEWAY, 24);

        let host = |id: &str, address: Ipv4Addr, gateway: Ipv4Addr| NetworkNodeSpec {
            id: id.to_string(),
            role: NodeRole::Host,
            addresses: vec![Ipv4Cidr::from_parts(address, 24)],
            default_route: Some(gateway),
        };
        let switch = |id: &str| NetworkNodeSpec {
            id: id.to_string(),
            role: NodeRole::Switch,
            addresses: Vec::new(),
            default_route: None,
        };
        let access_link = |host: &str| NetworkLinkSpec {
            a: host.to_string(),
            b: "s1".to_string(),
            bandwidth_mbps: Some(self.access_mbps),
            delay: Some(Duration::ZERO),
            loss_percent: Some(0.0),
            discipline: Some(ShapingDiscipline::TokenBucket),
            ..NetworkLinkSpec::default()
        };

        let nodes = vec![
            NetworkNodeSpec {
                id: "r1".to_string(),
                role: NodeRole::Router,
                addresses: vec![sender_gateway, receiver_gateway],
                default_route: None,
            },
            switch("s1"),
            switch("s2"),
            host("tx1", Ipv4Addr::new(10, 0, 0, 251), SENDER_SUBNET_GATEWAY),
            host("tx2", Ipv4Addr::new(10, 0, 0, 252), SENDER_SUBNET_GATEWAY),
            host("rx1", Ipv4Addr::new(10, 1, 0, 252), RECEIVER_SUBNET_GATEWAY),
        ];

        let links = vec![
            NetworkLinkSpec {
                a: "s1".to_string(),
                b: "r1".to_string(),
                overrides: LinkOverrides {
                    a: EndpointOverride::default(),
                    b: EndpointOverride::new("r1-eth1", sender_gateway),
                },
                ..NetworkLinkSpec::default()
            },
            NetworkLinkSpec {
                a: "r1".to_string(),
                b: "s2".to_string(),
                bandwidth_mbps: Some(self.bottleneck_mbps),
                delay: Some(self.bottleneck_delay),
                loss_percent: Some(self.bottleneck_loss_percent),
                max_queue_packets: Some(self.bottleneck_queue_packets),
                discipline: Some(ShapingDiscipline::TokenBucket),
                overrides: LinkOverrides {
                    a: EndpointOverride::new("r1-eth2", receiver_gateway),
                    b: EndpointOverride::default(),
                },
                ..NetworkLinkSpec::default()
            },
            access_link("tx1"),
            access_link("tx2"),
            NetworkLinkSpec {
                a: "rx1".to_string(),
                b: "s2".to_string(),
                ..NetworkLinkSpec::default()
            },
        ];

        NetworkSpec { nodes, links }
    }

    /// Fails only if the parameters themselves are out of range
    pub fn topology(&self) -> Result<Topology, TopologyError> {
        Topology::from_spec(self.spec(), ParallelLinks::Allow)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_default_topology() {
        let topology = BottleneckParams::default().topology().unwrap();

        let ids: Vec<_> = topology.nodes().map(|n| n.id().to_string()).collect();
        assert_eq!(ids, ["r1", "s1", "s2", "tx1", "tx2", "rx1"]);
        assert_eq!(topology.links().len(), 5);

        let r1: Vec<_> = topology
            .interfaces_of("r1")
            .map(|i| (i.name.as_str(), i.address.unwrap().to_string()))
            .collect();
        assert_eq!(
            r1,
            [("r1-eth1", "10.0.0.1/24".to_string()), ("r1-eth2", "10.1.0.1/24".to_string())]
        );

        let bottleneck = &topology.links()[1];
        assert!(bottleneck.connects("r1", "s2"));
        assert_eq!(bottleneck.shaping.bandwidth_mbps(), Some(10.0));
        assert_eq!(bottleneck.shaping.delay(), Some(Duration::from_millis(20)));
        assert_eq!(bottleneck.shaping.max_queue_packets(), Some(10_000));
        assert_eq!(
            bottleneck.shaping.discipline(),
            Some(ShapingDiscipline::TokenBucket)
        );

        assert!(topology.links()[0].shaping.is_unshaped());
        assert_eq!(topology.links()[2].shaping.bandwidth_mbps(), Some(100.0));
        assert_eq!(topology.links()[3].shaping.bandwidth_mbps(), Some(100.0));
        assert!(topology.links()[4].shaping.is_unshaped());

        let rx1 = topology.node("rx1").unwrap();
        assert_eq!(rx1.default_route(), Some(RECEIVER_SUBNET_GATEWAY));
        let rx1_interface = topology.interfaces_of("rx1").next().unwrap();
        assert_eq!(rx1_interface.name, "rx1-eth0");
        assert_eq!(rx1_interface.address.unwrap().to_string(), "10.1.0.252/24");

        let s2_ports: Vec<_> = topology.interfaces_of("s2").map(|i| &*i.name).collect();
        assert_eq!(s2_ports, ["s2-eth1", "s2-eth2"]);
    }

    #[test]
    fn test_custom_parameters() {
        let params = BottleneckParams {
            bottleneck_mbps: 2.5,
            bottleneck_loss_percent: 1.0,
            access_mbps: 1000.0,
            ..BottleneckParams::default()
        };
        let topology = params.topology().unwrap();

        assert_eq!(topology.links()[1].shaping.bandwidth_mbps(), Some(2.5));
        assert_eq!(topology.links()[1].shaping.loss_percent(), 1.0);
        assert_eq!(topology.links()[2].shaping.bandwidth_mbps(), Some(1000.0));
    }

    #[test]
    fn test_invalid_parameters() {
        let params = BottleneckParams {
            bottleneck_queue_packets: 0,
            ..BottleneckParams::default()
        };
        assert!(matches!(
            params.topology(),
            Err(TopologyError::InvalidShapingConfig { .. })
        ));
    }
}
