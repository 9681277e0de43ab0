use crate::network::TopologyError;
use crate::network::ip::Ipv4Cidr;
use crate::network::node::{NodeDescriptor, NodeRole};
use crate::network::shaping::LinkShaping;
use crate::network::spec::NetworkSpec;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::{Display, Formatter};
use std::sync::Arc;

/// Linux limits interface names to 15 bytes (`IFNAMSIZ` minus the terminating nul byte)
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// The amount of nodes of each role a topology must contain
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TopologyShape {
    pub routers: usize,
    pub switches: usize,
    pub hosts: usize,
}

impl TopologyShape {
    /// One router joining two switched subnets, with three hosts spread over them
    pub const BOTTLENECK: TopologyShape = TopologyShape {
        routers: 1,
        switches: 2,
        hosts: 3,
    };

    fn expected(&self, role: NodeRole) -> usize {
        match role {
            NodeRole::Router => self.routers,
            NodeRole::Switch => self.switches,
            NodeRole::Host => self.hosts,
        }
    }
}

impl Default for TopologyShape {
    fn default() -> Self {
        Self::BOTTLENECK
    }
}

/// Whether more than one link may connect the same pair of nodes
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum ParallelLinks {
    #[default]
    Allow,
    Forbid,
}

/// Pins the name and/or address of one side of a link
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EndpointOverride {
    pub interface_name: Option<String>,
    pub address: Option<Ipv4Cidr>,
}

impl EndpointOverride {
    pub fn new(interface_name: impl Into<String>, address: Ipv4Cidr) -> Self {
        Self {
            interface_name: Some(interface_name.into()),
            address: Some(address),
        }
    }
}

/// Overrides for both sides of a link, in the same order as the link's endpoints
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LinkOverrides {
    pub a: EndpointOverride,
    pub b: EndpointOverride,
}

/// One side of a link, as it will appear inside the node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub node: Arc<str>,
    pub name: String,
    pub address: Option<Ipv4Cidr>,
}

impl Display for Interface {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.address {
            Some(address) => write!(f, "{}:{} ({address})", self.node, self.name),
            None => write!(f, "{}:{}", self.node, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Link {
    pub a: Interface,
    pub b: Interface,
    pub shaping: LinkShaping,
}

impl Link {
    pub fn connects(&self, node_a: &str, node_b: &str) -> bool {
        (&*self.a.node == node_a && &*self.b.node == node_b)
            || (&*self.a.node == node_b && &*self.b.node == node_a)
    }
}

/// A validated, immutable description of the emulated network
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<NodeDescriptor>,
    node_indices: HashMap<Arc<str>, usize>,
    links: Vec<Link>,
}

impl Topology {
    /// Builds a topology from its plain-data description
    pub fn from_spec(
        spec: NetworkSpec,
        parallel_links: ParallelLinks,
    ) -> Result<Self, TopologyError> {
        let mut builder = TopologyBuilder::new().parallel_links(parallel_links);

        for node in spec.nodes {
            builder.add_node(NodeDescriptor::new(
                node.id,
                node.role,
                node.addresses,
                node.default_route,
            )?)?;
        }

        for link in spec.links {
            let shaping = LinkShaping::builder()
                .maybe_bandwidth_mbps(link.bandwidth_mbps)
                .maybe_delay(link.delay)
                .maybe_jitter(link.jitter)
                .maybe_loss_percent(link.loss_percent)
                .maybe_max_queue_packets(link.max_queue_packets)
                .maybe_discipline(link.discipline)
                .build()?;
            builder.add_link_with(&link.a, &link.b, shaping, link.overrides)?;
        }

        builder.build()
    }

    /// The nodes, in the order in which they were added
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.iter()
    }

    pub fn node(&self, id: &str) -> Option<&NodeDescriptor> {
        self.node_indices.get(id).map(|&i| &self.nodes[i])
    }

    /// The links, in the order in which they were added
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn routers(&self) -> impl Iterator<Item = &NodeDescriptor> {
        self.nodes.iter().filter(|n| n.role() == NodeRole::Router)
    }

    /// The interfaces of `node_id`, in link order
    pub fn interfaces_of<'a>(&'a self, node_id: &'a str) -> impl Iterator<Item = &'a Interface> {
        self.links
            .iter()
            .flat_map(|l| [&l.a, &l.b])
            .filter(move |i| &*i.node == node_id)
    }
}

#[derive(Debug)]
struct PendingLink {
    a: Arc<str>,
    b: Arc<str>,
    shaping: LinkShaping,
    overrides: LinkOverrides,
}

/// Incrementally assembles a [`Topology`]
///
/// Calls that fail leave the builder untouched, so a caller may correct its input and carry on.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    nodes: Vec<NodeDescriptor>,
    node_indices: HashMap<Arc<str>, usize>,
    links: Vec<PendingLink>,
    shape: TopologyShape,
    parallel_links: ParallelLinks,
}

impl TopologyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_shape(mut self, shape: TopologyShape) -> Self {
        self.shape = shape;
        self
    }

    pub fn parallel_links(mut self, parallel_links: ParallelLinks) -> Self {
        self.parallel_links = parallel_links;
        self
    }

    pub fn add_node(&mut self, node: NodeDescriptor) -> Result<&mut Self, TopologyError> {
        if self.node_indices.contains_key(node.id()) {
            return Err(TopologyError::DuplicateNode {
                id: node.id().to_string(),
            });
        }

        self.node_indices.insert(node.id().clone(), self.nodes.len());
        self.nodes.push(node);
        Ok(self)
    }

    pub fn add_link(
        &mut self,
        a: &str,
        b: &str,
        shaping: LinkShaping,
    ) -> Result<&mut Self, TopologyError> {
        self.add_link_with(a, b, shaping, LinkOverrides::default())
    }

    pub fn add_link_with(
        &mut self,
        a: &str,
        b: &str,
        shaping: LinkShaping,
        overrides: LinkOverrides,
    ) -> Result<&mut Self, TopologyError> {
        let a = self.resolve(a)?;
        let b = self.resolve(b)?;

        if a == b {
            return Err(TopologyError::SelfLink { id: a.to_string() });
        }

        if self.parallel_links == ParallelLinks::Forbid
            && self
                .links
                .iter()
                .any(|l| (l.a == a && l.b == b) || (l.a == b && l.b == a))
        {
            return Err(TopologyError::DuplicateLink {
                a: a.to_string(),
                b: b.to_string(),
            });
        }

        self.links.push(PendingLink {
            a,
            b,
            shaping,
            overrides,
        });
        Ok(self)
    }

    fn resolve(&self, id: &str) -> Result<Arc<str>, TopologyError> {
        self.node_indices
            .get_key_value(id)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| TopologyError::UnknownNode { id: id.to_string() })
    }

    pub fn build(self) -> Result<Topology, TopologyError> {
        self.check_connectivity()?;
        self.check_role_counts()?;

        let links = self.resolve_interfaces()?;
        Ok(Topology {
            nodes: self.nodes,
            node_indices: self.node_indices,
            links,
        })
    }

    fn check_connectivity(&self) -> Result<(), TopologyError> {
        let Some(first) = self.nodes.first() else {
            // Nothing to connect
            return Ok(());
        };

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for link in &self.links {
            adjacency.entry(&*link.a).or_default().push(&*link.b);
            adjacency.entry(&*link.b).or_default().push(&*link.a);
        }

        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        visited.insert(&**first.id());
        queue.push_back(&**first.id());
        while let Some(current) = queue.pop_front() {
            for &neighbor in adjacency.get(current).into_iter().flatten() {
                if visited.insert(neighbor) {
                    queue.push_back(neighbor);
                }
            }
        }

        let unreachable: Vec<_> = self
            .nodes
            .iter()
            .filter(|n| !visited.contains(&**n.id()))
            .map(|n| n.id().to_string())
            .collect();
        if unreachable.is_empty() {
            Ok(())
        } else {
            Err(TopologyError::DisconnectedTopology {
                from: first.id().to_string(),
                unreachable,
            })
        }
    }

    fn check_role_counts(&self) -> Result<(), TopologyError> {
        for role in [NodeRole::Router, NodeRole::Switch, NodeRole::Host] {
            let expected = self.shape.expected(role);
            let found = self.nodes.iter().filter(|n| n.role() == role).count();
            if found != expected {
                return Err(TopologyError::RoleCountViolation {
                    role,
                    expected,
                    found,
                });
            }
        }

        Ok(())
    }

    /// Names and addresses the interfaces created for each link
    ///
    /// Unless overridden, the n-th link of a node gets the interface `<node>-eth<n>` and the node's
    /// n-th address. Switch ports are numbered from 1 and never carry addresses. Names only need to
    /// be unique within a node, since every node lives in its own namespace.
    fn resolve_interfaces(&self) -> Result<Vec<Link>, TopologyError> {
        let mut ordinals: HashMap<Arc<str>, usize> = HashMap::new();
        let mut names: HashSet<(Arc<str>, String)> = HashSet::new();
        let mut links = Vec::with_capacity(self.links.len());

        for pending in &self.links {
            let mut resolve = |id: &Arc<str>,
                               endpoint: &EndpointOverride|
             -> Result<Interface, TopologyError> {
                let node = &self.nodes[self.node_indices[id]];
                let ordinal = ordinals.entry(id.clone()).or_default();
                let current = *ordinal;
                *ordinal += 1;

                let (port_base, default_address) = match node.role() {
                    NodeRole::Switch => (1, None),
                    NodeRole::Host | NodeRole::Router => {
                        (0, node.addresses().get(current).copied())
                    }
                };

                let name = endpoint
                    .interface_name
                    .clone()
                    .unwrap_or_else(|| format!("{id}-eth{}", current + port_base));
                validate_interface_name(id, &name, &mut names)?;

                Ok(Interface {
                    node: id.clone(),
                    name,
                    address: endpoint.address.or(default_address),
                })
            };

            let a = resolve(&pending.a, &pending.overrides.a)?;
            let b = resolve(&pending.b, &pending.overrides.b)?;
            links.push(Link {
                a,
                b,
                shaping: pending.shaping.clone(),
            });
        }

        Ok(links)
    }
}

fn validate_interface_name(
    node: &Arc<str>,
    name: &str,
    seen: &mut HashSet<(Arc<str>, String)>,
) -> Result<(), TopologyError> {
    let conflict = |reason: String| TopologyError::InterfaceConflict {
        node: node.to_string(),
        interface: name.to_string(),
        reason,
    };

    if name.is_empty() {
        return Err(conflict("interface names cannot be empty".to_string()));
    }
    if name.len() > MAX_INTERFACE_NAME_LEN {
        return Err(conflict(format!(
            "interface names are limited to {MAX_INTERFACE_NAME_LEN} bytes"
        )));
    }
    if name.contains(['/', ' ']) {
        return Err(conflict(
            "interface names cannot contain slashes or whitespace".to_string(),
        ));
    }
    if !seen.insert((node.clone(), name.to_string())) {
        return Err(conflict(
            "the node already has an interface with this name".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::network::shaping::ShapingDiscipline;
    use bon::builder;
    use std::net::Ipv4Addr;

    fn cidr(s: &str) -> Ipv4Cidr {
        s.parse().unwrap()
    }

    fn shaped(mbps: f64) -> LinkShaping {
        LinkShaping::builder()
            .bandwidth_mbps(mbps)
            .discipline(ShapingDiscipline::TokenBucket)
            .build()
            .unwrap()
    }

    /// Two subnets joined by `r1`, with `s1` serving `tx1`/`tx2` and `s2` serving `rx1`
    #[builder]
    fn default_builder(
        #[builder(default = true)] with_router: bool,
        #[builder(default)] extra_hosts: Vec<NodeDescriptor>,
        #[builder(default = true)] link_rx1: bool,
    ) -> TopologyBuilder {
        let mut builder = TopologyBuilder::new();
        if with_router {
            builder
                .add_node(
                    NodeDescriptor::router("r1", vec![cidr("10.0.0.1/24"), cidr("10.1.0.1/24")])
                        .unwrap(),
                )
                .unwrap();
        }
        builder
            .add_node(NodeDescriptor::switch("s1").unwrap())
            .unwrap()
            .add_node(NodeDescriptor::switch("s2").unwrap())
            .unwrap();
        for (id, ip, gw) in [
            ("tx1", "10.0.0.251/24", [10, 0, 0, 1]),
            ("tx2", "10.0.0.252/24", [10, 0, 0, 1]),
            ("rx1", "10.1.0.252/24", [10, 1, 0, 1]),
        ] {
            builder
                .add_node(NodeDescriptor::host(id, cidr(ip), Some(Ipv4Addr::from(gw))).unwrap())
                .unwrap();
        }
        for host in extra_hosts {
            builder.add_node(host).unwrap();
        }

        if with_router {
            builder
                .add_link("r1", "s1", LinkShaping::unshaped())
                .unwrap()
                .add_link("r1", "s2", shaped(10.0))
                .unwrap();
        } else {
            builder
                .add_link("s1", "s2", LinkShaping::unshaped())
                .unwrap();
        }
        builder
            .add_link("tx1", "s1", shaped(100.0))
            .unwrap()
            .add_link("tx2", "s1", shaped(100.0))
            .unwrap();
        if link_rx1 {
            builder
                .add_link("s2", "rx1", LinkShaping::unshaped())
                .unwrap();
        }

        builder
    }

    #[test]
    fn test_build_bottleneck_shape() {
        let topology = default_builder().call().build().unwrap();

        assert_eq!(topology.nodes().count(), 6);
        assert_eq!(topology.links().len(), 5);
        assert_eq!(topology.routers().count(), 1);
        assert_eq!(topology.node("rx1").unwrap().role(), NodeRole::Host);
        assert!(topology.node("nope").is_none());

        // Insertion order is preserved
        let ids: Vec<_> = topology.nodes().map(|n| n.id().to_string()).collect();
        assert_eq!(ids, ["r1", "s1", "s2", "tx1", "tx2", "rx1"]);
        assert!(topology.links()[1].connects("s2", "r1"));
    }

    #[test]
    fn test_interfaces_are_named_deterministically() {
        let topology = default_builder().call().build().unwrap();

        let r1: Vec<_> = topology
            .interfaces_of("r1")
            .map(|i| (i.name.clone(), i.address))
            .collect();
        assert_eq!(
            r1,
            [
                ("r1-eth0".to_string(), Some(cidr("10.0.0.1/24"))),
                ("r1-eth1".to_string(), Some(cidr("10.1.0.1/24"))),
            ]
        );

        let s1: Vec<_> = topology
            .interfaces_of("s1")
            .map(|i| (i.name.clone(), i.address))
            .collect();
        assert_eq!(
            s1,
            [
                ("s1-eth1".to_string(), None),
                ("s1-eth2".to_string(), None),
                ("s1-eth3".to_string(), None),
            ]
        );

        let tx1 = topology.interfaces_of("tx1").next().unwrap();
        assert_eq!(tx1.name, "tx1-eth0");
        assert_eq!(tx1.address, Some(cidr("10.0.0.251/24")));
    }

    #[test]
    fn test_endpoint_overrides() {
        let mut builder = default_builder().with_router(false).call();
        builder
            .add_node(
                NodeDescriptor::router("r9", vec![cidr("10.0.0.9/24"), cidr("10.1.0.9/24")])
                    .unwrap(),
            )
            .unwrap()
            .add_link_with(
                "s1",
                "r9",
                LinkShaping::unshaped(),
                LinkOverrides {
                    a: EndpointOverride::default(),
                    b: EndpointOverride::new("r9-up", cidr("10.0.0.99/24")),
                },
            )
            .unwrap();

        let topology = builder.build().unwrap();
        let r9 = topology.interfaces_of("r9").next().unwrap();
        assert_eq!(r9.name, "r9-up");
        assert_eq!(r9.address, Some(cidr("10.0.0.99/24")));
    }

    #[test]
    fn test_duplicate_node() {
        let mut builder = default_builder().call();
        let result = builder.add_node(NodeDescriptor::switch("s1").unwrap());
        assert!(matches!(result, Err(TopologyError::DuplicateNode { id }) if id == "s1"));

        // The builder is still usable
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_unknown_node_leaves_builder_untouched() {
        let mut builder = default_builder().call();
        let links_before = builder.links.len();

        for (a, b) in [("tx1", "s3"), ("s3", "tx1"), ("ghost", "phantom")] {
            let result = builder.add_link(a, b, LinkShaping::unshaped());
            assert!(
                matches!(&result, Err(TopologyError::UnknownNode { id }) if id != "tx1"),
                "{result:?}"
            );
        }

        assert_eq!(builder.links.len(), links_before);
        assert_eq!(builder.build().unwrap().links().len(), 5);
    }

    #[test]
    fn test_self_link() {
        let mut builder = default_builder().call();
        let result = builder.add_link("s1", "s1", LinkShaping::unshaped());
        assert!(matches!(result, Err(TopologyError::SelfLink { id }) if id == "s1"));
    }

    #[test]
    fn test_parallel_links() {
        let mut builder = default_builder().call();
        builder
            .add_link("s1", "tx1", LinkShaping::unshaped())
            .unwrap();
        assert_eq!(builder.build().unwrap().links().len(), 6);

        let mut builder = default_builder().call().parallel_links(ParallelLinks::Forbid);
        let result = builder.add_link("s1", "tx1", LinkShaping::unshaped());
        assert!(matches!(
            result,
            Err(TopologyError::DuplicateLink { a, b }) if a == "s1" && b == "tx1"
        ));
    }

    #[test]
    fn test_parallel_links_get_distinct_interfaces() {
        let mut builder = default_builder().call();
        builder
            .add_link("tx1", "s1", shaped(1.0))
            .unwrap();
        let topology = builder.build().unwrap();

        let tx1: Vec<_> = topology
            .interfaces_of("tx1")
            .map(|i| (i.name.clone(), i.address))
            .collect();
        assert_eq!(
            tx1,
            [
                ("tx1-eth0".to_string(), Some(cidr("10.0.0.251/24"))),
                ("tx1-eth1".to_string(), None),
            ]
        );
    }

    #[test]
    fn test_disconnected_topology() {
        let result = default_builder().link_rx1(false).call().build();
        match result {
            Err(TopologyError::DisconnectedTopology { from, unreachable }) => {
                assert_eq!(from, "r1");
                assert_eq!(unreachable, ["rx1"]);
            }
            other => panic!("expected DisconnectedTopology, got {other:?}"),
        }
    }

    #[test]
    fn test_role_count_violations() {
        // No router at all (the switches are linked directly instead)
        let result = default_builder().with_router(false).call().build();
        assert!(matches!(
            result,
            Err(TopologyError::RoleCountViolation {
                role: NodeRole::Router,
                expected: 1,
                found: 0
            })
        ));

        // A fourth host
        let mut builder = default_builder()
            .extra_hosts(vec![
                NodeDescriptor::host("rx2", cidr("10.1.0.253/24"), None).unwrap(),
            ])
            .call();
        builder
            .add_link("rx2", "s2", LinkShaping::unshaped())
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(TopologyError::RoleCountViolation {
                role: NodeRole::Host,
                expected: 3,
                found: 4
            })
        ));

        // ... which is fine once the expected shape says so
        let mut builder = default_builder()
            .extra_hosts(vec![
                NodeDescriptor::host("rx2", cidr("10.1.0.253/24"), None).unwrap(),
            ])
            .call()
            .with_shape(TopologyShape {
                hosts: 4,
                ..TopologyShape::BOTTLENECK
            });
        builder
            .add_link("rx2", "s2", LinkShaping::unshaped())
            .unwrap();
        assert!(builder.build().is_ok());
    }

    #[test]
    fn test_connectivity_is_checked_before_role_counts() {
        let mut builder = TopologyBuilder::new();
        builder
            .add_node(NodeDescriptor::switch("s1").unwrap())
            .unwrap()
            .add_node(NodeDescriptor::switch("s2").unwrap())
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(TopologyError::DisconnectedTopology { .. })
        ));

        assert!(matches!(
            TopologyBuilder::new().build(),
            Err(TopologyError::RoleCountViolation {
                role: NodeRole::Router,
                ..
            })
        ));
    }

    #[test]
    fn test_interface_conflicts() {
        let mut builder = default_builder().with_router(false).call();
        builder
            .add_node(
                NodeDescriptor::router("r1", vec![cidr("10.0.0.1/24"), cidr("10.1.0.1/24")])
                    .unwrap(),
            )
            .unwrap()
            .add_link_with(
                "r1",
                "s1",
                LinkShaping::unshaped(),
                LinkOverrides {
                    a: EndpointOverride::new("r1-eth1", cidr("10.0.0.1/24")),
                    b: EndpointOverride::default(),
                },
            )
            .unwrap()
            .add_link("r1", "s2", LinkShaping::unshaped())
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(TopologyError::InterfaceConflict { node, interface, .. })
                if node == "r1" && interface == "r1-eth1"
        ));

        let mut builder = default_builder().with_router(false).call();
        builder
            .add_node(
                NodeDescriptor::router("r1", vec![cidr("10.0.0.1/24"), cidr("10.1.0.1/24")])
                    .unwrap(),
            )
            .unwrap()
            .add_link_with(
                "r1",
                "s1",
                LinkShaping::unshaped(),
                LinkOverrides {
                    a: EndpointOverride {
                        interface_name: Some("a-very-long-interface".to_string()),
                        address: None,
                    },
                    b: EndpointOverride::default(),
                },
            )
            .unwrap();
        assert!(matches!(
            builder.build(),
            Err(TopologyError::InterfaceConflict { interface, .. })
                if interface == "a-very-long-interface"
        ));
    }

    #[test]
    fn test_interface_names_are_scoped_per_node() {
        let mut builder = TopologyBuilder::new().with_shape(TopologyShape {
            routers: 0,
            switches: 1,
            hosts: 2,
        });
        builder
            .add_node(NodeDescriptor::switch("s1").unwrap())
            .unwrap();
        for (id, ip) in [("h1", "10.0.0.1/24"), ("h2", "10.0.0.2/24")] {
            builder
                .add_node(NodeDescriptor::host(id, cidr(ip), None).unwrap())
                .unwrap()
                .add_link_with(
                    id,
                    "s1",
                    LinkShaping::unshaped(),
                    LinkOverrides {
                        a: EndpointOverride {
                            interface_name: Some("eth0".to_string()),
                            address: None,
                        },
                        b: EndpointOverride::default(),
                    },
                )
                .unwrap();
        }

        let topology = builder.build().unwrap();
        for id in ["h1", "h2"] {
            let interface = topology.interfaces_of(id).next().unwrap();
            assert_eq!(interface.name, "eth0");
        }
    }
}
