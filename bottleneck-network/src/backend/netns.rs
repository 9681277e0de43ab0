//! Realizes the network with Linux network namespaces
//!
//! Every node gets its own namespace, named `<prefix>-<node id>`. Switches are a Linux bridge
//! (`br0`) living in their namespace, links are veth pairs created straight into the namespaces
//! of their endpoints, and shaping is installed with `tc` on both ends of a link. Everything is
//! driven through the `ip`, `tc` and `sysctl` command line tools, so the process needs
//! `CAP_NET_ADMIN` (or passwordless `sudo`, see [`NetnsConfig::use_sudo`]).

use crate::backend::{
    BackendError, BackendOperation, EmulationBackend, LinkHandle, NodeHandle, Resource,
};
use crate::network::ip::Ipv4Cidr;
use crate::network::node::{NodeDescriptor, NodeRole};
use crate::network::shaping::{LinkShaping, ShapingDiscipline, format_duration};
use crate::network::topology::Interface;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::net::Ipv4Addr;
use std::process::{Command, Output};
use tracing::{debug, info, warn};

const BRIDGE_NAME: &str = "br0";

/// Burst size of the token buckets, in bytes (ten full-sized frames)
const TOKEN_BUCKET_BURST_BYTES: u32 = 15_000;

#[derive(Debug, Clone)]
pub struct NetnsConfig {
    /// Prepended to every node id to name its namespace
    pub namespace_prefix: String,
    /// Run every command through `sudo -n`
    pub use_sudo: bool,
    /// Populate the ARP tables of all nodes once the network is up
    pub static_arp: bool,
}

impl Default for NetnsConfig {
    fn default() -> Self {
        Self {
            namespace_prefix: "bn".to_string(),
            use_sudo: false,
            static_arp: true,
        }
    }
}

pub fn namespace_name(prefix: &str, node_id: &str) -> String {
    format!("{prefix}-{node_id}")
}

/// A locally administered unicast MAC address, derived from a sequence number
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct MacAddr([u8; 6]);

impl MacAddr {
    fn from_sequence(n: u32) -> Self {
        let [a, b, c, d] = n.to_be_bytes();
        Self([0x02, 0x00, a, b, c, d])
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

struct NetnsInterface {
    name: String,
    address: Option<Ipv4Cidr>,
    mac: MacAddr,
    link: LinkHandle,
}

struct NetnsNode {
    namespace: String,
    role: NodeRole,
    interfaces: Vec<NetnsInterface>,
}

struct NetnsLink {
    /// The node and interface name of each end
    ends: [(NodeHandle, String); 2],
}

pub struct NetnsBackend {
    config: NetnsConfig,
    next_handle: u64,
    next_mac: u32,
    nodes: HashMap<NodeHandle, NetnsNode>,
    links: HashMap<LinkHandle, NetnsLink>,
}

impl NetnsBackend {
    pub fn new(config: NetnsConfig) -> Self {
        Self {
            config,
            next_handle: 0,
            next_mac: 1,
            nodes: HashMap::new(),
            links: HashMap::new(),
        }
    }

    fn next_handle(&mut self) -> u64 {
        let handle = self.next_handle;
        self.next_handle += 1;
        handle
    }

    fn next_mac(&mut self) -> MacAddr {
        let mac = MacAddr::from_sequence(self.next_mac);
        self.next_mac += 1;
        mac
    }

    fn node(
        &self,
        operation: BackendOperation,
        node: NodeHandle,
    ) -> Result<&NetnsNode, BackendError> {
        self.nodes.get(&node).ok_or_else(|| {
            BackendError::new(operation, format!("unknown {}", Resource::Node(node)))
        })
    }

    fn command(&self, program: &str, args: &[String]) -> Command {
        if self.config.use_sudo {
            let mut command = Command::new("sudo");
            command.arg("-n").arg(program).args(args);
            command
        } else {
            let mut command = Command::new(program);
            command.args(args);
            command
        }
    }

    /// Runs `program`, returning raw output
    fn run(
        &self,
        operation: BackendOperation,
        program: &str,
        args: &[String],
    ) -> Result<Output, BackendError> {
        let command_line = format!("{program} {}", args.join(" "));
        debug!(command = %command_line, "running");

        self.command(program, args).output().map_err(|e| {
            BackendError::new(operation, format!("failed to spawn `{command_line}`: {e}"))
        })
    }

    /// Runs `program`, failing with its stderr if it exits non-zero
    fn run_checked(
        &self,
        operation: BackendOperation,
        program: &str,
        args: &[String],
    ) -> Result<(), BackendError> {
        let output = self.run(operation, program, args)?;
        if !output.status.success() {
            return Err(BackendError::new(
                operation,
                format!(
                    "command failed: {program} {}\n{}",
                    args.join(" "),
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }

        Ok(())
    }

    /// Runs `ip -n <namespace> <args>`
    fn ip_in(
        &self,
        operation: BackendOperation,
        namespace: &str,
        args: &[&str],
    ) -> Result<(), BackendError> {
        let mut full_args = vec!["-n".to_string(), namespace.to_string()];
        full_args.extend(args.iter().map(|a| a.to_string()));
        self.run_checked(operation, "ip", &full_args)
    }

    /// Runs `ip netns exec <namespace> <program> <args>`
    fn exec_in(
        &self,
        operation: BackendOperation,
        namespace: &str,
        program: &str,
        args: &[String],
    ) -> Result<(), BackendError> {
        let mut full_args = vec![
            "netns".to_string(),
            "exec".to_string(),
            namespace.to_string(),
            program.to_string(),
        ];
        full_args.extend_from_slice(args);
        self.run_checked(operation, "ip", &full_args)
    }

    fn add_namespace(&self, node: &NodeDescriptor) -> Result<String, BackendError> {
        let operation = match node.role() {
            NodeRole::Switch => BackendOperation::CreateSwitch,
            NodeRole::Host | NodeRole::Router => BackendOperation::CreateNode,
        };
        let namespace = namespace_name(&self.config.namespace_prefix, node.id());

        if self.nodes.values().any(|n| n.namespace == namespace) {
            return Err(BackendError::new(
                operation,
                format!("namespace `{namespace}` is already in use"),
            ));
        }

        // Leftovers of an earlier run that was not shut down cleanly
        let stale = self.run(
            operation,
            "ip",
            &["netns".to_string(), "del".to_string(), namespace.clone()],
        )?;
        if stale.status.success() {
            warn!(namespace, "removed stale network namespace");
        }

        self.run_checked(
            operation,
            "ip",
            &["netns".to_string(), "add".to_string(), namespace.clone()],
        )?;

        let configured = self
            .ip_in(operation, &namespace, &["link", "set", "lo", "up"])
            .and_then(|_| {
                if node.role() != NodeRole::Switch {
                    return Ok(());
                }

                self.ip_in(operation, &namespace, &["link", "add", BRIDGE_NAME, "type", "bridge"])?;
                self.ip_in(operation, &namespace, &["link", "set", BRIDGE_NAME, "up"])
            });

        if let Err(e) = configured {
            self.delete_namespace_best_effort(&namespace);
            return Err(e);
        }

        debug!(node = &**node.id(), namespace, "created network namespace");
        Ok(namespace)
    }

    fn delete_namespace_best_effort(&self, namespace: &str) {
        let args = ["netns".to_string(), "del".to_string(), namespace.to_string()];
        if let Err(e) = self.run_checked(BackendOperation::Destroy, "ip", &args) {
            warn!(namespace, error = %e, "failed to clean up network namespace");
        }
    }

    fn insert_node(&mut self, node: &NodeDescriptor, namespace: String) -> NodeHandle {
        let handle = NodeHandle(self.next_handle());
        self.nodes.insert(
            handle,
            NetnsNode {
                namespace,
                role: node.role(),
                interfaces: Vec::new(),
            },
        );
        handle
    }

    /// Enslaves, addresses and raises one end of a freshly created veth pair
    fn configure_end(&self, node: &NetnsNode, interface: &Interface) -> Result<(), BackendError> {
        let operation = BackendOperation::CreateLink;
        let name = interface.name.as_str();

        if node.role == NodeRole::Switch {
            self.ip_in(operation, &node.namespace, &["link", "set", name, "master", BRIDGE_NAME])?;
        }

        if let Some(address) = interface.address {
            let address = address.to_string();
            self.ip_in(operation, &node.namespace, &["addr", "add", &address, "dev", name])?;
        }

        self.ip_in(operation, &node.namespace, &["link", "set", name, "up"])
    }

    /// Every addressed interface, ordered by node creation
    fn addressed_interfaces(&self) -> Vec<(&str, &str, Ipv4Cidr, MacAddr)> {
        let mut nodes: Vec<_> = self.nodes.iter().collect();
        nodes.sort_by_key(|(handle, _)| **handle);

        nodes
            .into_iter()
            .flat_map(|(_, node)| {
                node.interfaces.iter().filter_map(move |i| {
                    Some((node.namespace.as_str(), i.name.as_str(), i.address?, i.mac))
                })
            })
            .collect()
    }
}

/// `ip neigh` arguments, per namespace, pinning the MAC of every same-subnet interface of the other
/// nodes
///
/// Interfaces are `(namespace, name, address, mac)` tuples.
fn static_arp_entries(
    interfaces: &[(&str, &str, Ipv4Cidr, MacAddr)],
) -> Vec<(String, Vec<String>)> {
    let mut entries = Vec::new();
    for &(namespace, name, local_address, _) in interfaces {
        let neighbors = interfaces
            .iter()
            .filter(|(other_namespace, ..)| *other_namespace != namespace)
            .filter(|(_, _, remote_address, _)| local_address.contains(remote_address.address()));

        for &(_, _, remote_address, mac) in neighbors {
            entries.push((
                namespace.to_string(),
                neighbor_args(name, remote_address.address(), mac),
            ));
        }
    }

    entries
}

impl EmulationBackend for NetnsBackend {
    fn create_namespace_node(&mut self, node: &NodeDescriptor) -> Result<NodeHandle, BackendError> {
        let namespace = self.add_namespace(node)?;
        Ok(self.insert_node(node, namespace))
    }

    fn create_switch(&mut self, node: &NodeDescriptor) -> Result<NodeHandle, BackendError> {
        let namespace = self.add_namespace(node)?;
        Ok(self.insert_node(node, namespace))
    }

    fn create_virtual_link(
        &mut self,
        node_a: NodeHandle,
        interface_a: &Interface,
        node_b: NodeHandle,
        interface_b: &Interface,
    ) -> Result<LinkHandle, BackendError> {
        let operation = BackendOperation::CreateLink;
        let mac_a = self.next_mac();
        let mac_b = self.next_mac();

        let a = self.node(operation, node_a)?;
        let b = self.node(operation, node_b)?;
        let args = veth_args(
            (a.namespace.as_str(), interface_a.name.as_str(), mac_a),
            (b.namespace.as_str(), interface_b.name.as_str(), mac_b),
        );
        self.run_checked(operation, "ip", &args)?;

        let configured = self
            .configure_end(a, interface_a)
            .and_then(|_| self.configure_end(b, interface_b));
        if let Err(e) = configured {
            // Removing one end of a veth pair removes its peer too
            let cleanup = self.ip_in(
                BackendOperation::Destroy,
                &a.namespace,
                &["link", "del", &interface_a.name],
            );
            if let Err(cleanup) = cleanup {
                warn!(interface = %interface_a, error = %cleanup, "failed to clean up veth pair");
            }
            return Err(e);
        }

        let handle = LinkHandle(self.next_handle());
        for (node, interface, mac) in [(node_a, interface_a, mac_a), (node_b, interface_b, mac_b)] {
            if let Some(node) = self.nodes.get_mut(&node) {
                node.interfaces.push(NetnsInterface {
                    name: interface.name.clone(),
                    address: interface.address,
                    mac,
                    link: handle,
                });
            }
        }
        self.links.insert(
            handle,
            NetnsLink {
                ends: [
                    (node_a, interface_a.name.clone()),
                    (node_b, interface_b.name.clone()),
                ],
            },
        );

        debug!(a = %interface_a, b = %interface_b, "created veth pair");
        Ok(handle)
    }

    fn apply_shaping(
        &mut self,
        link: LinkHandle,
        shaping: &LinkShaping,
    ) -> Result<(), BackendError> {
        let operation = BackendOperation::ApplyShaping;
        let Some(netns_link) = self.links.get(&link) else {
            return Err(BackendError::new(
                operation,
                format!("unknown {}", Resource::Link(link)),
            ));
        };
        let ends = netns_link.ends.clone();

        for (node, interface) in &ends {
            let namespace = &self.node(operation, *node)?.namespace;

            // Drop earlier shaping, which fails harmlessly on a fresh interface
            let mut clear = vec!["netns".to_string(), "exec".to_string(), namespace.clone()];
            clear.extend(
                ["tc", "qdisc", "del", "dev", interface.as_str(), "root"].map(String::from),
            );
            self.run(operation, "ip", &clear)?;

            for args in shaping_commands(interface, shaping) {
                self.exec_in(operation, namespace, "tc", &args)?;
            }
        }

        if !shaping.is_unshaped() {
            info!(?link, %shaping, "link shaped");
        }
        Ok(())
    }

    fn set_forwarding(&mut self, node: NodeHandle, enabled: bool) -> Result<(), BackendError> {
        let operation = BackendOperation::SetForwarding;
        let namespace = &self.node(operation, node)?.namespace;
        let setting = format!("net.ipv4.ip_forward={}", u8::from(enabled));
        self.exec_in(operation, namespace, "sysctl", &["-w".to_string(), setting])
    }

    fn set_default_route(
        &mut self,
        node: NodeHandle,
        gateway: Ipv4Addr,
    ) -> Result<(), BackendError> {
        let operation = BackendOperation::SetDefaultRoute;
        let namespace = &self.node(operation, node)?.namespace;
        let gateway = gateway.to_string();
        self.ip_in(operation, namespace, &["route", "replace", "default", "via", &gateway])
    }

    fn network_ready(&mut self) -> Result<(), BackendError> {
        if !self.config.static_arp {
            return Ok(());
        }

        let entries = static_arp_entries(&self.addressed_interfaces());
        for (namespace, args) in &entries {
            let mut full_args = vec!["-n".to_string(), namespace.clone()];
            full_args.extend_from_slice(args);
            self.run_checked(BackendOperation::NetworkReady, "ip", &full_args)?;
        }

        info!(entries = entries.len(), "static arp entries installed");
        Ok(())
    }

    fn destroy(&mut self, resource: Resource) -> Result<(), BackendError> {
        let operation = BackendOperation::Destroy;
        match resource {
            Resource::Link(link) => {
                let Some(netns_link) = self.links.get(&link) else {
                    return Err(BackendError::new(operation, format!("unknown {resource}")));
                };
                let (node, interface) = &netns_link.ends[0];
                let namespace = &self.node(operation, *node)?.namespace;
                self.ip_in(operation, namespace, &["link", "del", interface])?;

                self.links.remove(&link);
                for node in self.nodes.values_mut() {
                    node.interfaces.retain(|i| i.link != link);
                }
            }
            Resource::Node(node) => {
                let namespace = self.node(operation, node)?.namespace.clone();
                self.run_checked(
                    operation,
                    "ip",
                    &["netns".to_string(), "del".to_string(), namespace],
                )?;
                self.nodes.remove(&node);
            }
        }

        Ok(())
    }
}

/// `ip link add` arguments creating a veth pair directly inside the namespaces of both ends
fn veth_args(a: (&str, &str, MacAddr), b: (&str, &str, MacAddr)) -> Vec<String> {
    let (namespace_a, name_a, mac_a) = a;
    let (namespace_b, name_b, mac_b) = b;
    let (mac_a, mac_b) = (mac_a.to_string(), mac_b.to_string());
    [
        "link",
        "add",
        name_a,
        "address",
        mac_a.as_str(),
        "netns",
        namespace_a,
        "type",
        "veth",
        "peer",
        "name",
        name_b,
        "address",
        mac_b.as_str(),
        "netns",
        namespace_b,
    ]
    .map(String::from)
    .to_vec()
}

fn neighbor_args(interface: &str, address: Ipv4Addr, mac: MacAddr) -> Vec<String> {
    let (address, mac) = (address.to_string(), mac.to_string());
    [
        "neigh",
        "replace",
        address.as_str(),
        "lladdr",
        mac.as_str(),
        "dev",
        interface,
        "nud",
        "permanent",
    ]
    .map(String::from)
    .to_vec()
}

/// The `tc` invocations realizing `shaping` on `interface`, assuming it has no root qdisc
///
/// The bandwidth is enforced by a token bucket at the root (either a plain TBF qdisc or an HTB
/// class), with a netem qdisc chained below it for delay, jitter, loss and the queue limit.
/// Without a bandwidth, netem sits at the root.
pub fn shaping_commands(interface: &str, shaping: &LinkShaping) -> Vec<Vec<String>> {
    let to_args = |args: &[&str]| args.iter().map(|a| a.to_string()).collect::<Vec<_>>();
    let mut commands = Vec::new();

    let netem_parent = match (shaping.bandwidth_mbps(), shaping.discipline()) {
        (Some(mbps), Some(ShapingDiscipline::TokenBucket)) => {
            let rate = format!("{mbps}mbit");
            let burst = TOKEN_BUCKET_BURST_BYTES.to_string();
            // Time to drain a full bucket at the configured rate
            let latency_ms = f64::from(TOKEN_BUCKET_BURST_BYTES) * 8.0 / 1000.0 / mbps;
            let latency = format!("{latency_ms}ms");
            commands.push(to_args(&[
                "qdisc", "add", "dev", interface, "root", "handle", "5:", "tbf", "rate", &rate,
                "burst", &burst, "latency", &latency,
            ]));
            Some("5:1")
        }
        (Some(mbps), Some(ShapingDiscipline::HierarchicalTokenBucket)) => {
            let rate = format!("{mbps}mbit");
            commands.push(to_args(&[
                "qdisc", "add", "dev", interface, "root", "handle", "5:0", "htb", "default", "1",
            ]));
            commands.push(to_args(&[
                "class", "add", "dev", interface, "parent", "5:0", "classid", "5:1", "htb", "rate",
                &rate, "burst", "15k",
            ]));
            Some("5:1")
        }
        _ => None,
    };

    let mut netem = Vec::new();
    if let Some(delay) = shaping.delay() {
        netem.extend(["delay".to_string(), format_duration(delay)]);
        if let Some(jitter) = shaping.jitter() {
            netem.push(format_duration(jitter));
        }
    }
    if shaping.loss_percent() > 0.0 {
        netem.extend(["loss".to_string(), format!("{}%", shaping.loss_percent())]);
    }
    if let Some(limit) = shaping.max_queue_packets() {
        netem.extend(["limit".to_string(), limit.to_string()]);
    }

    if !netem.is_empty() {
        let mut args = match netem_parent {
            Some(parent) => to_args(&["qdisc", "add", "dev", interface, "parent", parent]),
            None => to_args(&["qdisc", "add", "dev", interface, "root"]),
        };
        args.extend(to_args(&["handle", "10:", "netem"]));
        args.extend(netem);
        commands.push(args);
    }

    commands
}
