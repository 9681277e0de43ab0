use bottleneck_network::backend::netns::namespace_name;
use bottleneck_network::network::node::NodeRole;
use bottleneck_network::network::topology::Topology;
use bottleneck_network::session::{InteractiveSession, RunningNetwork, SessionError};
use std::io::{BufRead, Write};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const PROMPT: &str = "bottleneck> ";

const HELP: &str = "\
Commands:
  nodes              list the nodes of the network
  links              list the links and their shaping
  pingall            ping every host from every other host
  <node> <cmd...>    run a command inside the node's namespace (e.g. `tx1 ping 10.1.0.252`)
  exit               tear the network down and quit (same as EOF)";

#[derive(Debug, PartialEq, Eq)]
enum ShellCommand {
    Empty,
    Help,
    Nodes,
    Links,
    PingAll,
    Exit,
    Run { node: String, command: Vec<String> },
    Unknown(String),
}

impl ShellCommand {
    fn parse(line: &str, topology: &Topology) -> Self {
        let mut words = line.split_whitespace();
        let Some(first) = words.next() else {
            return ShellCommand::Empty;
        };

        match first {
            "help" | "?" => ShellCommand::Help,
            "nodes" => ShellCommand::Nodes,
            "links" => ShellCommand::Links,
            "pingall" => ShellCommand::PingAll,
            "exit" | "quit" => ShellCommand::Exit,
            node if topology.node(node).is_some() => {
                let command: Vec<_> = words.map(String::from).collect();
                if command.is_empty() {
                    ShellCommand::Unknown(format!("missing command to run on `{node}`"))
                } else {
                    ShellCommand::Run {
                        node: node.to_string(),
                        command,
                    }
                }
            }
            other => ShellCommand::Unknown(format!("unknown command or node `{other}`")),
        }
    }
}

/// Keeps Ctrl-C from killing the workbench, so the network always gets torn down
///
/// The foreground command of the shell shares our process group and still receives the signal,
/// which is how an operator stops e.g. a running `ping`. The returned flag records that an
/// interrupt happened.
pub fn install_interrupt_handler() -> Result<Arc<AtomicBool>, ctrlc::Error> {
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))?;
    Ok(interrupted)
}

/// A line-based shell to poke at the running network
pub struct NetnsShell<R, W> {
    namespace_prefix: String,
    use_sudo: bool,
    input: R,
    output: W,
    interrupted: Arc<AtomicBool>,
}

impl<R: BufRead, W: Write> NetnsShell<R, W> {
    pub fn new(
        namespace_prefix: String,
        use_sudo: bool,
        input: R,
        output: W,
        interrupted: Arc<AtomicBool>,
    ) -> Self {
        Self {
            namespace_prefix,
            use_sudo,
            input,
            output,
            interrupted,
        }
    }

    /// Reports (and clears) an interrupt received since the last check
    fn take_interrupt(&mut self) -> std::io::Result<bool> {
        let interrupted = self.interrupted.swap(false, Ordering::SeqCst);
        if interrupted {
            writeln!(self.output, "Interrupt")?;
        }

        Ok(interrupted)
    }

    fn command_in(&self, node: &str, program: &str) -> Command {
        let namespace = namespace_name(&self.namespace_prefix, node);
        let mut command = if self.use_sudo {
            let mut command = Command::new("sudo");
            command.args(["-n", "ip"]);
            command
        } else {
            Command::new("ip")
        };
        command.args(["netns", "exec", namespace.as_str(), program]);
        command
    }

    fn print_nodes(&mut self, topology: &Topology) -> std::io::Result<()> {
        for node in topology.nodes() {
            let addresses: Vec<_> = node.addresses().iter().map(|a| a.to_string()).collect();
            write!(self.output, "* {} ({})", node.id(), node.role())?;
            if !addresses.is_empty() {
                write!(self.output, ": {}", addresses.join(", "))?;
            }
            if let Some(gateway) = node.default_route() {
                write!(self.output, ", default via {gateway}")?;
            }
            writeln!(self.output)?;
        }

        Ok(())
    }

    fn print_links(&mut self, topology: &Topology) -> std::io::Result<()> {
        for link in topology.links() {
            writeln!(self.output, "* {} <-> {} [{}]", link.a, link.b, link.shaping)?;
        }

        Ok(())
    }

    fn run_in_node(&mut self, node: &str, command: &[String]) -> Result<(), SessionError> {
        let (program, args) = match command {
            [program, args @ ..] => (program, args),
            [] => return Ok(()),
        };

        let status = self
            .command_in(node, program)
            .args(args)
            .stdin(Stdio::null())
            .status()?;
        if !self.take_interrupt()? && !status.success() {
            writeln!(self.output, "{program} exited with {status}")?;
        }

        Ok(())
    }

    fn ping_all(&mut self, topology: &Topology) -> Result<(), SessionError> {
        let hosts: Vec<_> = topology
            .nodes()
            .filter(|n| n.role() == NodeRole::Host)
            .filter_map(|n| Some((n.id().clone(), n.addresses().first()?.address())))
            .collect();

        writeln!(self.output, "*** Ping: testing ping reachability")?;
        let mut sent = 0;
        let mut received = 0;
        for (source, _) in &hosts {
            write!(self.output, "{source} ->")?;
            for (target, address) in hosts.iter().filter(|(target, _)| target != source) {
                let address = address.to_string();
                let reply = self
                    .command_in(source, "ping")
                    .args(["-c", "1", "-W", "1", address.as_str()])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()?;

                sent += 1;
                if reply.success() {
                    received += 1;
                    write!(self.output, " {target}")?;
                } else {
                    write!(self.output, " X")?;
                }
                self.output.flush()?;
            }
            writeln!(self.output)?;
        }

        let dropped = if sent == 0 {
            0
        } else {
            (sent - received) * 100 / sent
        };
        writeln!(
            self.output,
            "*** Results: {dropped}% dropped ({received}/{sent} received)"
        )?;
        Ok(())
    }
}

impl<R: BufRead, W: Write> InteractiveSession for NetnsShell<R, W> {
    fn enter_interactive(&mut self, network: &RunningNetwork<'_>) -> Result<(), SessionError> {
        let topology = network.topology;
        writeln!(self.output, "Network is up. Type `help` for the available commands.")?;

        let mut line = String::new();
        loop {
            write!(self.output, "{PROMPT}")?;
            self.output.flush()?;

            line.clear();
            let read = self.input.read_line(&mut line)?;
            if self.take_interrupt()? {
                continue;
            }
            if read == 0 {
                writeln!(self.output)?;
                return Ok(());
            }

            match ShellCommand::parse(&line, topology) {
                ShellCommand::Empty => {}
                ShellCommand::Help => writeln!(self.output, "{HELP}")?,
                ShellCommand::Nodes => self.print_nodes(topology)?,
                ShellCommand::Links => self.print_links(topology)?,
                ShellCommand::PingAll => self.ping_all(topology)?,
                ShellCommand::Exit => return Ok(()),
                ShellCommand::Run { node, command } => self.run_in_node(&node, &command)?,
                ShellCommand::Unknown(message) => writeln!(self.output, "{message}")?,
            }
        }
    }
}
