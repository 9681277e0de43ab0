mod config;
mod shell;

use crate::config::cli::CliOpt;
use crate::shell::{NetnsShell, install_interrupt_handler};
use anyhow::Context;
use bottleneck_network::backend::EmulationBackend;
use bottleneck_network::backend::netns::{NetnsBackend, NetnsConfig};
use bottleneck_network::backend::recording::RecordingBackend;
use bottleneck_network::network::topology::{ParallelLinks, Topology};
use bottleneck_network::orchestrator::{OrchestratorError, StopReport};
use bottleneck_network::session::{InteractiveSession, NoSession};
use clap::Parser;
use std::io;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let options = CliOpt::parse();
    init_logging(options.log_level.as_deref());

    match run(&options) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:?}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(log_level: Option<&str>) {
    let filter = match log_level {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn run(options: &CliOpt) -> anyhow::Result<()> {
    println!("--- Params ---");
    match &options.topology {
        Some(path) => println!("* Topology path: {}", path.display()),
        None => {
            let params = options.bottleneck_params();
            println!("* Topology: built-in bottleneck network");
            println!(
                "* Bottleneck: {} Mbps, {}ms delay, {}% loss, queue {} packets",
                params.bottleneck_mbps,
                params.bottleneck_delay.as_millis(),
                params.bottleneck_loss_percent,
                params.bottleneck_queue_packets
            );
            println!("* Access links: {} Mbps", params.access_mbps);
        }
    }

    let spec = config::load_network_spec(options)?;

    if options.dry_run {
        info!("dry run, backend calls are recorded instead of executed");
        let backend = RecordingBackend::new();
        let log = backend.log();
        let topology = build_topology(spec, &backend)?;
        print_topology(&topology);

        let result = bottleneck_network::run(topology, backend, &mut NoSession);

        println!("--- Planned backend calls ---");
        for call in log.snapshot() {
            println!("* {call}");
        }

        return report(result);
    }

    println!("* Namespace prefix: {}", options.namespace_prefix);
    println!("* Static ARP: {}", options.use_static_arp());

    let backend = NetnsBackend::new(NetnsConfig {
        namespace_prefix: options.namespace_prefix.clone(),
        use_sudo: options.sudo,
        static_arp: options.use_static_arp(),
    });
    let topology = build_topology(spec, &backend)?;
    print_topology(&topology);

    // From here on, Ctrl-C must not skip the teardown
    let interrupted =
        install_interrupt_handler().context("failed to install the Ctrl-C handler")?;

    let mut session: Box<dyn InteractiveSession> = if options.no_session {
        Box::new(NoSession)
    } else {
        Box::new(NetnsShell::new(
            options.namespace_prefix.clone(),
            options.sudo,
            io::stdin().lock(),
            io::stdout(),
            interrupted,
        ))
    };

    let result = bottleneck_network::run(topology, backend, &mut *session);
    report(result)
}

fn build_topology<B: EmulationBackend>(
    spec: bottleneck_network::network::spec::NetworkSpec,
    backend: &B,
) -> anyhow::Result<Topology> {
    let parallel_links = if backend.supports_parallel_links() {
        ParallelLinks::Allow
    } else {
        ParallelLinks::Forbid
    };

    Topology::from_spec(spec, parallel_links).context("invalid network topology")
}

fn print_topology(topology: &Topology) {
    println!("--- Topology ---");
    for node in topology.nodes() {
        println!("* {} ({})", node.id(), node.role());
        for interface in topology.interfaces_of(node.id()) {
            match interface.address {
                Some(address) => println!("  * {}: {address}", interface.name),
                None => println!("  * {}", interface.name),
            }
        }
    }

    println!("--- Links ---");
    for link in topology.links() {
        println!("* {} <-> {}: {}", link.a.name, link.b.name, link.shaping);
    }
}

fn report(result: Result<StopReport, OrchestratorError>) -> anyhow::Result<()> {
    println!("--- Teardown ---");
    match result {
        Ok(report) => {
            for warning in &report.warnings {
                println!("* Warning: {warning}");
            }
            println!("* Network stopped cleanly");
            Ok(())
        }
        Err(OrchestratorError::StartFailed {
            error,
            rollback_errors,
        }) => {
            for rollback_error in &rollback_errors {
                println!("* Rollback error: {rollback_error}");
            }
            Err(error).context("failed to start the network")
        }
        Err(OrchestratorError::TeardownFailed { errors, warnings }) => {
            for warning in &warnings {
                println!("* Warning: {warning}");
            }
            for error in &errors {
                println!("* Error: {error}");
            }
            anyhow::bail!("{} resource(s) could not be released", errors.len())
        }
        Err(e) => Err(e.into()),
    }
}
