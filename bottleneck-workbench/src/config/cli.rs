use bottleneck_network::network::preset::BottleneckParams;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

/// Emulates a small routed network with a bandwidth bottleneck, using Linux network namespaces
#[derive(Parser, Debug, Clone)]
#[command(version)]
pub struct CliOpt {
    /// Path to the JSON file describing the network
    ///
    /// If not provided, the built-in bottleneck network is used, tuned by the `--bottleneck-*` and
    /// `--access-mbps` options
    #[arg(long)]
    pub topology: Option<PathBuf>,

    /// Bandwidth of the link between the router and the receiving subnet, in Mbps
    #[arg(long, default_value_t = 10.0)]
    pub bottleneck_mbps: f64,

    /// One-way delay of the bottleneck link, in milliseconds
    #[arg(long, default_value_t = 20)]
    pub bottleneck_delay_ms: u64,

    /// Packet loss of the bottleneck link, in percent
    #[arg(long, default_value_t = 0.0)]
    pub bottleneck_loss_percent: f64,

    /// The amount of packets the bottleneck link can buffer before dropping
    #[arg(long, default_value_t = 10_000)]
    pub bottleneck_queue_packets: u32,

    /// Bandwidth of the links between the senders and their switch, in Mbps
    #[arg(long, default_value_t = 100.0)]
    pub access_mbps: f64,

    /// Print the backend calls that a run would make, without touching the system
    #[arg(long)]
    pub dry_run: bool,

    /// Tear the network down right after it came up, instead of opening the interactive shell
    #[arg(long)]
    pub no_session: bool,

    /// Pre-populate the ARP tables of all nodes (the default)
    #[arg(long, overrides_with = "no_static_arp")]
    pub static_arp: bool,

    /// Let nodes resolve each other's MAC addresses through ARP
    #[arg(long, overrides_with = "static_arp")]
    pub no_static_arp: bool,

    /// Run every system command through `sudo -n`
    #[arg(long)]
    pub sudo: bool,

    /// Prefix of the network namespace names (one namespace per node, named `<prefix>-<node>`)
    #[arg(long, default_value = "bn")]
    pub namespace_prefix: String,

    /// Log filter, in `RUST_LOG` syntax (takes precedence over the `RUST_LOG` env variable)
    #[arg(long)]
    pub log_level: Option<String>,
}

impl CliOpt {
    pub fn use_static_arp(&self) -> bool {
        self.static_arp || !self.no_static_arp
    }

    pub fn bottleneck_params(&self) -> BottleneckParams {
        BottleneckParams {
            bottleneck_mbps: self.bottleneck_mbps,
            bottleneck_delay: Duration::from_millis(self.bottleneck_delay_ms),
            bottleneck_loss_percent: self.bottleneck_loss_percent,
            bottleneck_queue_packets: self.bottleneck_queue_packets,
            access_mbps: self.access_mbps,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_defaults_match_preset() {
        let options = CliOpt::parse_from(["bottleneck-workbench"]);
        assert_eq!(options.bottleneck_params(), BottleneckParams::default());
        assert!(options.use_static_arp());
        assert!(!options.dry_run);
        assert_eq!(options.namespace_prefix, "bn");
    }

    #[test]
    fn test_static_arp_flags() {
        let options = CliOpt::parse_from(["bottleneck-workbench", "--no-static-arp"]);
        assert!(!options.use_static_arp());

        let options =
            CliOpt::parse_from(["bottleneck-workbench", "--no-static-arp", "--static-arp"]);
        assert!(options.use_static_arp());
    }

    #[test]
    fn test_bottleneck_overrides() {
        let options = CliOpt::parse_from([
            "bottleneck-workbench",
            "--bottleneck-mbps",
            "5",
            "--bottleneck-delay-ms",
            "40",
            "--access-mbps",
            "1000",
        ]);
        let params = options.bottleneck_params();
        assert_eq!(params.bottleneck_mbps, 5.0);
        assert_eq!(params.bottleneck_delay, Duration::from_millis(40));
        assert_eq!(params.access_mbps, 1000.0);
    }
}
