use crate::config::cli::CliOpt;
use crate::config::network::NetworkSpecJson;
use anyhow::Context;
use bottleneck_network::network::spec::NetworkSpec;
use std::fs;

pub mod cli;
pub mod network;

/// The network described by the `--topology` file, or the tuned bottleneck preset
pub fn load_network_spec(options: &CliOpt) -> anyhow::Result<NetworkSpec> {
    let Some(path) = &options.topology else {
        return Ok(options.bottleneck_params().spec());
    };

    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read topology file `{}`", path.display()))?;
    let spec: NetworkSpecJson = serde_json::from_str(&json)
        .with_context(|| format!("invalid topology file `{}`", path.display()))?;
    Ok(spec.into())
}
