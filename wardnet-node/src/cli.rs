//! Layered configuration: a base TOML file, overridden by `WARDNET_`-prefixed
//! environment variables, overridden by explicit CLI flags. Invalid or
//! missing required fields fail fast, before any socket opens.

use clap::Parser;
use wardnet_common::{ClusterConfig, NodeId};

#[derive(Debug, Parser)]
#[command(name = "wardnet-node", about = "Runs one node of the wardnet coordination cluster")]
pub struct Cli {
    /// Path to the base TOML configuration file.
    #[arg(long, default_value = "wardnet.toml")]
    pub config: String,

    /// Overrides `node_id` from the config file/environment.
    #[arg(long)]
    pub node_id: Option<NodeId>,
}

impl Cli {
    /// Builds the layered configuration: `self.config` file, then
    /// `WARDNET_*` environment variables, then this process's own flags.
    pub fn load_config(&self) -> anyhow::Result<ClusterConfig> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name(&self.config).required(false))
            .add_source(config::Environment::with_prefix("WARDNET").separator("__"));

        if let Some(node_id) = self.node_id {
            builder = builder.set_override("node_id", node_id as i64)?;
        }

        let settings = builder.build()?;
        let cluster_config: ClusterConfig = settings
            .try_deserialize()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

        cluster_config
            .validate()
            .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;

        Ok(cluster_config)
    }
}
