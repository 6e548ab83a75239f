use std::path::Path;

use anyhow::{Context, bail};
use clap::Parser;
use log::info;
use serde_json::Value;

use monerostack_rpc::{
    cli::{Cli, Commands},
    config::load_configuration,
    logging::init_logging,
    rpc::RpcKind,
};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_logging();
    let cli = Cli::parse();
    let config = load_configuration(Path::new(&cli.config_file))?;

    match cli.command {
        Commands::Call {
            method,
            params,
            kind,
            no_retry,
        } => {
            let params: Option<Value> = params
                .as_deref()
                .map(serde_json::from_str)
                .transpose()
                .context("--params is not valid JSON")?;
            let transport = config.transport_for(kind)?;

            let result = transport
                .call_with_options(&method, params.as_ref(), !no_retry)
                .await;
            if let Some(cache) = transport.manager().cache() {
                cache.shutdown().await;
            }
            println!("{}", serde_json::to_string_pretty(&result?)?);
            Ok(())
        },
        Commands::Nodes => {
            let transport = config.transport_for(RpcKind::Daemon)?;
            let status = transport.manager().status();
            println!("{}", serde_json::to_string_pretty(&status)?);
            Ok(())
        },
        Commands::Refresh => {
            let transport = config.transport_for(RpcKind::Daemon)?;
            let Some(cache) = transport.manager().cache() else {
                bail!("Node cache is disabled; enable daemon.use_node_cache or remove static_nodes");
            };

            info!("Refreshing node pool...");
            cache.force_refresh();
            cache.wait_for_refresh().await;

            println!("{}", serde_json::to_string_pretty(&transport.manager().status())?);
            Ok(())
        },
    }
}
