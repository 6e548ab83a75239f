use clap::{Parser, Subcommand};

use crate::rpc::RpcKind;

#[derive(Parser)]
#[command(name = "monerostack")]
#[command(about = "Resilient Monero JSON-RPC client", long_about = None)]
pub struct Cli {
    #[arg(
        short,
        long,
        help = "Path to the configuration file",
        default_value = "config/config.toml",
        global = true
    )]
    pub config_file: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute one JSON-RPC call and print its result
    Call {
        #[arg(help = "JSON-RPC method name, e.g. get_info")]
        method: String,
        #[arg(short, long, help = "Method parameters as a JSON object or array")]
        params: Option<String>,
        #[arg(short, long, help = "RPC server kind", default_value_t = RpcKind::Daemon)]
        kind: RpcKind,
        #[arg(long, help = "Fail on the first unreachable node instead of trying others")]
        no_retry: bool,
    },
    /// Print the known nodes and their health as JSON
    Nodes,
    /// Run a node discovery cycle now and print the resulting pool
    Refresh,
}
