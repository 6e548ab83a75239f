use std::{fs, fs::File, io::Write, path::Path};

use anyhow::{Context, Result};
use config::{Config, Environment};
use log::info;

use super::ClientConfig;

pub fn get_default_config() -> &'static str {
    include_str!("../../config/config.toml")
}

/// Loads the configuration file at `path`, creating it from the defaults when
/// it does not exist. `MONEROSTACK_*` environment variables take precedence,
/// with `__` separating nested keys (`MONEROSTACK_NODE_CACHE__TTL_SECS`).
pub fn load_configuration(path: &Path) -> Result<ClientConfig> {
    if !path.exists() {
        let sources = get_default_config();
        write_config_to(path, sources).context("Could not create default config")?;
        info!(path:% = path.display(); "Created new configuration file");
    }

    let filename = path.to_str().context("Invalid config file path")?;

    let cfg = Config::builder()
        .add_source(config::File::with_name(filename))
        .add_source(
            Environment::with_prefix("MONEROSTACK")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Could not build config")?;

    cfg.try_deserialize().context("Invalid configuration")
}

pub fn write_config_to(path: &Path, source: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create parent directories")?;
    };

    let mut file = File::create(path).context("Failed to create config file")?;
    file.write_all(source.as_bytes())
        .context("Failed to write config content")?;
    file.write_all(b"\n").context("Failed to write newline")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{nodes::Network, rpc::RpcKind};
    use std::time::Duration;

    #[test]
    fn test_missing_file_is_created_from_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = load_configuration(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.network, Network::Mainnet);
        assert!(config.daemon.use_node_cache);
        assert_eq!(config.node_cache.ttl_secs, 3600);
        assert_eq!(config.node_cache.keep_top, 10);
        assert!(config.static_nodes.is_empty());

        let wallet = config.wallet.to_endpoint(RpcKind::Wallet).unwrap();
        assert_eq!(wallet.rpc_url(), "http://127.0.0.1:18082/json_rpc");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        write_config_to(
            &path,
            r#"
network = "testnet"

[wallet]
host = "10.0.0.2"
timeout_secs = 60

[[static_nodes]]
name = "Home"
url = "http://10.0.0.3:28081/json_rpc"
is_local = true
"#,
        )
        .unwrap();

        let config = load_configuration(&path).unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.node_cache.probe_workers, 8);
        assert_eq!(config.static_nodes.len(), 1);
        assert_eq!(config.static_nodes[0].priority, 1);

        let wallet = config.wallet.to_endpoint(RpcKind::Wallet).unwrap();
        assert_eq!(wallet.base_url(), "http://10.0.0.2:18082");
        assert_eq!(wallet.timeout(), Duration::from_secs(60));
    }
}
