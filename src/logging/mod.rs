pub mod structured_console_encoder;

use std::path::Path;
use std::sync::OnceLock;

use log::{debug, info};
use log4rs::{
    Config,
    config::{Deserializers, RawConfig},
};
use url::Url;

use crate::logging::structured_console_encoder::StructuredConsoleEncoderDeserializer;

const EXTERNAL_CONFIG: &str = "log4rs.yml";

/// Initializes logging from `log4rs.yml` in the working directory, or from
/// the embedded defaults when that file does not exist.
pub fn init_logging() {
    let mut deserializers = Deserializers::default();
    deserializers.insert("structured_console", StructuredConsoleEncoderDeserializer);

    let path = Path::new(EXTERNAL_CONFIG);
    if path.exists() {
        match log4rs::init_file(path, deserializers) {
            Ok(_) => {
                info!(path = EXTERNAL_CONFIG; "Logging initialized from external configuration");
                return;
            },
            Err(e) => {
                panic!("Failed to load external {}: {}", EXTERNAL_CONFIG, e);
            },
        }
    }

    let yaml_content = include_str!("../../resources/default_log4rs.yml");
    let raw_config: RawConfig =
        serde_yaml::from_str(yaml_content).expect("Embedded logging configuration is invalid YAML");

    let (appenders, errors) = raw_config.appenders_lossy(&deserializers);
    if !errors.is_empty() {
        panic!("Errors parsing embedded appenders: {:?}", errors);
    }

    let config = Config::builder()
        .appenders(appenders)
        .loggers(raw_config.loggers())
        .build(raw_config.root())
        .expect("Failed to build logging config");

    log4rs::init_config(config).expect("Failed to initialize logging from embedded config");

    debug!("Logging initialized from embedded defaults (no external log4rs.yml found)");
}

fn reveal_nodes() -> bool {
    static REVEAL_NODES_CACHE: OnceLock<bool> = OnceLock::new();

    *REVEAL_NODES_CACHE.get_or_init(|| {
        std::env::var("REVEAL_NODES")
            .map(|v| {
                let val = v.to_lowercase();
                val == "true" || val == "1"
            })
            .unwrap_or(false)
    })
}

/// Renders a node URL for logs.
///
/// Credentials are always stripped. Which node a client routes to is itself
/// sensitive, so unless `REVEAL_NODES` is set the host is masked as well.
pub fn redact_url(url: &str) -> String {
    redact_url_with(url, reveal_nodes())
}

fn redact_url_with(url: &str, reveal: bool) -> String {
    let Ok(mut parsed) = Url::parse(url) else {
        return "<invalid url>".to_string();
    };
    let _ = parsed.set_username("");
    let _ = parsed.set_password(None);

    if reveal {
        return parsed.to_string();
    }

    let host = parsed.host_str().unwrap_or_default();
    let masked = if host.len() <= 8 {
        "***".to_string()
    } else {
        format!("{}...{}", &host[..3], &host[host.len() - 3..])
    };
    match parsed.port() {
        Some(port) => format!("{}://{}:{}", parsed.scheme(), masked, port),
        None => format!("{}://{}", parsed.scheme(), masked),
    }
}
