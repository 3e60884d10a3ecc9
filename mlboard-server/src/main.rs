//! mlboard relay server binary.
//!
//! Usage: `mlboard-server [config.json]`. Without a config file the defaults
//! apply (in-memory event storage, checkpoints under `mlboard_data/`).
//! Log level follows `RUST_LOG`, `info` by default.

use log::{error, info};
use mlboard_relay::server::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match std::env::args().nth(1) {
        Some(path) => match ServerConfig::from_json_file(&path) {
            Ok(config) => {
                info!("Loaded configuration from {path}");
                config
            }
            Err(e) => {
                error!("{e}");
                std::process::exit(2);
            }
        },
        None => ServerConfig::default(),
    };

    match &config.storage_path {
        Some(path) => info!("Event storage: RocksDB at {}", path.display()),
        None => info!("Event storage: in-memory"),
    }
    info!("Checkpoints: {}", config.checkpoint_dir.display());

    let server = match RelayServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open event storage: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("Relay server stopped: {e}");
        std::process::exit(1);
    }
}
