//! logos-sync-relay: standalone relay server.
//!
//! Usage: `logos-sync-relay [BIND_ADDR]`, or set `LOGOS_SYNC_BIND`.
//! Log verbosity follows `RUST_LOG`.

use logos_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("LOGOS_SYNC_BIND").ok())
    {
        config.bind_addr = addr;
    }

    let server = SyncServer::new(config);
    log::info!("Starting relay on {}", server.bind_addr());
    if let Err(e) = server.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
