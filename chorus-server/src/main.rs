use std::sync::Arc;

use chorus_core::{LocalBroadcast, Relay, CONNECTION_COUNT_KEY};
use chorus_server::{RedisBackbone, RelayServer, ServerConfig, ServerError};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    if let Err(e) = run().await {
        log::error!("{e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), ServerError> {
    let config = ServerConfig::from_env()?;

    let backbone = RedisBackbone::connect(&config.backbone_url).await?;
    let counter = backbone.counter(CONNECTION_COUNT_KEY);
    let local = Arc::new(LocalBroadcast::new(config.broadcast_capacity));
    let relay = Arc::new(Relay::new(
        config.relay_config(),
        Arc::new(counter),
        Arc::new(backbone),
        local.clone(),
    ));

    let fanout = relay.start().await?;
    if fanout.is_degraded() {
        log::warn!(
            "Running degraded, subscribed only to {:?}",
            fanout.subscribed()
        );
    }

    let server = RelayServer::new(config, relay, local);
    server.run().await?;
    drop(fanout);
    log::info!("Shutdown complete. Goodbye");
    Ok(())
}
