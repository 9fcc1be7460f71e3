//! SimpleWT Server
//!
//! Serves the login and stream endpoints until Ctrl-C.

use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use simplewt::{GameServer, ServerConfig, VERSION};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ServerConfig::from_env();
    info!("SimpleWT Server v{}", VERSION);
    info!("Login on {}, stream on {}", config.http_addr, config.ws_addr);
    info!("Movement policy: {:?}", config.world.movement);

    let server = GameServer::new(config);
    let listeners = server.bind().await?;

    let serve = server.serve(listeners);
    tokio::pin!(serve);

    tokio::select! {
        result = &mut serve => {
            if let Err(e) = &result {
                error!("Server stopped: {}", e);
            }
            result?;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
            server.shutdown();
        }
    }

    serve.await?;
    info!("Server stopped");
    Ok(())
}
