//! SimpleWT Bots
//!
//! Connects `SIMPLEWT_BOTS` headless clients (default 4) that answer
//! challenges, wander and chat until Ctrl-C.

use std::sync::atomic::Ordering;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use simplewt::core::rng::ChallengeRng;
use simplewt::{Client, ClientConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let count: usize = std::env::var("SIMPLEWT_BOTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4);
    let config = ClientConfig::from_env();
    info!("Starting {} bots against {}", count, config.ws_addr);

    let mut bots = Vec::with_capacity(count);
    for i in 0..count {
        let name = format!("bot-{}", i);
        match Client::connect(&config, &name).await {
            Ok(client) => bots.push(client),
            Err(e) => warn!("{} failed to connect: {}", name, e),
        }
    }
    anyhow::ensure!(!bots.is_empty(), "no bot could connect");

    let mut rng = ChallengeRng::from_clock();
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut round = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                round += 1;
                for bot in bots.iter().filter(|b| b.session().is_active()) {
                    let dx = rng.next_int(3) as i8 - 1;
                    let dy = rng.next_int(3) as i8 - 1;
                    let _ = bot.step(dx, dy).await;
                    if rng.next_int(10) == 0 {
                        let _ = bot.chat(&format!("round {}", round)).await;
                    }
                }
                if round % 10 == 0 {
                    for bot in &bots {
                        let stats = bot.stats();
                        info!(
                            "{}: {} challenges, {} acks, {} remaining",
                            bot.name(),
                            stats.challenges.load(Ordering::Relaxed),
                            stats.acks.load(Ordering::Relaxed),
                            stats.remaining.load(Ordering::Relaxed)
                        );
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    for bot in &bots {
        bot.close().await;
    }
    info!("Bots stopped");
    Ok(())
}
