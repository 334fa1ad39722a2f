//! Flip Duel Server
//!
//! Runs the WebSocket match server with the in-memory custody ledger.

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use flip_duel::{
    game::rules::MatchRules,
    network::{auth::AuthConfig, server::{GameServer, ServerConfig}},
    settlement::{InMemoryCustody, SettlementBridge},
    VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ServerConfig::from_env();
    let auth = AuthConfig::from_env();
    let rules = MatchRules::from_env();
    rules.validate().context("invalid match rules")?;

    info!(version = VERSION, addr = %config.bind_addr, round_target = rules.round_target, "starting flip duel server");

    let custody = InMemoryCustody::new();
    let bridge = SettlementBridge::new(Arc::new(custody), rules.settlement_retry.call_timeout());
    let server = Arc::new(GameServer::new(config, auth, rules, bridge));

    let running = server.clone();
    let mut serve = tokio::spawn(async move { running.run().await });

    tokio::select! {
        result = &mut serve => {
            result.context("server task panicked")?.context("server failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
            server.shutdown();
            serve.await.context("server task panicked")?.context("server failed")?;
        }
    }

    Ok(())
}
