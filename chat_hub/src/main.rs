//! Standalone hub binary.
//!
//! Usage:
//!   cargo run -p chat_hub -- [--tcp-addr 0.0.0.0:12345] [--udp-addr 0.0.0.0:12346] [--config cfg.json]
//!
//! Listens for TCP control connections and UDP message-plane traffic,
//! relaying chat, direct messages, pings, and topology queries between
//! connected users.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use chat_hub::Hub;
use chat_shared::config::ChatConfig;
use tracing::info;

fn parse_args() -> anyhow::Result<ChatConfig> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = ChatConfig::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--tcp-addr" if i + 1 < args.len() => {
                cfg.tcp_addr = args[i + 1].clone();
                i += 2;
            }
            "--udp-addr" if i + 1 < args.len() => {
                cfg.udp_addr = args[i + 1].clone();
                i += 2;
            }
            "--config" if i + 1 < args.len() => {
                let text = std::fs::read_to_string(&args[i + 1])
                    .with_context(|| format!("read config file {}", args[i + 1]))?;
                cfg = ChatConfig::from_json_str(&text).context("parse config file")?;
                i += 2;
            }
            _ => i += 1,
        }
    }
    Ok(cfg)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cfg = parse_args()?;
    info!(tcp_addr = %cfg.tcp_addr, udp_addr = %cfg.udp_addr, "starting hub");

    let hub = Arc::new(Hub::bind(cfg).await.context("bind hub")?);
    info!(
        tcp = %hub.local_tcp_addr()?,
        udp = %hub.local_udp_addr()?,
        "hub listening"
    );

    hub.run().await
}
