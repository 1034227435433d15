//! Standalone client binary.
//!
//! Usage:
//!   cargo run -p chat_client -- --name alice [--tcp-addr 127.0.0.1:12345] [--udp-addr 127.0.0.1:12346]
//!
//! Console commands:
//!   say <message>              - Broadcast a chat message
//!   dm <user> <message>        - Send a direct message
//!   users                      - List connected users
//!   topo                       - Request a topology snapshot
//!   ping [user]                - Ping the hub, or a specific user
//!   quit                       - Exit

use std::env;
use std::io::{BufRead, Write};
use std::sync::Arc;

use anyhow::Context;
use chat_client::{Client, CoreEvents};
use chat_shared::config::ChatConfig;
use chat_shared::topology::TopologySnapshot;
use tokio::sync::mpsc;
use tracing::info;

struct ConsoleEvents;

impl CoreEvents for ConsoleEvents {
    fn on_message(&self, user: &str, content: &str, time: &str) {
        println!("[{time}] <{user}> {content}");
    }

    fn on_direct_message(&self, user: &str, content: &str, time: &str, _is_direct: bool) {
        println!("[{time}] [dm from {user}] {content}");
    }

    fn on_user_join(&self, user: &str) {
        println!("* {user} joined");
    }

    fn on_user_leave(&self, user: &str) {
        println!("* {user} left");
    }

    fn on_user_list(&self, users: &[String]) {
        println!("users: {}", users.join(", "));
    }

    fn on_topology_data(&self, snapshot: &TopologySnapshot) {
        println!(
            "topology: {} nodes, {} edges",
            snapshot.nodes.len(),
            snapshot.edges.len()
        );
    }
}

struct Args {
    cfg: ChatConfig,
    name: String,
}

fn parse_args() -> Args {
    let mut cfg = ChatConfig::default();
    let mut name = String::new();
    let args: Vec<String> = env::args().collect();
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
            "--name" if i + 1 < args.len() => {
                name = args[i + 1].clone();
                i += 2;
            }
            _ => i += 1,
        }
    }
    Args { cfg, name }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let Args { cfg, name } = parse_args();
    anyhow::ensure!(!name.is_empty(), "pass --name <username>");

    info!(tcp = %cfg.tcp_addr, udp = %cfg.udp_addr, user = %name, "connecting");
    let client = Client::connect(&cfg, name, Arc::new(ConsoleEvents)).await.context("connect")?;
    println!("Connected as {}. Type 'quit' to exit.", client.user());

    let (console_tx, mut console_rx) = mpsc::channel::<String>(32);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        let mut stdout = std::io::stdout();
        loop {
            print!("] ");
            let _ = stdout.flush();
            let mut line = String::new();
            if stdin.lock().read_line(&mut line).is_err() {
                break;
            }
            let line = line.trim().to_string();
            if !line.is_empty() && console_tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    while let Some(line) = console_rx.recv().await {
        let mut parts = line.splitn(2, ' ');
        let cmd = parts.next().unwrap_or("");
        let rest = parts.next().unwrap_or("");
        match cmd {
            "say" => match client.send_chat(rest).await {
                Ok(true) => {}
                Ok(false) => println!("message could not be sent"),
                Err(err) => println!("error: {err}"),
            },
            "dm" => {
                let mut dm_parts = rest.splitn(2, ' ');
                match (dm_parts.next(), dm_parts.next()) {
                    (Some(user), Some(content)) => match client.send_direct(user, content).await {
                        Ok(true) => {}
                        Ok(false) => println!("message could not be sent"),
                        Err(err) => println!("error: {err}"),
                    },
                    _ => println!("usage: dm <user> <message>"),
                }
            }
            "users" => {
                if let Err(err) = client.request_users().await {
                    println!("error: {err}");
                }
            }
            "topo" => {
                if let Err(err) = client.request_topology().await {
                    println!("error: {err}");
                }
            }
            "ping" if rest.is_empty() => {
                if let Err(err) = client.ping_server().await {
                    println!("error: {err}");
                }
            }
            "ping" => {
                if let Err(err) = client.ping_user(rest).await {
                    println!("error: {err}");
                }
            }
            "quit" | "exit" => break,
            other => println!("unknown command: {other}"),
        }
    }

    Ok(())
}
