#![deny(clippy::all)]
#![warn(clippy::pedantic)]

//! # nexus-collab
//!
//! Terminal client for a collections backend: open a named collection, edit
//! its text, save it, run it, and watch the collection's live event log.
//!
//! ## Architecture
//!
//! ```text
//! main.rs     — entry point, config loading, tracing setup
//! config.rs   — CLI / env / TOML configuration
//! client.rs   — HTTP client for /api/collections*, /api/run
//! channel.rs  — push channel (/ws?room=<name>) to text log
//! sync.rs     — document + status, fire-and-forget load/save/run
//! session.rs  — active collection lifecycle (switch, close, drop)
//! console.rs  — stdio command loop
//! ```
//!
//! Logs go to stderr; stdout carries the console.

use clap::Parser;
use tracing::info;

use nexus_collab::config::{self, Cli, Command};
use nexus_collab::{console, CollectionSession};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let resolved = match config::load_config(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("nexus-collab: configuration error: {e}");
            std::process::exit(1);
        }
    };

    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| resolved.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(log_filter)
        .with_writer(std::io::stderr)
        .init();

    info!(
        "nexus-collab v{} using backend {}",
        env!("CARGO_PKG_VERSION"),
        resolved.address
    );

    let mut session = match CollectionSession::from_config(&resolved) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("nexus-collab: cannot build HTTP client: {e}");
            std::process::exit(1);
        }
    };

    match cli.command {
        Some(Command::List) => match session.list_collections().await {
            Ok(names) => {
                for name in names {
                    println!("{name}");
                }
            }
            Err(e) => {
                eprintln!("nexus-collab: {e}");
                std::process::exit(1);
            }
        },
        Some(Command::Open { name }) => {
            session.activate(Some(&name));
            console::run_stdio(session).await;
        }
        None => console::run_stdio(session).await,
    }
}
