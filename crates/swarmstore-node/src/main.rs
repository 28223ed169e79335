// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::{net::SocketAddr, path::PathBuf, time::Instant};

use clap::{Parser, Subcommand};
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use swarmstore_core::{
    http, message::now_ms, single_node_snapshot, MessageStore, MonitorRegistry, NetworkParams,
    NodeConfig, NodeRecord, RedirectForwarder, RequestHandler, SwarmRouter, CLEANUP_PERIOD,
    SESSION_PREFIX,
};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "swarmstore")]
#[command(about = "Per-account store-and-forward storage node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a fresh account keypair and print its session id.
    GenAccount,
    /// Run the node.
    Start {
        #[arg(long, default_value = "swarmstore.db")]
        db: PathBuf,
        #[arg(long, default_value = "0.0.0.0:22021")]
        bind: SocketAddr,
        /// Use testnet account prefixes instead of mainnet.
        #[arg(long)]
        testnet: bool,
        #[arg(long, default_value_t = 19)]
        hardfork: u16,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::GenAccount => {
            let key = SigningKey::generate(&mut OsRng);
            let session_key = key.verifying_key().to_montgomery().to_bytes();
            println!("private_key: {}", hex::encode(key.to_bytes()));
            println!(
                "ed25519_pubkey: {}",
                hex::encode(key.verifying_key().to_bytes())
            );
            println!(
                "account: {:02x}{}",
                SESSION_PREFIX,
                hex::encode(session_key)
            );
        }
        Command::Start {
            db,
            bind,
            testnet,
            hardfork,
        } => {
            let config = NodeConfig {
                db_path: db,
                network: if testnet {
                    NetworkParams::testnet()
                } else {
                    NetworkParams::mainnet()
                },
                bind_http: Some(bind),
                hardfork,
                ..NodeConfig::default()
            };
            run(config).await?;
        }
    }
    Ok(())
}

async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let store = MessageStore::open_with_limit(&config.db_path, config.page_limit)?;
    // Until a membership oracle is wired in, the node owns a single swarm
    // containing only itself.
    let router = SwarmRouter::new(single_node_snapshot(NodeRecord {
        address: "127.0.0.1".into(),
        port: config.bind_http.map(|addr| addr.port()).unwrap_or(22_021),
        pubkey: [0u8; 32],
    }));
    let monitors = MonitorRegistry::new();
    let handler = RequestHandler::new(
        &config,
        store.clone(),
        router,
        monitors.clone(),
        std::sync::Arc::new(RedirectForwarder),
    );

    // Expired rows and stale subscriptions are reaped on a fixed cadence.
    let cleanup_store = store.clone();
    let cleanup_monitors = monitors.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_PERIOD);
        loop {
            ticker.tick().await;
            if let Err(err) = cleanup_store.clean_expired(now_ms()).await {
                tracing::warn!(error = %err, "expiry cleanup failed");
            }
            cleanup_monitors.prune_expired(Instant::now());
        }
    });

    let bind = config.bind_http.expect("start requires a bind address");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, db = %config.db_path.display(), "storage node listening");
    axum::serve(
        listener,
        http::router(handler).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}
