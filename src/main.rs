use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod command;
mod config;
mod connection;
mod rdb;
mod replication;
mod resp;
mod server;
mod state;
mod store;

use crate::config::Config;
use crate::replication::master::Master;
use crate::replication::replica::ReplicaClient;
use crate::replication::generate_replid;
use crate::state::{AppState, Role};
use crate::store::Store;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::parse();
    let store = Arc::new(Store::new());

    match rdb::load(&config.dbpath()) {
        Ok(rows) => {
            for row in rows {
                store.load_string(row.key, row.value.into(), row.expiry_ms);
            }
        }
        Err(err) => warn!(%err, "failed to load snapshot, starting with an empty store"),
    }

    let replid = generate_replid();
    let role = if let Some((host, port)) = config.replica_target() {
        let own_port = config.port;
        let replica_store = store.clone();
        tokio::spawn(async move {
            match ReplicaClient::handshake(&host, port, own_port).await {
                Ok((client, leftover)) => client.run(replica_store, leftover).await,
                Err(err) => warn!(%err, %host, port, "replication handshake with master failed"),
            }
        });
        Role::Replica
    } else {
        Role::Master(Arc::new(Master::new(replid.clone())))
    };

    let listener = match TcpListener::bind(("127.0.0.1", config.port)).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, port = config.port, "failed to bind listening socket");
            std::process::exit(1);
        }
    };
    info!(port = config.port, "listening");

    let state = Arc::new(AppState { store, config, replid, role });

    tokio::select! {
        _ = server::run(listener, state) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
    }

    Ok(())
}
