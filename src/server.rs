//! Accept loop (C5 entry point): one spawned session per accepted socket.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::connection::Connection;
use crate::state::AppState;

pub async fn run(listener: TcpListener, state: Arc<AppState>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "failed to accept connection");
                continue;
            }
        };

        info!(addr = %peer, "accepted connection");
        let state = state.clone();
        tokio::spawn(async move {
            if let Err(err) = Connection::new(stream, peer).handle(state).await {
                warn!(addr = %peer, %err, "connection ended with an error");
            }
        });
    }
}
