//! Websocket accept loop.
//!
//! Every inbound TCP connection gets its own task running
//! [`SessionCoordinator::handle_connection`]; admission control happens in
//! there, so this loop never blocks on a slow client.

use std::sync::Arc;

use boardlink_types::BoardError;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::session::SessionCoordinator;

/// Listen on `listen_addr` until the shutdown signal fires.
pub async fn run(
    coordinator: Arc<SessionCoordinator>,
    listen_addr: &str,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), BoardError> {
    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|e| BoardError::Transport(format!("bind {listen_addr}: {e}")))?;
    info!(addr = listen_addr, "websocket server listening");

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!(%peer, "incoming connection");
                        let coordinator = Arc::clone(&coordinator);
                        tokio::spawn(async move {
                            if let Err(e) = coordinator.handle_connection(stream).await {
                                warn!(%peer, error = %e, "session ended abnormally");
                            }
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    info!("websocket server stopped");
    Ok(())
}
