//! Newline-delimited JSON snapshot feed over TCP.
//!
//! Each connection receives the current snapshot immediately, then one line
//! per published snapshot until it disconnects.

use moe_core::{EngineHandle, Subscription};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

pub async fn serve(listener: TcpListener, engine: EngineHandle) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "snapshot feed listening");
    }
    loop {
        match listener.accept().await {
            Ok((socket, peer)) => {
                debug!(%peer, "subscriber connected");
                let sub = engine.subscribe();
                tokio::spawn(async move {
                    stream_snapshots(socket, sub).await;
                    debug!(%peer, "subscriber disconnected");
                });
            }
            Err(err) => warn!(error = %err, "accept failed"),
        }
    }
}

async fn stream_snapshots(mut socket: TcpStream, mut sub: Subscription) {
    while let Some(snapshot) = sub.recv().await {
        let mut line = match serde_json::to_vec(&snapshot) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "snapshot serialization failed");
                continue;
            }
        };
        line.push(b'\n');
        if socket.write_all(&line).await.is_err() {
            break;
        }
    }
}
