//! Periodic registration with the upstream directory server.
//!
//! Every ~10 seconds the lobby announces its listening port with a 3-byte
//! record over a persistent TCP connection, reconnecting whenever the peer
//! goes away. The task runs for the server's lifetime and winds down when
//! the shutdown flag flips.

use log::{info, warn};
use shared::registration_frame;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::sleep;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

pub async fn run(directory_addr: String, lobby_port: u16, mut shutdown: watch::Receiver<bool>) {
    let frame = registration_frame(lobby_port);
    let mut stream: Option<TcpStream> = None;

    loop {
        if *shutdown.borrow() {
            break;
        }

        if stream.is_none() {
            match TcpStream::connect(&directory_addr).await {
                Ok(s) => {
                    info!("connected to directory server at {}", directory_addr);
                    stream = Some(s);
                }
                Err(e) => {
                    warn!("directory server unreachable at {}: {}", directory_addr, e);
                }
            }
        }

        if let Some(s) = stream.as_mut() {
            if let Err(e) = s.write_all(&frame).await {
                warn!("directory registration failed, will reconnect: {}", e);
                stream = None;
            }
        }

        tokio::select! {
            _ = sleep(HEARTBEAT_INTERVAL) => {}
            _ = shutdown.changed() => {}
        }
    }
    info!("heartbeat stopped");
}
