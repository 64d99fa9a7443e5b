//! Server composition root: listener, accept loop, and packet dispatch.
//!
//! All cross-connection state lives in two independent mutex domains, the
//! connection registry and the machine table. No code path acquires one
//! while holding the other; operations that need both (machine teardown
//! with its broadcasts, the disconnect path) fully release the first lock
//! before taking the second.

use crate::bans::BanRegistry;
use crate::connection::{self, Connection};
use crate::heartbeat;
use crate::machines::{EngageOutcome, MachineTable};
use crate::registry::ConnectionRegistry;
use log::{debug, error, info, warn};
use shared::Packet;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// How often the accept loop wakes to prune disconnected handles even when
/// nobody is connecting.
const PRUNE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// host:port to listen on; port 0 picks an ephemeral port.
    pub bind_addr: String,
    pub lobby_name: String,
    pub max_players: u32,
    /// Directory server to register with; None disables the heartbeat.
    pub directory_addr: Option<String>,
}

pub struct LobbyServer {
    registry: Mutex<ConnectionRegistry>,
    machines: Mutex<MachineTable>,
    bans: BanRegistry,
    listener: std::sync::Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    directory_addr: Option<String>,
    shutdown_tx: watch::Sender<bool>,
}

impl LobbyServer {
    pub async fn new(config: ServerConfig, bans: BanRegistry) -> Result<Arc<Self>, BoxError> {
        let listener = TcpListener::bind(&config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, _) = watch::channel(false);

        info!(
            "lobby '{}' listening on {} ({} max slots, {} ban entries)",
            config.lobby_name,
            local_addr,
            config.max_players,
            bans.len()
        );

        Ok(Arc::new(LobbyServer {
            registry: Mutex::new(ConnectionRegistry::new(&config.lobby_name, config.max_players)),
            machines: Mutex::new(MachineTable::new()),
            bans,
            listener: std::sync::Mutex::new(Some(listener)),
            local_addr,
            directory_addr: config.directory_addr,
            shutdown_tx,
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Asks every background loop to wind down; `run` returns shortly after.
    pub fn close(&self) {
        self.shutdown_tx.send_replace(true);
    }

    /// Serves until `close` is called or the accept loop hits a fatal
    /// fault. Either way every live connection is kicked with the reason
    /// before this returns, and the heartbeat task is joined.
    pub async fn run(self: Arc<Self>) -> Result<(), BoxError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or("server is already running")?;

        let heartbeat_handle = self.directory_addr.clone().map(|addr| {
            tokio::spawn(heartbeat::run(
                addr,
                self.local_addr.port(),
                self.shutdown_tx.subscribe(),
            ))
        });

        let result = self.accept_loop(listener).await;
        self.shutdown_tx.send_replace(true);

        let reason = match &result {
            Ok(()) => "Server closed".to_string(),
            Err(e) => {
                error!("fatal server error: {}", e);
                format!("Internal server error: {}", e)
            }
        };
        self.registry.lock().await.kick_all(&reason);

        if let Some(handle) = heartbeat_handle {
            let _ = handle.await;
        }
        info!("server closed");
        result
    }

    async fn accept_loop(self: &Arc<Self>, listener: TcpListener) -> Result<(), BoxError> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut prune = tokio::time::interval(PRUNE_INTERVAL);
        prune.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                res = listener.accept() => {
                    match res {
                        Ok((stream, addr)) => {
                            info!("new connection from {}", addr);
                            self.spawn_connection(stream, addr).await;
                        }
                        // Aborted handshakes and fd pressure come and go;
                        // the listener itself is still healthy.
                        Err(e) => warn!("accept failed: {}", e),
                    }
                }
                _ = prune.tick() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
            self.registry.lock().await.remove_disconnected();
        }
        Ok(())
    }

    /// Wraps an accepted socket in a Connection handle, registers it, and
    /// starts its reader and writer tasks.
    async fn spawn_connection(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let (conn, outbound_rx) = Connection::new(addr);
        self.registry.lock().await.add(conn.clone());

        let (read_half, write_half) = stream.into_split();
        let writer = tokio::spawn(connection::write_loop(write_half, outbound_rx));

        let server = Arc::clone(self);
        tokio::spawn(async move {
            let reason = server.read_loop(read_half, &conn).await;
            conn.close();
            server.disconnect(&conn, &reason).await;
            let _ = writer.await;
        });
    }

    /// Decodes packets until the transport goes away or the connection is
    /// closed; returns the human-readable departure reason used in the
    /// lobby chat notice. The close watch wakes this even when the peer
    /// never sends another byte, so a kicked connection cannot leave its
    /// reader task and socket behind.
    async fn read_loop<R: AsyncRead + Unpin>(&self, mut reader: R, conn: &Connection) -> String {
        let mut closed = conn.watch_closed();
        loop {
            if !conn.is_connected() {
                return "was kicked".to_string();
            }
            tokio::select! {
                biased;
                _ = closed.changed() => {
                    return "was kicked".to_string();
                }
                res = connection::read_packet(&mut reader) => match res {
                    Ok(packet) => self.dispatch(conn, packet).await,
                    Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                        return "has left the lobby".to_string();
                    }
                    Err(e) => {
                        debug!("read error from {}: {}", conn.addr(), e);
                        return "lost connection".to_string();
                    }
                },
            }
        }
    }

    async fn dispatch(&self, conn: &Connection, packet: Packet) {
        // Until the join handshake completes only Hello and Ping count.
        if !conn.is_init() {
            match packet {
                Packet::Hello {
                    name,
                    unique_id,
                    custom,
                } => self.handle_hello(conn, &name, unique_id, custom).await,
                Packet::Ping => self.handle_ping(conn).await,
                other => debug!(
                    "ignoring {:?} from uninitialized connection {}",
                    other,
                    conn.addr()
                ),
            }
            return;
        }

        match packet {
            Packet::Hello { .. } => {
                debug!("duplicate Hello from '{}' ignored", conn.name());
            }
            Packet::Ping => self.handle_ping(conn).await,
            Packet::Move { dir, .. } => {
                conn.set_direction(dir);
                let packet = Packet::Move {
                    id: conn.id(),
                    dir,
                };
                self.registry
                    .lock()
                    .await
                    .broadcast(&packet, Some(conn.id()));
            }
            Packet::Position { x, y, .. } => {
                conn.set_position(x, y);
                let packet = Packet::Position {
                    id: conn.id(),
                    x,
                    y,
                };
                self.registry
                    .lock()
                    .await
                    .broadcast(&packet, Some(conn.id()));
            }
            Packet::Message { channel, text, .. } => self.handle_message(conn, channel, text).await,
            Packet::SettingsUpdate {
                host_pref, custom, ..
            } => {
                conn.set_host_pref(host_pref);
                let packet = Packet::SettingsUpdate {
                    id: conn.id(),
                    host_pref,
                    custom,
                };
                self.registry.lock().await.broadcast(&packet, None);
            }
            Packet::GameStart { ip, port, .. } => {
                self.machines.lock().await.start_game(conn, &ip, port);
            }
            Packet::ArcadeEngage { id: machine_id } => self.handle_engage(conn, machine_id).await,
            Packet::ArcadeLeave { .. } => self.handle_arcade_leave(conn).await,
            other => {
                warn!(
                    "unexpected {:?} from '{}' (id {})",
                    other,
                    conn.name(),
                    conn.id()
                );
            }
        }
    }

    async fn handle_hello(
        &self,
        conn: &Connection,
        name: &str,
        unique_id: Vec<u8>,
        custom: Vec<u8>,
    ) {
        let mut registry = self.registry.lock().await;
        registry.join(conn, name, unique_id, custom, &self.bans);
    }

    /// Answered at any time, including before the join handshake.
    async fn handle_ping(&self, conn: &Connection) {
        let info = self.registry.lock().await.info();
        conn.send(Packet::Pong { info });
    }

    async fn handle_message(&self, conn: &Connection, channel: u8, text: String) {
        if text.starts_with('/') {
            // Chat command surface; nothing wired up behind it yet.
            conn.send(Packet::Message {
                channel: 0,
                id: 0,
                text: "Commands are not yet implemented".to_string(),
            });
            return;
        }

        let packet = Packet::Message {
            channel,
            id: conn.id(),
            text: format!("{}: {}", conn.name(), text),
        };
        self.registry.lock().await.broadcast(&packet, None);
    }

    async fn handle_engage(&self, conn: &Connection, machine_id: u32) {
        let outcome = self.machines.lock().await.request_join(conn, machine_id);
        if outcome == EngageOutcome::Engaged {
            let packet = Packet::ArcadeEngage { id: conn.id() };
            self.registry
                .lock()
                .await
                .broadcast(&packet, Some(conn.id()));
        }
    }

    async fn handle_arcade_leave(&self, conn: &Connection) {
        let evicted = self.machines.lock().await.leave(conn);
        if evicted.is_empty() {
            return;
        }
        let registry = self.registry.lock().await;
        for id in evicted {
            registry.broadcast(&Packet::ArcadeLeave { id }, None);
        }
    }

    /// Transport-failure and clean-EOF cleanup. The registry leave marks
    /// the connection uninitialized, so the machine teardown broadcasts
    /// that follow naturally skip the departed client.
    async fn disconnect(&self, conn: &Connection, reason: &str) {
        {
            let mut registry = self.registry.lock().await;
            registry.leave(conn, reason);
        }
        let evicted = self.machines.lock().await.leave(conn);
        if !evicted.is_empty() {
            let registry = self.registry.lock().await;
            for id in evicted {
                registry.broadcast(&Packet::ArcadeLeave { id }, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{read_packet, write_packet};
    use shared::LobbyInfo;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const TICK: Duration = Duration::from_secs(5);

    async fn start_test_server(
        max_players: u32,
    ) -> (Arc<LobbyServer>, JoinHandle<Result<(), BoxError>>) {
        let server = LobbyServer::new(
            ServerConfig {
                bind_addr: "127.0.0.1:0".to_string(),
                lobby_name: "test lobby".to_string(),
                max_players,
                directory_addr: None,
            },
            BanRegistry::default(),
        )
        .await
        .unwrap();
        let handle = tokio::spawn(Arc::clone(&server).run());
        (server, handle)
    }

    async fn expect_packet(stream: &mut TcpStream) -> Packet {
        timeout(TICK, read_packet(stream))
            .await
            .expect("timed out waiting for packet")
            .expect("connection closed")
    }

    #[tokio::test]
    async fn test_ping_before_join() {
        let (server, handle) = start_test_server(8).await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        write_packet(&mut client, &Packet::Ping).await.unwrap();
        assert_eq!(
            expect_packet(&mut client).await,
            Packet::Pong {
                info: LobbyInfo {
                    name: "test lobby".to_string(),
                    max_players: 8,
                    current_players: 0,
                }
            }
        );

        server.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_join_then_server_close_kicks() {
        let (server, handle) = start_test_server(8).await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        write_packet(
            &mut client,
            &Packet::Hello {
                name: "alice".to_string(),
                unique_id: vec![1],
                custom: Vec::new(),
            },
        )
        .await
        .unwrap();
        assert_eq!(
            expect_packet(&mut client).await,
            Packet::Olleh {
                name: "alice".to_string(),
                id: 1
            }
        );

        server.close();
        assert_eq!(
            expect_packet(&mut client).await,
            Packet::ImportantMessage {
                text: "Server closed".to_string()
            }
        );
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_kicked_silent_connection_reader_returns() {
        let (server, handle) = start_test_server(8).await;
        let (conn, _rx) = Connection::new("127.0.0.1:9999".parse().unwrap());
        let (client_side, server_side) = tokio::io::duplex(1024);

        let kicker = conn.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            kicker.kick("go away");
        });

        // The peer never writes a byte; the kick alone must end the loop.
        let reason = timeout(TICK, server.read_loop(server_side, &conn))
            .await
            .expect("reader did not observe the kick");
        assert_eq!(reason, "was kicked");
        drop(client_side);

        server.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_packets_before_hello_are_ignored() {
        let (server, handle) = start_test_server(8).await;
        let mut client = TcpStream::connect(server.local_addr()).await.unwrap();

        write_packet(&mut client, &Packet::Move { id: 0, dir: 1 })
            .await
            .unwrap();
        write_packet(&mut client, &Packet::Ping).await.unwrap();

        // The Move was dropped; the Ping reply is the first thing back.
        assert!(matches!(
            expect_packet(&mut client).await,
            Packet::Pong { .. }
        ));

        server.close();
        handle.await.unwrap().unwrap();
    }
}
