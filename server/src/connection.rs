//! Per-connection handle and wire framing.
//!
//! The server core never owns a socket directly. Each accepted client is
//! represented by a cheaply clonable [`Connection`] handle that the registry
//! and the machine table share; the socket itself lives in the reader and
//! writer tasks spawned by the server. Outbound traffic goes through an
//! unbounded channel, so `send` never blocks and is safe to call from any
//! task, including while a lock is held.
//!
//! Frames on the wire are a little-endian `u32` length prefix followed by a
//! bincode-encoded [`Packet`].

use log::debug;
use shared::{BattleStatus, HostPreference, Packet, MAX_FRAME_SIZE};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};

/// Messages consumed by a connection's writer task.
#[derive(Debug)]
pub enum Outbound {
    Packet(Packet),
    /// Flush and close the socket after everything queued so far.
    Close,
}

/// Address of a game room opened by a host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub ip: String,
    pub port: u16,
}

/// Mutable per-player state behind the handle.
#[derive(Debug, Default)]
struct PlayerState {
    name: String,
    unique_id: Vec<u8>,
    custom: Vec<u8>,
    x: u32,
    y: u32,
    dir: u8,
    battle_status: BattleStatus,
    active_machine: u32,
    host_pref: HostPreference,
    room: Option<RoomInfo>,
}

struct ConnectionShared {
    addr: SocketAddr,
    /// 0 until the registry assigns an id during the join handshake.
    id: AtomicU32,
    /// true until `close`; the watch wakes the reader task, which would
    /// otherwise sit in a read on a silent socket forever.
    connected: watch::Sender<bool>,
    initialized: AtomicBool,
    outbound: mpsc::UnboundedSender<Outbound>,
    state: Mutex<PlayerState>,
}

/// Non-owning, clonable handle to one connected client.
///
/// The registry and the machine table both hold clones; neither owns the
/// underlying socket or tasks. The handle stays valid after the transport
/// goes away, its sends just become no-ops.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Creates a handle plus the receiving end of its outbound queue, which
    /// the caller feeds to [`write_loop`].
    pub fn new(addr: SocketAddr) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(true);
        let conn = Connection {
            shared: Arc::new(ConnectionShared {
                addr,
                id: AtomicU32::new(0),
                connected,
                initialized: AtomicBool::new(false),
                outbound: tx,
                state: Mutex::new(PlayerState::default()),
            }),
        };
        (conn, rx)
    }

    /// Identity comparison between handles; ids are only assigned at join
    /// time, so pointer equality is the reliable notion of "same client".
    pub fn same(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    fn state(&self) -> MutexGuard<'_, PlayerState> {
        // Keep the handle usable even if a holder panicked mid-update.
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn addr(&self) -> SocketAddr {
        self.shared.addr
    }

    pub fn ip(&self) -> String {
        self.shared.addr.ip().to_string()
    }

    pub fn id(&self) -> u32 {
        self.shared.id.load(Ordering::SeqCst)
    }

    pub fn set_id(&self, id: u32) {
        self.shared.id.store(id, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    /// Receiver whose `changed()` resolves once `close` is called. A
    /// receiver subscribed after the close sees nothing; callers pair it
    /// with an [`is_connected`](Self::is_connected) check.
    pub fn watch_closed(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn is_init(&self) -> bool {
        self.shared.initialized.load(Ordering::SeqCst)
    }

    pub fn set_init(&self, init: bool) {
        self.shared.initialized.store(init, Ordering::SeqCst);
    }

    pub fn name(&self) -> String {
        self.state().name.clone()
    }

    pub fn set_name(&self, name: &str) {
        self.state().name = name.to_string();
    }

    pub fn unique_id(&self) -> Vec<u8> {
        self.state().unique_id.clone()
    }

    /// Player data carried by Hello, relayed verbatim in PlayerJoin.
    pub fn custom(&self) -> Vec<u8> {
        self.state().custom.clone()
    }

    pub fn set_identity(&self, unique_id: Vec<u8>, custom: Vec<u8>) {
        let mut state = self.state();
        state.unique_id = unique_id;
        state.custom = custom;
    }

    pub fn position(&self) -> (u32, u32) {
        let state = self.state();
        (state.x, state.y)
    }

    pub fn set_position(&self, x: u32, y: u32) {
        let mut state = self.state();
        state.x = x;
        state.y = y;
    }

    pub fn direction(&self) -> u8 {
        self.state().dir
    }

    pub fn set_direction(&self, dir: u8) {
        self.state().dir = dir;
    }

    pub fn battle_status(&self) -> BattleStatus {
        self.state().battle_status
    }

    pub fn set_battle_status(&self, status: BattleStatus) {
        self.state().battle_status = status;
    }

    pub fn active_machine(&self) -> u32 {
        self.state().active_machine
    }

    pub fn set_active_machine(&self, machine_id: u32) {
        self.state().active_machine = machine_id;
    }

    pub fn host_pref(&self) -> HostPreference {
        self.state().host_pref
    }

    pub fn set_host_pref(&self, pref: HostPreference) {
        self.state().host_pref = pref;
    }

    pub fn room(&self) -> Option<RoomInfo> {
        self.state().room.clone()
    }

    pub fn set_room(&self, room: RoomInfo) {
        self.state().room = Some(room);
    }

    /// Queues a packet for the writer task. Never blocks; a closed writer
    /// just drops the packet, which is fine because the connection is about
    /// to be pruned anyway.
    pub fn send(&self, packet: Packet) {
        if self.shared.outbound.send(Outbound::Packet(packet)).is_err() {
            debug!("dropping packet for closed connection {}", self.shared.addr);
        }
    }

    /// Tells the client why it is being disconnected, then closes.
    pub fn kick(&self, reason: &str) {
        self.send(Packet::ImportantMessage {
            text: reason.to_string(),
        });
        self.close();
    }

    /// Marks the connection dead, wakes anyone waiting on
    /// [`watch_closed`](Self::watch_closed), and asks the writer task to
    /// wind down.
    pub fn close(&self) {
        self.shared.connected.send_replace(false);
        let _ = self.shared.outbound.send(Outbound::Close);
    }
}

/// Reads one length-prefixed packet from the stream.
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Packet> {
    let len = reader.read_u32_le().await?;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds the {} byte cap", len, MAX_FRAME_SIZE),
        ));
    }

    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Packet::decode(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Writes one length-prefixed packet to the stream.
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> io::Result<()> {
    let bytes = packet
        .encode()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    writer.write_u32_le(bytes.len() as u32).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Drains a connection's outbound queue onto its socket. Returns when asked
/// to close, when every sender is gone, or on the first write error.
pub async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(message) = rx.recv().await {
        match message {
            Outbound::Packet(packet) => {
                if let Err(e) = write_packet(&mut writer, &packet).await {
                    debug!("write failed, closing writer: {}", e);
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_addr() -> SocketAddr {
        "127.0.0.1:8080".parse().unwrap()
    }

    #[test]
    fn test_handle_defaults() {
        let (conn, _rx) = Connection::new(test_addr());

        assert_eq!(conn.id(), 0);
        assert!(conn.is_connected());
        assert!(!conn.is_init());
        assert_eq!(conn.battle_status(), BattleStatus::NotPlaying);
        assert_eq!(conn.host_pref(), HostPreference::NoPreference);
        assert_eq!(conn.room(), None);
        assert_eq!(conn.ip(), "127.0.0.1");
    }

    #[test]
    fn test_kick_queues_reason_then_close() {
        let (conn, mut rx) = Connection::new(test_addr());

        conn.kick("Server is full");
        assert!(!conn.is_connected());

        match rx.try_recv().unwrap() {
            Outbound::Packet(Packet::ImportantMessage { text }) => {
                assert_eq!(text, "Server is full");
            }
            other => panic!("expected important message, got {:?}", other),
        }
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close));
    }

    #[tokio::test]
    async fn test_close_wakes_closed_watchers() {
        let (conn, _rx) = Connection::new(test_addr());
        let mut closed = conn.watch_closed();

        let waiter = tokio::spawn(async move {
            closed.changed().await.expect("handle dropped");
        });
        tokio::task::yield_now().await;
        conn.close();

        tokio::time::timeout(std::time::Duration::from_secs(5), waiter)
            .await
            .expect("watcher was never woken")
            .unwrap();
    }

    #[test]
    fn test_send_after_writer_dropped_is_noop() {
        let (conn, rx) = Connection::new(test_addr());
        drop(rx);

        conn.send(Packet::Ping);
        conn.close();
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(1024);

        let packet = Packet::Position {
            id: 7,
            x: 120,
            y: 480,
        };
        write_packet(&mut a, &packet).await.unwrap();

        let decoded = read_packet(&mut b).await.unwrap();
        assert_eq!(decoded, packet);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        a.write_u32_le(MAX_FRAME_SIZE + 1).await.unwrap();
        let err = read_packet(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_write_loop_delivers_and_closes() {
        let (stream, mut peer) = tokio::io::duplex(1024);
        let (conn, rx) = Connection::new(test_addr());

        let writer = tokio::spawn(write_loop(stream, rx));
        conn.send(Packet::PlayerLeave { id: 3 });
        conn.close();

        assert_eq!(
            read_packet(&mut peer).await.unwrap(),
            Packet::PlayerLeave { id: 3 }
        );
        // The writer shuts the stream down after Close.
        assert!(read_packet(&mut peer).await.is_err());
        writer.await.unwrap();
    }
}
