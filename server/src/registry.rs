//! Authoritative roster of live connections.
//!
//! The registry owns id allocation, name de-duplication, the join handshake
//! with its full state sync, departure broadcasts, and pruning of dead
//! handles. The server wraps it in a `tokio::sync::Mutex`; every method here
//! assumes the caller holds that lock, and the lock is never held while the
//! machine table lock is taken (or the other way around).

use crate::bans::BanRegistry;
use crate::connection::Connection;
use log::{info, warn};
use shared::{BattleStatus, LobbyInfo, Packet};

pub struct ConnectionRegistry {
    connections: Vec<Connection>,
    info: LobbyInfo,
}

impl ConnectionRegistry {
    pub fn new(lobby_name: &str, max_players: u32) -> Self {
        Self {
            connections: Vec::new(),
            info: LobbyInfo {
                name: lobby_name.to_string(),
                max_players,
                current_players: 0,
            },
        }
    }

    /// Snapshot for Ping replies; answered even before a join completes.
    pub fn info(&self) -> LobbyInfo {
        self.info.clone()
    }

    /// Tracks a freshly accepted connection. It stays invisible to
    /// broadcasts until the join handshake flips its initialized flag.
    pub fn add(&mut self, conn: Connection) {
        self.connections.push(conn);
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Smallest positive integer no live connection currently holds.
    /// Restarts the scan after every conflict so the result is minimal.
    pub fn allocate_id(&self) -> u32 {
        let mut id = 1;
        let mut clean = false;
        while !clean {
            clean = true;
            for c in &self.connections {
                if c.id() == id {
                    clean = false;
                    id += 1;
                }
            }
        }
        id
    }

    /// Resolves the requested name against every other initialized
    /// connection, appending a counter (starting at 0) to the original
    /// request until it no longer collides. An empty request starts from
    /// the counter immediately, so it becomes "0". The whole retry loop
    /// runs under the caller's single lock acquisition, so check and
    /// assignment cannot interleave with a racing join.
    pub fn sanitize_name(&self, requested: &str, exclude_id: u32) -> String {
        let mut counter = 0u32;
        let mut result = requested.to_string();

        if result.is_empty() {
            result = counter.to_string();
            counter += 1;
        }
        'rescan: loop {
            for c in &self.connections {
                if c.id() != exclude_id && c.is_init() && c.name() == result {
                    result = format!("{}{}", requested, counter);
                    counter += 1;
                    continue 'rescan;
                }
            }
            return result;
        }
    }

    /// Sends a packet to every initialized connection, optionally skipping
    /// one id. Sends only queue onto each connection's outbound channel, so
    /// the lock hold time stays O(connections).
    pub fn broadcast(&self, packet: &Packet, exclude: Option<u32>) {
        for c in &self.connections {
            if !c.is_init() {
                continue;
            }
            if Some(c.id()) == exclude {
                continue;
            }
            c.send(packet.clone());
        }
    }

    /// Drops handles whose transport has gone away. Run once per
    /// accept-loop iteration; the leave path has already produced any
    /// departure broadcasts by the time this fires.
    pub fn remove_disconnected(&mut self) {
        self.connections.retain(|c| c.is_connected());
    }

    /// Admits a connection into the lobby, or kicks it with a reason.
    ///
    /// On success the newcomer receives Olleh with its assigned identity,
    /// everyone else learns about the newcomer, and the newcomer receives
    /// every existing player's join notice, position and facing direction.
    pub fn join(
        &mut self,
        conn: &Connection,
        requested_name: &str,
        unique_id: Vec<u8>,
        custom: Vec<u8>,
        bans: &BanRegistry,
    ) -> bool {
        if self.info.current_players == self.info.max_players {
            warn!("rejecting {}: lobby is full", conn.addr());
            conn.kick("Server is full");
            return false;
        }
        if bans.is_banned(&conn.ip(), &unique_id) {
            warn!("rejecting {}: banned", conn.addr());
            conn.kick("You are banned from this server");
            return false;
        }

        let id = self.allocate_id();
        conn.set_id(id);
        let name = self.sanitize_name(requested_name, id);
        conn.set_name(&name);
        conn.set_identity(unique_id, custom.clone());

        conn.send(Packet::Olleh {
            name: name.clone(),
            id,
        });

        let newcomer_engaged = conn.battle_status() != BattleStatus::NotPlaying;
        for c in &self.connections {
            if !c.is_init() || c.id() == id {
                continue;
            }
            c.send(Packet::PlayerJoin {
                id,
                name: name.clone(),
                custom: custom.clone(),
            });
            let (x, y) = c.position();
            conn.send(Packet::PlayerJoin {
                id: c.id(),
                name: c.name(),
                custom: c.custom(),
            });
            conn.send(Packet::Position { id: c.id(), x, y });
            conn.send(Packet::Move {
                id: c.id(),
                dir: c.direction(),
            });
            if newcomer_engaged {
                c.send(Packet::ArcadeEngage { id });
            }
        }

        conn.set_init(true);
        self.info.current_players += 1;
        info!(
            "{} joined as '{}' (id {}, {}/{} players)",
            conn.addr(),
            name,
            id,
            self.info.current_players,
            self.info.max_players
        );
        true
    }

    /// Announces a departure. No-op for connections that never completed
    /// the join handshake. Machine teardown is the caller's follow-up once
    /// this lock is released.
    pub fn leave(&mut self, conn: &Connection, reason: &str) {
        if !conn.is_init() {
            return;
        }

        let id = conn.id();
        let name = conn.name();
        let notice = Packet::Message {
            channel: 0,
            id: 0,
            text: format!("{} {}", name, reason),
        };
        for c in &self.connections {
            if !c.is_init() {
                continue;
            }
            c.send(notice.clone());
            if c.id() != id {
                c.send(Packet::PlayerLeave { id });
            }
        }

        self.info.current_players = self.info.current_players.saturating_sub(1);
        conn.set_init(false);
        info!(
            "'{}' (id {}) left: {} ({}/{} players)",
            name, id, reason, self.info.current_players, self.info.max_players
        );
    }

    /// Shutdown and fatal-error path: every live connection gets the reason
    /// and a close.
    pub fn kick_all(&self, reason: &str) {
        for c in &self.connections {
            c.kick(reason);
        }
    }
}
