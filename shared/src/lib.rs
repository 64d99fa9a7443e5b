use serde::{Deserialize, Serialize};

/// Upper bound on a single framed packet on the wire. Anything larger is
/// treated as a protocol violation and the connection is dropped.
pub const MAX_FRAME_SIZE: u32 = 64 * 1024;

/// Tag byte of the directory registration record.
pub const DIRECTORY_REGISTER_TAG: u8 = 0;

/// Snapshot of the lobby advertised to clients through Ping/Pong.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct LobbyInfo {
    pub name: String,
    pub max_players: u32,
    pub current_players: u32,
}

/// Matchmaking state of a single connection.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub enum BattleStatus {
    #[default]
    NotPlaying,
    Queued,
    Playing,
}

/// A player's willingness to act as network host for a match, ordered by
/// host-willingness: `ClientOnly < NoPreference < HostOnly`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum HostPreference {
    ClientOnly,
    #[default]
    NoPreference,
    HostOnly,
}

/// Every packet exchanged between a client and the lobby server.
///
/// A few variants keep the fixed-layout protocol's habit of reusing one
/// record in both directions with the id field reinterpreted:
/// - `ArcadeEngage`: from a client the id names the machine to walk up to;
///   from the server it names the player who engaged.
/// - `GameStart`: from a client it announces the room the host just opened
///   (the spectator flag is ignored); from the server it carries the room
///   address to the other occupants.
/// - `Move`/`Position`/`Message`/`SettingsUpdate`: the id is ignored on the
///   way in and stamped with the sender's id on the way out.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    Hello {
        name: String,
        unique_id: Vec<u8>,
        custom: Vec<u8>,
    },
    Olleh {
        name: String,
        id: u32,
    },
    Ping,
    Pong {
        info: LobbyInfo,
    },
    Move {
        id: u32,
        dir: u8,
    },
    Position {
        id: u32,
        x: u32,
        y: u32,
    },
    Message {
        channel: u8,
        /// 0 means the message comes from the server itself.
        id: u32,
        text: String,
    },
    ImportantMessage {
        text: String,
    },
    PlayerJoin {
        id: u32,
        name: String,
        custom: Vec<u8>,
    },
    PlayerLeave {
        id: u32,
    },
    SettingsUpdate {
        id: u32,
        host_pref: HostPreference,
        custom: Vec<u8>,
    },
    GameStart {
        ip: String,
        port: u16,
        spectator: bool,
    },
    GameRequest {
        host: bool,
    },
    ArcadeEngage {
        id: u32,
    },
    ArcadeLeave {
        id: u32,
    },
}

impl Packet {
    pub fn encode(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> bincode::Result<Packet> {
        bincode::deserialize(bytes)
    }
}

/// The 3-byte record a lobby sends to the directory server to announce
/// itself: tag byte, then the lobby's listening port little-endian.
pub fn registration_frame(port: u16) -> [u8; 3] {
    [
        DIRECTORY_REGISTER_TAG,
        (port & 0xff) as u8,
        (port >> 8) as u8,
    ]
}
