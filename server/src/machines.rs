//! Arcade machine table: the matchmaking state machine.
//!
//! A machine is a client-chosen slot id holding an ordered list of
//! occupants; the first two are the competing players, everyone after them
//! spectates. The table lives behind its own `tokio::sync::Mutex`, separate
//! from the registry lock; methods send directly to occupants (sends only
//! queue) and hand anything that must be broadcast back to the caller, so
//! the two locks are never held at the same time.

use crate::connection::{Connection, RoomInfo};
use log::info;
use shared::{BattleStatus, HostPreference, Packet};
use std::collections::HashMap;

/// Result of host-preference negotiation between the two player slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    BothClientOnly,
    BothHostOnly,
    /// Index (0 or 1) of the player who hosts.
    Host(usize),
}

/// What `request_join` did, and whether the caller should broadcast an
/// engagement notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngageOutcome {
    /// The connection was already queued or playing somewhere.
    Ignored,
    /// Joined the machine; broadcast ArcadeEngage for the requester.
    Engaged,
    /// Negotiation rejected the pairing; nothing to broadcast.
    Rejected,
}

const BOTH_CLIENT_ONLY_MSG: &str = "<color FF0000>Error: Cannot start the game because both \
     you and your opponent have their hosting preference set to 'Client only'. One of you needs \
     to be able to host to start the game. Either change your settings to 'No preference' or \
     'Host only' if you can host. Otherwise, try to join someone that can host games.</color>";

const BOTH_HOST_ONLY_MSG: &str = "<color FF0000>Error: Cannot start the game because both \
     you and your opponent have their hosting preference set to 'Host only'.</color>";

/// Picks the host for a filled machine.
///
/// HostOnly beats NoPreference; a lone eligible party hosts; two
/// NoPreference default to player 1 (slot 0). Matching extremes on both
/// sides are incompatible.
pub fn negotiate(p1: HostPreference, p2: HostPreference) -> Negotiation {
    use HostPreference::*;
    match (p1, p2) {
        (ClientOnly, ClientOnly) => Negotiation::BothClientOnly,
        (HostOnly, HostOnly) => Negotiation::BothHostOnly,
        (_, HostOnly) => Negotiation::Host(1),
        (ClientOnly, _) => Negotiation::Host(1),
        _ => Negotiation::Host(0),
    }
}

#[derive(Default)]
pub struct MachineTable {
    machines: HashMap<u32, Vec<Connection>>,
}

impl MachineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Occupant count of a machine; absent machines are empty.
    #[cfg(test)]
    fn occupants(&self, machine_id: u32) -> usize {
        self.machines.get(&machine_id).map_or(0, Vec::len)
    }

    /// Handles a client walking up to an arcade machine.
    ///
    /// A requester already in a battle is ignored. Occupants of the two
    /// player slots that are already playing earn the requester an
    /// immediate spectator GameStart carrying their room address. The
    /// requester then takes a player slot if one is free, otherwise it
    /// spectates. Filling the second player slot triggers negotiation; on
    /// an incompatible pairing only the requester is evicted (ArcadeLeave
    /// to it alone, status reset), the first player stays queued.
    pub fn request_join(&mut self, conn: &Connection, machine_id: u32) -> EngageOutcome {
        if conn.battle_status() != BattleStatus::NotPlaying {
            return EngageOutcome::Ignored;
        }

        let machine = self.machines.entry(machine_id).or_default();
        for occupant in machine.iter().take(2) {
            if occupant.battle_status() != BattleStatus::Playing {
                continue;
            }
            if let Some(room) = occupant.room() {
                conn.send(Packet::GameStart {
                    ip: room.ip,
                    port: room.port,
                    spectator: true,
                });
            }
        }

        machine.push(conn.clone());
        conn.set_battle_status(BattleStatus::Queued);
        conn.set_active_machine(machine_id);
        info!(
            "'{}' (id {}) engaged machine {} as {}",
            conn.name(),
            conn.id(),
            machine_id,
            if machine.len() > 2 { "spectator" } else { "player" }
        );

        if machine.len() == 2 {
            let outcome = negotiate(machine[0].host_pref(), machine[1].host_pref());
            match outcome {
                Negotiation::BothClientOnly | Negotiation::BothHostOnly => {
                    let message = if outcome == Negotiation::BothClientOnly {
                        BOTH_CLIENT_ONLY_MSG
                    } else {
                        BOTH_HOST_ONLY_MSG
                    };
                    machine[0].send(Packet::ImportantMessage {
                        text: message.to_string(),
                    });
                    conn.send(Packet::ImportantMessage {
                        text: message.to_string(),
                    });
                    conn.send(Packet::ArcadeLeave { id: conn.id() });
                    // Only the second joiner backs off; slot 0 stays queued.
                    machine.pop();
                    conn.set_battle_status(BattleStatus::NotPlaying);
                    info!(
                        "negotiation failed on machine {}: incompatible host preferences",
                        machine_id
                    );
                    return EngageOutcome::Rejected;
                }
                Negotiation::Host(host) => {
                    machine[host].send(Packet::GameRequest { host: true });
                    info!(
                        "machine {}: '{}' (id {}) selected as host",
                        machine_id,
                        machine[host].name(),
                        machine[host].id()
                    );
                }
            }
        }

        EngageOutcome::Engaged
    }

    /// Removes a connection from its machine.
    ///
    /// A competing player leaving tears the whole machine down: every
    /// occupant is reset to NotPlaying and their ids are returned so the
    /// caller can broadcast an ArcadeLeave notice for each. A spectator
    /// leaving removes only that entry and nothing is broadcast.
    pub fn leave(&mut self, conn: &Connection) -> Vec<u32> {
        if conn.battle_status() == BattleStatus::NotPlaying {
            return Vec::new();
        }
        conn.set_battle_status(BattleStatus::NotPlaying);

        let machine_id = conn.active_machine();
        let Some(machine) = self.machines.get_mut(&machine_id) else {
            return Vec::new();
        };

        let is_player = machine.iter().take(2).any(|c| c.same(conn));
        if is_player {
            let evicted: Vec<u32> = machine
                .iter()
                .map(|c| {
                    c.set_battle_status(BattleStatus::NotPlaying);
                    c.id()
                })
                .collect();
            self.machines.remove(&machine_id);
            info!("machine {} torn down, {} occupants evicted", machine_id, evicted.len());
            evicted
        } else {
            machine.retain(|c| !c.same(conn));
            if machine.is_empty() {
                self.machines.remove(&machine_id);
            }
            Vec::new()
        }
    }

    /// Host announces the room it opened: record the address, mark the host
    /// playing, and send every other occupant the room (spectator-flagged
    /// from the third slot on).
    pub fn start_game(&mut self, conn: &Connection, ip: &str, port: u16) {
        if conn.battle_status() == BattleStatus::NotPlaying {
            return;
        }
        let Some(machine) = self.machines.get(&conn.active_machine()) else {
            return;
        };

        conn.set_room(RoomInfo {
            ip: ip.to_string(),
            port,
        });
        conn.set_battle_status(BattleStatus::Playing);
        info!(
            "game starting on machine {}: room {}:{}",
            conn.active_machine(),
            ip,
            port
        );

        for (i, occupant) in machine.iter().enumerate() {
            if occupant.same(conn) {
                continue;
            }
            occupant.send(Packet::GameStart {
                ip: ip.to_string(),
                port,
                spectator: i >= 2,
            });
        }
    }
}
