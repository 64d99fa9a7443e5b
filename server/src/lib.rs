//! # Lobby Server Library
//!
//! This library implements a multiplayer lobby server for a real-time game.
//! Clients connect over TCP, appear in a shared roster, see each other move
//! and chat, and pair up into head-to-head matches by walking up to "arcade
//! machines"; the server arbitrates which peer hosts the resulting game
//! session and periodically announces the lobby to an upstream directory
//! server.
//!
//! ## Core Responsibilities
//!
//! ### Connection Registry
//! The authoritative roster of live connections: unique id allocation, name
//! de-duplication, the join handshake with its full state sync, departure
//! broadcasts, ban/capacity enforcement, and pruning of dead handles.
//!
//! ### Matchmaking
//! The machine table maps client-chosen machine ids to ordered occupant
//! lists (two players, then spectators) and drives the matchmaking state
//! machine: queueing, host-preference negotiation, game start fan-out, and
//! cascading teardown when a player leaves or disconnects.
//!
//! ### Broadcast Fan-out
//! Position, movement, chat, and settings updates are relayed to every
//! initialized connection. Sends only queue onto per-connection channels,
//! so broadcasts never block on a slow peer.
//!
//! ## Architecture Design
//!
//! ### Task-per-connection
//! The accept loop wraps each socket in a clonable [`connection::Connection`]
//! handle and spawns a reader task (decode frame, dispatch to the server)
//! and a writer task (drain the outbound queue). All tasks run genuinely in
//! parallel on the tokio runtime.
//!
//! ### Two Lock Domains, Never Nested
//! Shared state is split between the connection registry and the machine
//! table, each behind its own async mutex. No code path holds both at once:
//! machine operations return whatever must be broadcast, and the caller
//! takes the registry lock only after the machine lock is released. This
//! makes lock-ordering deadlocks impossible by construction.
//!
//! ### Cooperative Shutdown
//! A watch channel carries the shutdown flag. The accept loop and the
//! heartbeat observe it on their next wake; `run` kicks every live
//! connection with the reason and joins the heartbeat before returning.
//!
//! ## Module Organization
//!
//! - [`connection`]: the shared connection handle and the wire framing.
//! - [`registry`]: the connection registry and lobby counters.
//! - [`machines`]: the machine table and host-preference negotiation.
//! - [`bans`]: the process-lifetime ban list.
//! - [`heartbeat`]: periodic directory-server registration.
//! - [`server`]: the composition root tying it all together.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use lobby_server::bans::BanRegistry;
//! use lobby_server::server::{LobbyServer, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     let server = LobbyServer::new(
//!         ServerConfig {
//!             bind_addr: "0.0.0.0:5255".to_string(),
//!             lobby_name: "my lobby".to_string(),
//!             max_players: 20,
//!             directory_addr: Some("localhost:5254".to_string()),
//!         },
//!         BanRegistry::default(),
//!     )
//!     .await?;
//!
//!     server.run().await
//! }
//! ```

pub mod bans;
pub mod connection;
pub mod heartbeat;
pub mod machines;
pub mod registry;
pub mod server;
