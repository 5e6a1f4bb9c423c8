//! # Room Relay Server Library
//!
//! This library provides the server side of a realtime position relay. Clients
//! join a room over a WebSocket, report incremental movements and shots, and
//! the server fans those events out to every other member of the room so each
//! client can render the other participants with low perceived latency.
//!
//! The server is not authoritative: it does not simulate physics or validate
//! reported positions. Its job is bookkeeping and fan-out:
//! - who is connected, and through which transport handle
//! - which room each participant is in
//! - where each participant currently is, so a late joiner can be brought up
//!   to date with one `user_position` snapshot per existing member
//!
//! ## Architecture Design
//!
//! ### Single Owner Relay Loop
//! Connection tasks run concurrently on the tokio runtime but never touch
//! session state. They forward transport events over a channel to one loop
//! that owns [`session::SessionState`] outright, so every join, move, shot and
//! disconnect is applied sequentially against a consistent membership
//! snapshot, and no locking is needed.
//!
//! ### Best Effort Fan-out
//! Delivery never blocks and never retries. A room member whose connection is
//! already gone is skipped.
//!
//! ## Module Organization
//!
//! - [`connections`]: participant → transport handle registry, and the
//!   [`connections::PeerChannel`] delivery capability
//! - [`rooms`]: room → ordered member list, rooms created on first reference
//! - [`movement`]: running aggregate position per participant
//! - [`session`]: the connect / move / shot / disconnect state machine
//! - [`config`]: command line arguments and the common configuration file
//! - [`network`]: WebSocket transport and the relay loop
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::config::RelaySettings;
//! use server::network::Server;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let settings = RelaySettings {
//!         move_speed: 5.0,
//!         ..RelaySettings::default()
//!     };
//!
//!     // Clients connect to ws://127.0.0.1:3000/?user_id=<id>&room_id=<id>
//!     let server = Server::bind("127.0.0.1:3000", settings).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod connections;
pub mod movement;
pub mod network;
pub mod rooms;
pub mod session;
