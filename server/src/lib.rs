//! # Authoritative State-Replication Server
//!
//! This library provides the authoritative half of the state-replication
//! protocol. It owns the canonical state tree, runs the fixed-interval
//! simulation tick, and keeps every connected client's filtered view of that
//! state continuously synchronized over a dual-channel transport.
//!
//! ## Core Responsibilities
//!
//! ### Single Source of Truth
//! Canonical state lives inside the session and is mutated only by
//! application hooks running on the session's own task. Clients never write
//! state; they issue commands and receive projections.
//!
//! ### Per-Client Projection and Delta Streaming
//! Each client is attached with a declarative projection table deciding which
//! parts of canonical state it may see. Every tick, the client's manager
//! recomputes the projection, diffs it against the last-sent view and ships
//! either a delta patch list or a full snapshot.
//!
//! ### Reliability Over a Lossy Channel
//! Delta traffic rides an unordered, best-effort channel. Reliability is
//! reconstructed at the protocol layer: unacknowledged patches accumulate and
//! every delta carries the whole cumulative list, so a client that missed
//! earlier packets converges from any later one. If acknowledgments stop for
//! longer than the configured timeout, the manager abandons delta history and
//! resynchronizes with full states.
//!
//! ## Architecture Design
//!
//! The session is a single-threaded cooperative loop: one `tokio::select!`
//! over the inbound message queue and the tick timer. Handling one message or
//! one tick is an atomic step with respect to canonical state, which rules
//! out interleaved mutations without any locking. Socket pumping lives in
//! dedicated tasks that talk to the loop purely through messages.
//!
//! ## Module Organization
//!
//! ### Session Module (`session`)
//! The session loop, client registry and join/quit/command state machine,
//! plus the `Application` trait the simulation plugs into.
//!
//! ### Projection Module (`projection`)
//! Declarative per-client visibility rules evaluated as a pure function of
//! the canonical snapshot.
//!
//! ### State Manager Module (`state_manager`)
//! Per-client diff engines: last-sent tracking, full-vs-delta policy and the
//! acknowledgment-aware cumulative retransmission layer.
//!
//! ### Connection Module (`connection`)
//! The per-client transport binding with the reliable/unreliable routing
//! rule.
//!
//! ### Net Module (`net`)
//! The remote gateway: TCP frames for the reliable leg, UDP datagrams for the
//! unreliable leg, both bound on one address.
//!
//! ### Local Module (`local`)
//! The embedded transport: in-process clients over queue channels, used by
//! tests, bots and single-process deployments.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use serde::{Deserialize, Serialize};
//! use server::net::Gateway;
//! use server::session::{Application, Events, Session, SessionConfig};
//! use std::time::Duration;
//!
//! #[derive(Serialize)]
//! struct World {
//!     clock: u64,
//! }
//!
//! #[derive(Deserialize)]
//! enum Command {
//!     Ping,
//! }
//!
//! struct App;
//!
//! impl Application for App {
//!     type State = World;
//!     type Command = Command;
//!     type Event = serde_json::Value;
//!
//!     fn simulate(
//!         &mut self,
//!         state: &mut World,
//!         _events: &mut Events<Self::Event>,
//!         _elapsed: Duration,
//!     ) {
//!         state.clock += 1;
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SessionConfig::fixed(Duration::from_millis(500));
//!     let (session, handle) = Session::new(App, World { clock: 0 }, config);
//!
//!     let gateway = Gateway::bind("127.0.0.1:8080", handle.clone()).await?;
//!     tokio::spawn(session.run());
//!     gateway.run().await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod local;
pub mod net;
pub mod projection;
pub mod session;
pub mod state_manager;
