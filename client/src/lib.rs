//! # State-Replication Client
//!
//! This library provides the remote-peer half of the state-replication
//! protocol: it connects to an authoritative server, mirrors the filtered
//! projection of server state it is entitled to see, and exposes a command
//! channel back to the application.
//!
//! ## How Synchronization Works
//!
//! The client never simulates anything. It applies whatever the server sends:
//! a full snapshot replaces the mirror wholesale, a delta patch list is
//! applied all-or-nothing, and every applied update is acknowledged with its
//! tick time. The server uses those acknowledgments to retire delta history;
//! when they stop flowing (lost packets, desync), it falls back to full
//! snapshots automatically. Received application events are forwarded upward
//! without touching the mirror; state changes only ever travel as full or
//! delta state messages.
//!
//! ## Transport Discipline
//!
//! The connection starts as a single reliable TCP leg. Once admitted, the
//! server sends a `simulate` control message; the client then registers a UDP
//! endpoint and high-frequency state traffic (plus acknowledgments) moves to
//! best-effort datagrams. Everything else (commands, events, fatal errors)
//! stays on the reliable leg. Lost datagrams are tolerated by design: every
//! delta carries the cumulative unacknowledged patch list, so any received
//! update heals the gaps before it.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! Connection establishment, the frame/datagram pump, mirror maintenance and
//! the event stream handed to the application.

pub mod network;
