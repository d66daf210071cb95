//! # mqd
//!
//! `mqd` is a standalone message-queue daemon. Producers publish to named
//! topics; every channel of a topic receives its own copy of each message
//! and hands it, at least once, to exactly one of its connected consumers.
//!
//! ## Core Modules
//!
//! - `broker`: topics, channels, the two-tier queue, in-flight tracking and
//!   the topic registry.
//! - `persistence`: `sled`-backed overflow queues that survive restarts.
//! - `client`: what a channel knows about a subscribed connection.
//! - `transport`: the WebSocket server and the per-connection protocol.
//! - `lookup`: announcements to discovery peers.
//! - `config`: settings loaded from file and environment.
//! - `utils`: error types and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod lookup;
pub mod persistence;
pub mod transport;
pub mod utils;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
