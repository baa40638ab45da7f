//! A LAN-scoped totally-ordered broadcast and replication engine.
//!
//! One Bully-elected leader sequences submitted payloads into a dense,
//! durable, per-epoch stream; every other peer replicates that stream in
//! order, detects and fills gaps, and fails over to a new leader when the
//! old one goes quiet.

pub mod config;
pub mod constants;
pub mod discovery;
pub mod election;
pub mod error;
pub mod failure_detector;
pub mod net;
pub mod peer;
pub mod replica;
pub mod sequencer;
pub mod sink;
pub mod state;
pub mod submission;

pub use config::{Cli, Config, ConfigError};
pub use error::PeerError;
pub use peer::Peer;
