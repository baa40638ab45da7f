//! Timing and sizing constants from spec §4 and §6.
//!
//! Kept as `const` `Duration`s rather than config so the correctness
//! argument in SPEC_FULL §4.6 (`LEADER_TIMEOUT > ELECTION_TIMEOUT +
//! COORDINATOR_TIMEOUT`) is checkable by inspection, not by reading a
//! deployed config file.

use std::time::Duration;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1_000);
pub const HEARTBEAT_REDUNDANCY: u32 = 2;
pub const LEADER_TIMEOUT: Duration = Duration::from_millis(3_500);

pub const DISCOVERY_INTERVAL: Duration = Duration::from_millis(1_000);

pub const ELECTION_TIMEOUT: Duration = Duration::from_millis(1_500);
pub const COORDINATOR_TIMEOUT: Duration = Duration::from_millis(1_500);

/// Upper bound on jittered startup grace period before an unbound peer
/// that hasn't discovered a leader calls an election (spec §4.6 trigger 2).
/// Bounded by `LEADER_TIMEOUT` as required.
pub const STARTUP_GRACE_JITTER_MAX: Duration = LEADER_TIMEOUT;

/// Resource bound on `out_of_order_buffer` (spec §5): refuse to buffer past
/// this many pending entries rather than grow unbounded.
pub const MAX_OUT_OF_ORDER_BUFFER: usize = 4096;

/// Fixed well-known port for the discovery datagram listener (spec §6).
pub const DISCOVERY_PORT: u16 = 37020;

/// Base for the per-peer datagram port: `NODE_UDP_BASE + node_id` (spec §6).
pub const NODE_UDP_BASE: u16 = 37100;

/// Max UDP datagram payload size this protocol will send or accept.
pub const MAX_DATAGRAM_SIZE: usize = 2048;
