//! Per-peer state machine (spec §3, §4.6, §5).
//!
//! `PeerState` holds exactly one `Role` at a time; transitions between
//! roles are the Bully state machine's five edges (spec §4.6). `Shared`
//! bundles the in-memory state with the durable WAL behind one lock so
//! that "append to WAL, advance `next_seq`, enqueue for broadcast" is a
//! single atomic step from every caller's point of view (spec §5).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::SocketAddr;
use std::time::Instant;

use obus_protocol::{DeliveredOrder, Epoch, NodeId, Order, Seq};
use obus_wal::Wal;
use tokio::sync::broadcast;

use crate::constants::MAX_OUT_OF_ORDER_BUFFER;

/// Opaque handle identifying one accepted stream connection, used to key
/// per-follower catch-up watermarks on the Leader side.
pub type ConnectionId = u64;

/// What this peer currently believes about the leader, while it is a
/// Follower (or not yet sure it's anything at all).
#[derive(Debug, Clone)]
pub struct LeaderBinding {
    pub leader_id: NodeId,
    pub leader_stream_endpoint: SocketAddr,
    pub leader_epoch: Epoch,
    pub last_seen: Instant,
}

/// The role half of the state machine (spec §4.6).
///
/// Not `Clone`: `Leader` carries a `broadcast::Sender` meant to have
/// exactly one owner in `PeerState`. Code that needs a snapshot of which
/// variant (and epoch) is current without the leader payload should match
/// and copy out only the fields it needs.
#[derive(Debug)]
pub enum Role {
    /// Not leading. `binding` is `None` until this peer has heard
    /// `I_AM_LEADER`, `LEADER_ALIVE`, or `COORDINATOR` at least once.
    Follower { binding: Option<LeaderBinding> },
    /// This peer called an election at `epoch` and is waiting out
    /// `ELECTION_TIMEOUT` for an `Answer` from a higher-id peer.
    Campaigning { epoch: Epoch, deadline: Instant },
    /// No `Answer` arrived in time; this peer declared itself winner at
    /// `epoch` and is broadcasting `Coordinator` while `COORDINATOR_TIMEOUT`
    /// runs out any stray late answers.
    AwaitingCoronation { epoch: Epoch, deadline: Instant },
    /// This peer is the leader for `epoch`.
    Leader(LeaderState),
}

/// Per-follower replication progress, Leader side only.
#[derive(Debug, Clone, Copy)]
pub struct FollowerProgress {
    pub last_sent: Seq,
}

/// State a peer holds only while it is the leader.
#[derive(Debug)]
pub struct LeaderState {
    pub epoch: Epoch,
    /// Next sequence number to assign to an accepted `NewOrder` (1-based,
    /// dense within this epoch).
    pub next_seq: Seq,
    /// Every `payload_id` ever sequenced, across all epochs this leader has
    /// held, used for leader-side at-most-once acceptance.
    pub seen_payload_ids: HashSet<String>,
    /// Fan-out channel every accept-loop connection task subscribes to
    /// exactly once, at connection start (spec §4.1, §5).
    pub broadcast_tx: broadcast::Sender<Order>,
    /// Per-connection catch-up watermark, used to dedup between the
    /// history replay path and the live broadcast path on reconnect.
    pub followers: HashMap<ConnectionId, FollowerProgress>,
}

impl LeaderState {
    pub fn new(epoch: Epoch, next_seq: Seq, seen_payload_ids: HashSet<String>) -> Self {
        let (broadcast_tx, _rx) = broadcast::channel(1024);
        LeaderState {
            epoch,
            next_seq,
            seen_payload_ids,
            broadcast_tx,
            followers: HashMap::new(),
        }
    }
}

/// Replicated order history and gap-filling state, Follower side. Kept
/// alongside `Role` rather than inside it because a peer that has been
/// both Follower and Leader in its lifetime keeps exactly one history.
#[derive(Debug, Default)]
pub struct ReplicaState {
    /// Highest contiguous `seq` applied so far, within `current_epoch`.
    pub expected_seq: Seq,
    /// Orders that arrived ahead of `expected_seq`, keyed by `seq`, pending
    /// the gap being filled. Bounded by `MAX_OUT_OF_ORDER_BUFFER` (spec §5).
    pub out_of_order_buffer: BTreeMap<Seq, DeliveredOrder>,
}

impl ReplicaState {
    /// Buffer an out-of-order delivery. Returns `false` (and drops the
    /// entry) if the buffer is already at its resource bound, per spec §5 —
    /// the caller should fall back to a fresh `RESEND_REQUEST` rather than
    /// grow unbounded.
    pub fn buffer_out_of_order(&mut self, order: DeliveredOrder) -> bool {
        if self.out_of_order_buffer.len() >= MAX_OUT_OF_ORDER_BUFFER
            && !self.out_of_order_buffer.contains_key(&order.seq)
        {
            return false;
        }
        self.out_of_order_buffer.insert(order.seq, order);
        true
    }

    pub fn has_buffered_gap(&self) -> bool {
        !self.out_of_order_buffer.is_empty()
    }

    /// Drain every buffered entry that is now contiguous with
    /// `expected_seq`, advancing it as each is drained.
    pub fn drain_contiguous(&mut self) -> Vec<DeliveredOrder> {
        let mut drained = Vec::new();
        while let Some(order) = self.out_of_order_buffer.remove(&self.expected_seq) {
            self.expected_seq += 1;
            drained.push(order);
        }
        drained
    }
}

/// The full state machine for one peer: its identity, its current epoch,
/// its role, and its replicated history.
#[derive(Debug)]
pub struct PeerState {
    pub node_id: NodeId,
    pub current_epoch: Epoch,
    pub role: Role,
    pub replica: ReplicaState,
}

impl PeerState {
    pub fn new(node_id: NodeId) -> Self {
        PeerState {
            node_id,
            current_epoch: 0,
            role: Role::Follower { binding: None },
            replica: ReplicaState::default(),
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self.role, Role::Leader(_))
    }
}

/// `PeerState` plus its durable WAL, under one lock (spec §5: WAL append,
/// in-memory advance, and broadcast enqueue happen as a single step).
pub struct Shared {
    pub state: PeerState,
    pub wal: Wal,
}

impl Shared {
    pub fn new(state: PeerState, wal: Wal) -> Self {
        Shared { state, wal }
    }
}
