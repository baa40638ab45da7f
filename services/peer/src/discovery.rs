//! Discovery and leader liveness (spec §4.5, §4.2).
//!
//! An unbound peer (no `LeaderBinding`) periodically broadcasts
//! `WHO_IS_LEADER` on the discovery bus until the current leader answers.
//! The leader answers every `WHO_IS_LEADER` it sees and periodically
//! broadcasts `LEADER_ALIVE`; every peer uses `LEADER_ALIVE` sightings to
//! reset the staleness clock the failure detector watches.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use obus_protocol::{ControlMessage, IAmLeader, WhoIsLeader};
use tokio::sync::Mutex;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::constants::{DISCOVERY_INTERVAL, DISCOVERY_PORT};
use crate::error::PeerError;
use crate::net::DatagramBus;
use crate::state::{LeaderBinding, Role, Shared};

/// Broadcast `WHO_IS_LEADER` every `DISCOVERY_INTERVAL` while unbound.
/// Stops announcing once a binding exists or this peer becomes leader —
/// there is nothing left to discover.
pub async fn run_announcer(
    shared: Arc<Mutex<Shared>>,
    bus: Arc<DatagramBus>,
    node_id: obus_protocol::NodeId,
    own_stream_endpoint: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), PeerError> {
    let mut ticker = interval(DISCOVERY_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let needs_discovery = {
            let guard = shared.lock().await;
            matches!(guard.state.role, Role::Follower { binding: None })
        };
        if !needs_discovery {
            continue;
        }
        let msg = ControlMessage::WhoIsLeader(WhoIsLeader {
            sender_id: node_id,
            sender_stream_endpoint: own_stream_endpoint.to_string(),
        });
        if let Err(e) = bus.send_broadcast(&msg, DISCOVERY_PORT).await {
            debug!(error = %e, "discovery broadcast failed, will retry");
        }
    }
}

/// Listen on the discovery bus for `WHO_IS_LEADER`, `I_AM_LEADER`, and
/// `LEADER_ALIVE`. Replies to discovery queries if this peer is leader,
/// and otherwise folds sightings into this peer's `LeaderBinding`.
pub async fn run_listener(
    shared: Arc<Mutex<Shared>>,
    bus: Arc<DatagramBus>,
    own_stream_endpoint: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), PeerError> {
    loop {
        let (msg, src) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            recv = bus.recv() => recv?,
        };
        match msg {
            ControlMessage::WhoIsLeader(_) => {
                handle_who_is_leader(&shared, &bus, own_stream_endpoint, src).await?;
            }
            ControlMessage::IAmLeader(reply) => {
                handle_i_am_leader(&shared, reply, src).await;
            }
            ControlMessage::LeaderAlive(beat) => {
                handle_leader_alive(&shared, beat).await;
            }
            // Election/Answer/Coordinator are handled by the election
            // listener on the per-node port; a stray copy here (if any
            // implementation ever broadcasts one to this port) is ignored.
            _ => {}
        }
    }
}

async fn handle_who_is_leader(
    shared: &Arc<Mutex<Shared>>,
    bus: &Arc<DatagramBus>,
    own_stream_endpoint: SocketAddr,
    src: SocketAddr,
) -> Result<(), PeerError> {
    let guard = shared.lock().await;
    let Role::Leader(leader_state) = &guard.state.role else {
        return Ok(());
    };
    let reply = ControlMessage::IAmLeader(IAmLeader {
        leader_id: guard.state.node_id,
        leader_ip: own_stream_endpoint.ip().to_string(),
        leader_stream_endpoint: own_stream_endpoint.to_string(),
        epoch: leader_state.epoch,
        last_seq: leader_state.next_seq.saturating_sub(1),
    });
    drop(guard);
    bus.send_to(&reply, src).await?;
    Ok(())
}

async fn handle_i_am_leader(shared: &Arc<Mutex<Shared>>, reply: IAmLeader, src: SocketAddr) {
    let Ok(endpoint) = reply.leader_stream_endpoint.parse::<SocketAddr>() else {
        debug!(endpoint = %reply.leader_stream_endpoint, "unparseable leader endpoint, ignoring");
        return;
    };
    let mut guard = shared.lock().await;
    if matches!(guard.state.role, Role::Leader(_)) {
        return;
    }
    if reply.epoch < guard.state.current_epoch {
        return;
    }
    info!(leader_id = reply.leader_id, epoch = reply.epoch, from = %src, "learned of leader");
    guard.state.current_epoch = reply.epoch;
    guard.state.role = Role::Follower {
        binding: Some(LeaderBinding {
            leader_id: reply.leader_id,
            leader_stream_endpoint: endpoint,
            leader_epoch: reply.epoch,
            last_seen: Instant::now(),
        }),
    };
}

async fn handle_leader_alive(shared: &Arc<Mutex<Shared>>, beat: obus_protocol::LeaderAlive) {
    let mut guard = shared.lock().await;
    if matches!(guard.state.role, Role::Leader(_)) {
        return;
    }
    if let Role::Follower {
        binding: Some(binding),
    } = &mut guard.state.role
    {
        if binding.leader_id == beat.leader_id && binding.leader_epoch == beat.epoch {
            binding.last_seen = Instant::now();
            return;
        }
    }
    // Heard a heartbeat for a leader/epoch we have no binding for (or a
    // stale one). We don't have its stream endpoint from this message
    // alone; the announcer's next WHO_IS_LEADER broadcast will pick up
    // the endpoint once the leader answers it.
    if beat.epoch >= guard.state.current_epoch {
        guard.state.current_epoch = beat.epoch;
    }
}
