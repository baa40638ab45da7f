//! Bully leader election (spec §4.6).
//!
//! Five transitions: a Follower whose leader has gone stale (or who never
//! found one) campaigns by sending `ELECTION` to every higher-id peer; a
//! higher-id peer answers and starts its own campaign; a campaigner that
//! times out without an answer declares itself winner and broadcasts
//! `COORDINATOR`; every peer that sees a `COORDINATOR` at an epoch no
//! lower than its own adopts the announced leader.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;

use obus_protocol::{ControlMessage, Coordinator, Election, NodeId};
use tokio::sync::Mutex;
use tokio::time::sleep_until;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::constants::{COORDINATOR_TIMEOUT, DISCOVERY_PORT, ELECTION_TIMEOUT, NODE_UDP_BASE};
use crate::error::PeerError;
use crate::net::DatagramBus;
use crate::state::{LeaderState, Role, Shared};

/// The per-node datagram address every peer computes locally from the
/// (statically known) cluster membership and a shared bind address —
/// there is no discovery step for these, since `NODE_UDP_BASE + id` is
/// a protocol constant.
pub fn peer_addr(ip: IpAddr, node_id: NodeId) -> SocketAddr {
    SocketAddr::new(ip, NODE_UDP_BASE + node_id as u16)
}

/// Start (or restart) a campaign: bump the epoch, announce `ELECTION` to
/// every higher-id cluster member, and arm the `ELECTION_TIMEOUT`. Called
/// by the failure detector when the current leader goes stale, at startup
/// when no leader is discovered within the startup grace period, and by a
/// sitting leader itself when challenged by a lower-id peer's `ELECTION`
/// (spec.md §4.6 trigger 3 is unconditional — a leader re-campaigns and,
/// having no higher-id peer to lose to, immediately re-coronates at a new
/// epoch rather than silently ignoring the challenge).
pub async fn start_campaign(
    shared: &Arc<Mutex<Shared>>,
    election_bus: &DatagramBus,
    cluster: &[NodeId],
    peer_ip: IpAddr,
) -> Result<(), PeerError> {
    let (epoch, node_id, higher_ids) = {
        let mut guard = shared.lock().await;
        let epoch = guard.state.current_epoch + 1;
        let node_id = guard.state.node_id;
        guard.state.current_epoch = epoch;
        guard.state.role = Role::Campaigning {
            epoch,
            deadline: Instant::now() + ELECTION_TIMEOUT,
        };
        let higher_ids: Vec<NodeId> = cluster.iter().copied().filter(|&id| id > node_id).collect();
        (epoch, node_id, higher_ids)
    };

    info!(epoch, node_id, "starting campaign");

    if higher_ids.is_empty() {
        return begin_coronation(shared, election_bus, cluster, peer_ip, epoch).await;
    }

    let msg = ControlMessage::Election(Election {
        candidate_id: node_id,
        epoch,
    });
    for id in higher_ids {
        election_bus.send_to(&msg, peer_addr(peer_ip, id)).await?;
    }
    Ok(())
}

async fn begin_coronation(
    shared: &Arc<Mutex<Shared>>,
    election_bus: &DatagramBus,
    cluster: &[NodeId],
    peer_ip: IpAddr,
    epoch: u64,
) -> Result<(), PeerError> {
    {
        let mut guard = shared.lock().await;
        guard.state.role = Role::AwaitingCoronation {
            epoch,
            deadline: Instant::now() + COORDINATOR_TIMEOUT,
        };
    }
    announce_coordinator(shared, election_bus, cluster, peer_ip, epoch).await
}

async fn announce_coordinator(
    shared: &Arc<Mutex<Shared>>,
    election_bus: &DatagramBus,
    cluster: &[NodeId],
    peer_ip: IpAddr,
    epoch: u64,
) -> Result<(), PeerError> {
    let node_id = shared.lock().await.state.node_id;
    let msg = ControlMessage::Coordinator(Coordinator {
        leader_id: node_id,
        epoch,
    });
    election_bus.send_broadcast(&msg, DISCOVERY_PORT).await?;
    for id in cluster.iter().copied().filter(|&id| id != node_id) {
        election_bus.send_to(&msg, peer_addr(peer_ip, id)).await?;
    }
    Ok(())
}

async fn finalize_leadership(shared: &Arc<Mutex<Shared>>, epoch: u64) {
    let mut guard = shared.lock().await;
    let seen = guard.wal.seen_payload_ids().unwrap_or_default();
    // spec.md §3/§4.9: seq is a single stream across epochs, so the new
    // leader continues from `last_seq_previous_epoch + 1`, not 1 — this
    // peer's own replica already tracks that watermark as `expected_seq`
    // (reconstructed from WAL replay at startup, advanced on every delivery
    // since).
    let next_seq = guard.state.replica.expected_seq.max(1);
    guard.state.current_epoch = epoch;
    guard.state.role = Role::Leader(LeaderState::new(epoch, next_seq, seen));
    info!(epoch, next_seq, node_id = guard.state.node_id, "became leader");
}

/// Drive the election state machine: listen on the election bus for
/// `ELECTION`/`ANSWER`/`COORDINATOR`, and race that against this peer's
/// own campaign timers.
pub async fn run(
    shared: Arc<Mutex<Shared>>,
    election_bus: Arc<DatagramBus>,
    cluster: Vec<NodeId>,
    peer_ip: IpAddr,
    cancel: CancellationToken,
) -> Result<(), PeerError> {
    loop {
        let deadline = {
            let guard = shared.lock().await;
            match &guard.state.role {
                Role::Campaigning { deadline, .. } => Some(*deadline),
                Role::AwaitingCoronation { deadline, .. } => Some(*deadline),
                _ => None,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = sleep_until(deadline.unwrap_or_else(|| Instant::now() + std::time::Duration::from_secs(3600)).into()), if deadline.is_some() => {
                handle_timeout(&shared, &election_bus, &cluster, peer_ip).await?;
            }
            recv = election_bus.recv() => {
                let (msg, _src) = recv?;
                handle_message(&shared, &election_bus, &cluster, peer_ip, msg).await?;
            }
        }
    }
}

async fn handle_timeout(
    shared: &Arc<Mutex<Shared>>,
    election_bus: &DatagramBus,
    cluster: &[NodeId],
    peer_ip: IpAddr,
) -> Result<(), PeerError> {
    let snapshot = shared.lock().await.state.role.clone_kind();
    match snapshot {
        RoleKind::Campaigning(epoch) => {
            begin_coronation(shared, election_bus, cluster, peer_ip, epoch).await?;
        }
        RoleKind::AwaitingCoronation(epoch) => {
            finalize_leadership(shared, epoch).await;
        }
        RoleKind::Other => {}
    }
    Ok(())
}

async fn handle_message(
    shared: &Arc<Mutex<Shared>>,
    election_bus: &DatagramBus,
    cluster: &[NodeId],
    peer_ip: IpAddr,
    msg: ControlMessage,
) -> Result<(), PeerError> {
    match msg {
        ControlMessage::Election(election) => {
            let (node_id, epoch) = {
                let guard = shared.lock().await;
                (guard.state.node_id, guard.state.current_epoch)
            };
            if election.candidate_id < node_id {
                let answer = ControlMessage::Answer(obus_protocol::Answer {
                    responder_id: node_id,
                    epoch: epoch.max(election.epoch),
                });
                election_bus
                    .send_to(&answer, peer_addr(peer_ip, election.candidate_id))
                    .await?;

                // Only an in-progress campaign already at or above this
                // election's epoch suppresses starting a new one — a
                // sitting `Leader` must still re-campaign when challenged
                // (spec.md §4.6 trigger 3, scenario S5), or its epoch never
                // advances and its heartbeats are permanently rejected as
                // stale by a challenger that outran it.
                let already_running_at_or_above = {
                    let guard = shared.lock().await;
                    matches!(
                        &guard.state.role,
                        Role::Campaigning { epoch: e, .. } | Role::AwaitingCoronation { epoch: e, .. }
                            if *e >= election.epoch
                    )
                };
                if !already_running_at_or_above {
                    start_campaign(shared, election_bus, cluster, peer_ip).await?;
                }
            }
        }
        ControlMessage::Answer(answer) => {
            let mut guard = shared.lock().await;
            let should_step_down = matches!(
                &guard.state.role,
                Role::Campaigning { epoch, .. } if answer.epoch >= *epoch
            );
            if should_step_down {
                info!(from = answer.responder_id, "outranked, stepping down");
                guard.state.role = Role::Follower { binding: None };
            }
        }
        ControlMessage::Coordinator(coordinator) => {
            let mut guard = shared.lock().await;
            if coordinator.epoch < guard.state.current_epoch {
                return Ok(());
            }
            guard.state.current_epoch = coordinator.epoch;
            if coordinator.leader_id == guard.state.node_id {
                return Ok(());
            }
            // spec.md §4.6 transition 4: a coordinator at an epoch no lower
            // than our own unconditionally steps us down if we were leading
            // — two peers can momentarily both believe themselves leader
            // only until the first cross-message, per the epoch-monotonicity
            // correctness argument in §4.6.
            let was_leader = matches!(guard.state.role, Role::Leader(_));
            guard.state.role = Role::Follower { binding: None };
            if was_leader {
                info!(
                    leader_id = coordinator.leader_id,
                    epoch = coordinator.epoch,
                    "stepping down: another peer was coordinated leader at this epoch"
                );
            } else {
                info!(
                    leader_id = coordinator.leader_id,
                    epoch = coordinator.epoch,
                    "adopted new leader from coordinator announcement"
                );
            }
        }
        _ => {}
    }
    Ok(())
}

enum RoleKind {
    Campaigning(u64),
    AwaitingCoronation(u64),
    Other,
}

impl Role {
    fn clone_kind(&self) -> RoleKind {
        match self {
            Role::Campaigning { epoch, .. } => RoleKind::Campaigning(*epoch),
            Role::AwaitingCoronation { epoch, .. } => RoleKind::AwaitingCoronation(*epoch),
            _ => RoleKind::Other,
        }
    }
}
