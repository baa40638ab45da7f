//! Heartbeat emission and leader-liveness watching (spec §4.2).
//!
//! Two independent loops: a leader emits `LEADER_ALIVE` redundantly every
//! `HEARTBEAT_INTERVAL`; every non-leader peer watches its `LeaderBinding`
//! and calls an election once `LEADER_TIMEOUT` has elapsed since the last
//! sighting (or, if it never had one, once the startup grace period runs
//! out).

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use obus_protocol::{ControlMessage, LeaderAlive, NodeId};
use rand::Rng;
use tokio::sync::Mutex;
use tokio::time::{interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::constants::{
    DISCOVERY_PORT, HEARTBEAT_INTERVAL, HEARTBEAT_REDUNDANCY, LEADER_TIMEOUT,
    STARTUP_GRACE_JITTER_MAX,
};
use crate::election;
use crate::error::PeerError;
use crate::net::DatagramBus;
use crate::state::{Role, Shared};

/// Leader-side: broadcast `LEADER_ALIVE` every tick, each time sent
/// `HEARTBEAT_REDUNDANCY` times back to back to tolerate a lossy link.
pub async fn run_heartbeat_emitter(
    shared: Arc<Mutex<Shared>>,
    bus: Arc<DatagramBus>,
    cancel: CancellationToken,
) -> Result<(), PeerError> {
    let mut ticker = interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }
        let beat = {
            let guard = shared.lock().await;
            let Role::Leader(leader_state) = &guard.state.role else {
                continue;
            };
            ControlMessage::LeaderAlive(LeaderAlive {
                leader_id: guard.state.node_id,
                epoch: leader_state.epoch,
                last_seq: leader_state.next_seq.saturating_sub(1),
            })
        };
        for _ in 0..HEARTBEAT_REDUNDANCY {
            bus.send_broadcast(&beat, DISCOVERY_PORT).await?;
        }
    }
}

/// Non-leader side: watch for the leader going stale or never being found,
/// and call an election when it does.
pub async fn run_liveness_watcher(
    shared: Arc<Mutex<Shared>>,
    election_bus: Arc<DatagramBus>,
    cluster: Vec<NodeId>,
    peer_ip: IpAddr,
    cancel: CancellationToken,
) -> Result<(), PeerError> {
    let startup_jitter = {
        let mut rng = rand::thread_rng();
        Duration::from_millis(rng.gen_range(0..STARTUP_GRACE_JITTER_MAX.as_millis() as u64))
    };
    tokio::select! {
        _ = cancel.cancelled() => return Ok(()),
        _ = sleep(startup_jitter) => {}
    }

    let mut ticker = interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = ticker.tick() => {}
        }

        let should_campaign = {
            let guard = shared.lock().await;
            match &guard.state.role {
                Role::Leader(_) | Role::Campaigning { .. } | Role::AwaitingCoronation { .. } => {
                    false
                }
                Role::Follower { binding: None } => true,
                Role::Follower {
                    binding: Some(binding),
                } => Instant::now().duration_since(binding.last_seen) > LEADER_TIMEOUT,
            }
        };

        if should_campaign {
            warn!("leader considered unreachable, calling election");
            election::start_campaign(&shared, &election_bus, &cluster, peer_ip).await?;
        }
    }
}
