//! Top-level wiring: construct every subsystem and run them to completion
//! (or until cancelled).

use std::net::SocketAddr;
use std::sync::Arc;

use obus_wal::Wal;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::constants::{DISCOVERY_PORT, NODE_UDP_BASE};
use crate::election;
use crate::error::PeerError;
use crate::failure_detector;
use crate::net::DatagramBus;
use crate::replica;
use crate::sequencer;
use crate::sink::{self, ApplicationSink};
use crate::state::{PeerState, Role, Shared};
use crate::discovery;
use crate::submission;

pub struct Peer {
    config: Config,
    shared: Arc<Mutex<Shared>>,
    sink: Arc<Mutex<Box<dyn ApplicationSink>>>,
    discovery_bus: Arc<DatagramBus>,
    election_bus: Arc<DatagramBus>,
    cancel: CancellationToken,
}

impl Peer {
    pub async fn new(config: Config) -> Result<Self, PeerError> {
        let wal = Wal::open(&config.wal_path())?;
        // spec.md §4.9/§7: replay reconstructs `history` and validates it;
        // a non-monotonic WAL is an invariant violation this peer must
        // refuse to start over, not silently patch around.
        let records = wal.replay()?;

        let mut state = PeerState::new(config.id);
        if let Some(last) = records.last() {
            state.current_epoch = last.epoch;
            state.replica.expected_seq = last.seq + 1;
        } else {
            state.replica.expected_seq = 1;
        }

        let shared = Arc::new(Mutex::new(Shared::new(state, wal)));

        let discovery_bind: SocketAddr = SocketAddr::new(config.bind_ip, DISCOVERY_PORT);
        let election_bind: SocketAddr =
            SocketAddr::new(config.bind_ip, NODE_UDP_BASE + config.id as u16);

        let extra_targets = if config.single_host {
            vec![SocketAddr::new([127, 0, 0, 1].into(), 0)]
        } else {
            vec![]
        };

        let discovery_bus = Arc::new(DatagramBus::bind(discovery_bind, extra_targets.clone()).await?);
        let election_bus = Arc::new(DatagramBus::bind(election_bind, extra_targets).await?);

        let sink = Arc::new(Mutex::new(sink::build_sink(config.ui)));

        if let Some(hint) = config.role_hint {
            info!(node_id = config.id, role_hint = %hint, "starting with operator role hint (informational only; election decides)");
        }

        Ok(Peer {
            config,
            shared,
            sink,
            discovery_bus,
            election_bus,
            cancel: CancellationToken::new(),
        })
    }

    /// A handle that, when cancelled, cleanly shuts down every subsystem
    /// spawned by `run`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub async fn run(self) -> Result<(), PeerError> {
        let own_stream_endpoint = SocketAddr::new(self.config.bind_ip, self.config.tcp_port);
        let peer_ip = self.config.bind_ip;
        let cluster = self.config.cluster.clone();

        let mut handles = Vec::new();

        handles.push(tokio::spawn(discovery::run_announcer(
            self.shared.clone(),
            self.discovery_bus.clone(),
            self.config.id,
            own_stream_endpoint,
            self.cancel.clone(),
        )));

        {
            let shared = self.shared.clone();
            let bus = self.discovery_bus.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                discovery::run_listener(shared, bus, own_stream_endpoint, cancel).await
            }));
        }

        {
            let shared = self.shared.clone();
            let bus = self.discovery_bus.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                failure_detector::run_heartbeat_emitter(shared, bus, cancel).await
            }));
        }

        {
            let shared = self.shared.clone();
            let bus = self.election_bus.clone();
            let cluster = cluster.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                failure_detector::run_liveness_watcher(shared, bus, cluster, peer_ip, cancel).await
            }));
        }

        {
            let shared = self.shared.clone();
            let bus = self.election_bus.clone();
            let cluster = cluster.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                election::run(shared, bus, cluster, peer_ip, cancel).await
            }));
        }

        {
            let shared = self.shared.clone();
            let sink = self.sink.clone();
            let bind_addr = own_stream_endpoint;
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                sequencer::run_accept_loop(shared, sink, bind_addr, cancel).await
            }));
        }

        {
            let shared = self.shared.clone();
            let sink = self.sink.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                run_replica_supervisor(shared, sink, cancel).await
            }));
        }

        {
            let submit_rx = {
                let sink_guard = self.sink.lock().await;
                sink_guard.submit_stream(self.config.id)
            };
            let shared = self.shared.clone();
            let sink = self.sink.clone();
            let cancel = self.cancel.clone();
            handles.push(tokio::spawn(async move {
                submission::run_local_submitter(shared, sink, submit_rx, cancel).await
            }));
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "subsystem task exited with an error"),
                Err(e) => error!(error = %e, "subsystem task panicked"),
            }
        }
        Ok(())
    }
}

/// Watches `PeerState::role` for the current `LeaderBinding` and keeps
/// exactly one [`replica::run_connection`] task alive for it, restarting
/// when the binding changes (new leader, new epoch) and stopping when
/// this peer is not bound to anyone (or is itself leader).
async fn run_replica_supervisor(
    shared: Arc<Mutex<Shared>>,
    sink: Arc<Mutex<Box<dyn ApplicationSink>>>,
    cancel: CancellationToken,
) -> Result<(), PeerError> {
    let mut current: Option<(u32, u64, CancellationToken)> = None;
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(200));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Some((_, _, token)) = current.take() {
                    token.cancel();
                }
                return Ok(());
            }
            _ = ticker.tick() => {}
        }

        let binding = {
            let guard = shared.lock().await;
            match &guard.state.role {
                Role::Follower { binding: Some(b) } => Some(b.clone()),
                _ => None,
            }
        };

        match (&binding, &current) {
            (Some(b), Some((id, epoch, _))) if b.leader_id == *id && b.leader_epoch == *epoch => {
                // Already connected to this leader at this epoch.
            }
            (Some(b), _) => {
                if let Some((_, _, token)) = current.take() {
                    token.cancel();
                }
                let conn_cancel = cancel.child_token();
                let shared = shared.clone();
                let sink = sink.clone();
                let b = b.clone();
                info!(leader_id = b.leader_id, epoch = b.leader_epoch, "connecting to leader");
                let conn_cancel_for_task = conn_cancel.clone();
                tokio::spawn(async move {
                    if let Err(e) = replica::run_connection(shared, sink, b, conn_cancel_for_task).await {
                        error!(error = %e, "leader connection ended");
                    }
                });
                current = Some((b.leader_id, b.leader_epoch, conn_cancel));
            }
            (None, Some((_, _, token))) => {
                token.cancel();
                current = None;
            }
            (None, None) => {}
        }
    }
}
