//! In-process test harness: spins up a cluster of real [`peer::Peer`]
//! instances on loopback, each with its own temporary WAL directory and an
//! OS-assigned TCP port, wired together in single-host discovery mode.
//!
//! Mirrors the teacher's mock-server/mock-client harness pattern, but
//! drives genuine `Peer` instances end to end rather than a stand-in
//! protocol endpoint, since the thing under test here is the cluster's
//! emergent behavior (who gets elected, who catches up) rather than one
//! connection's handshake.

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use obus_protocol::{DataMessage, NewOrder, NodeId, Order};
use peer::net::{read_framed, write_framed};
use peer::sink::SinkKind;
use peer::{Cli, Config, Peer};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct TestNode {
    pub id: NodeId,
    pub tcp_port: u16,
    _wal_dir: TempDir,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
}

impl TestCluster {
    /// Spawn `size` peers, ids `1..=size`, all on `127.0.0.1` in
    /// single-host discovery mode.
    pub async fn spawn(size: u32) -> Self {
        let cluster_ids: Vec<NodeId> = (1..=size).collect();
        let mut nodes = Vec::with_capacity(size as usize);

        for &id in &cluster_ids {
            let wal_dir = tempfile::tempdir().expect("create temp wal dir");
            let tcp_port = free_tcp_port().await;

            let cli = Cli {
                id,
                role: None,
                cluster: cluster_ids.clone(),
                tcp_port,
                bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                wal_dir: wal_dir.path().to_path_buf(),
                ui: SinkKind::Log,
                single_host: true,
            };
            let config = Config::try_from(cli).expect("valid test cluster config");
            let peer = Peer::new(config).await.expect("peer must bind cleanly in tests");
            let cancel = peer.cancellation_token();
            let handle = tokio::spawn(async move {
                let _ = peer.run().await;
            });

            nodes.push(TestNode {
                id,
                tcp_port,
                _wal_dir: wal_dir,
                cancel,
                handle,
            });
        }

        TestCluster { nodes }
    }

    /// `127.0.0.1:<tcp_port>` for the given node id, for tests that want to
    /// assert against a specific peer's advertised stream endpoint.
    pub fn stream_endpoint(&self, id: NodeId) -> std::net::SocketAddr {
        let port = self
            .nodes
            .iter()
            .find(|n| n.id == id)
            .expect("unknown node id")
            .tcp_port;
        std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// Cancel every node and wait for its task to wind down.
    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.cancel.cancel();
        }
        for node in self.nodes {
            let _ = node.handle.await;
        }
    }

    /// Cancel a single node without tearing down the rest of the cluster,
    /// to simulate a crash.
    pub fn kill(&self, id: NodeId) {
        if let Some(node) = self.nodes.iter().find(|n| n.id == id) {
            node.cancel.cancel();
        }
    }

    /// Poll every node's stream-transport port until one of them answers a
    /// probe submission, returning its endpoint. Used because the cluster
    /// doesn't expose "who is leader" directly — only the leader serves
    /// stream-transport connections at all, so the probe doubles as the
    /// discovery mechanism.
    pub async fn find_leader(&self, timeout: Duration) -> std::net::SocketAddr {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            for node in &self.nodes {
                let addr = std::net::SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), node.tcp_port);
                if let Some(addr) = probe_one(addr, node.id).await {
                    return addr;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("no leader became reachable within {timeout:?}");
            }
            tokio::time::sleep(Duration::from_millis(150)).await;
        }
    }

    /// Submit one payload to `leader_addr` and wait for it to come back as
    /// a sequenced `Order` on the same connection.
    pub async fn submit(
        &self,
        leader_addr: std::net::SocketAddr,
        payload_id: &str,
        submitter_id: NodeId,
        body: Vec<u8>,
    ) -> Order {
        let mut stream = TcpStream::connect(leader_addr)
            .await
            .expect("connect to leader");
        write_framed(
            &mut stream,
            &DataMessage::NewOrder(NewOrder {
                payload_id: payload_id.to_owned(),
                submitter_id,
                submit_timestamp: 0,
                body,
            }),
        )
        .await
        .expect("submit order");
        loop {
            match read_framed(&mut stream).await.expect("read order back") {
                DataMessage::Order(order) if order.payload_id == payload_id => return order,
                _ => continue,
            }
        }
    }
}

async fn probe_one(addr: std::net::SocketAddr, node_id: NodeId) -> Option<std::net::SocketAddr> {
    let connect = tokio::time::timeout(Duration::from_millis(200), TcpStream::connect(addr)).await;
    let mut stream = connect.ok()?.ok()?;

    let probe_id = format!("__probe_{node_id}_{}", addr.port());
    write_framed(
        &mut stream,
        &DataMessage::NewOrder(NewOrder {
            payload_id: probe_id.clone(),
            submitter_id: 0,
            submit_timestamp: 0,
            body: Vec::new(),
        }),
    )
    .await
    .ok()?;

    loop {
        let frame = tokio::time::timeout(Duration::from_millis(300), read_framed(&mut stream)).await;
        match frame {
            Ok(Ok(DataMessage::Order(order))) if order.payload_id == probe_id => {
                return Some(addr);
            }
            Ok(Ok(_)) => continue,
            _ => return None,
        }
    }
}

/// Also exported for tests that want ad hoc sleeps without importing tokio
/// directly; most cluster convergence assertions need to wait out at least
/// one election/heartbeat cycle.
pub async fn settle(duration: Duration) {
    tokio::time::sleep(duration).await;
}

async fn free_tcp_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind an ephemeral port");
    listener.local_addr().expect("listener has a local addr").port()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn free_tcp_port_returns_a_usable_port() {
        let port = free_tcp_port().await;
        assert!(port > 0);
    }
}
