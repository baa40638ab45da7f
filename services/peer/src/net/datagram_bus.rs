//! Best-effort datagram bus (spec §4.1).
//!
//! A thin wrapper over a `tokio::net::UdpSocket` with `SO_BROADCAST`
//! enabled. Every send/receive carries one self-contained `ControlMessage`,
//! JSON-encoded, capped at [`MAX_DATAGRAM_SIZE`]. The bus makes no promise
//! beyond best-effort: a send that succeeds locally may still be lost,
//! reordered, or duplicated on the wire, and callers must be built to
//! tolerate that (the failure detector, discovery, and election modules
//! all are).

use std::net::SocketAddr;

use obus_protocol::ControlMessage;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::constants::MAX_DATAGRAM_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum DatagramBusError {
    #[error("bind failed: {0}")]
    Bind(#[source] std::io::Error),
    #[error("send failed: {0}")]
    Send(#[source] std::io::Error),
    #[error("recv failed: {0}")]
    Recv(#[source] std::io::Error),
    #[error("serialization failed: {0}")]
    Serialize(#[source] serde_json::Error),
}

pub struct DatagramBus {
    socket: UdpSocket,
    /// Destinations `send_broadcast` fans out to, in addition to
    /// `255.255.255.255`. In single-host mode this is `127.0.0.1` so that
    /// peers sharing one machine (and thus one link-local broadcast
    /// domain of exactly one member) still see each other's broadcasts.
    extra_broadcast_targets: Vec<SocketAddr>,
}

impl DatagramBus {
    /// Bind a new bus at `bind_addr` with broadcast sends enabled.
    ///
    /// Built through `socket2` rather than `UdpSocket::bind` directly so
    /// `SO_REUSEADDR`/`SO_REUSEPORT` can be set before binding: the fixed
    /// discovery port is bound by every peer on a host, and a test
    /// harness running several peers in one process on loopback needs the
    /// same port shared the same way production peers on separate hosts
    /// share it.
    pub async fn bind(
        bind_addr: SocketAddr,
        extra_broadcast_targets: Vec<SocketAddr>,
    ) -> Result<Self, DatagramBusError> {
        let domain = if bind_addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };
        let raw = socket2::Socket::new(domain, socket2::Type::DGRAM, None)
            .map_err(DatagramBusError::Bind)?;
        raw.set_reuse_address(true).map_err(DatagramBusError::Bind)?;
        #[cfg(unix)]
        raw.set_reuse_port(true).map_err(DatagramBusError::Bind)?;
        raw.set_nonblocking(true).map_err(DatagramBusError::Bind)?;
        raw.bind(&bind_addr.into()).map_err(DatagramBusError::Bind)?;
        raw.set_broadcast(true).map_err(DatagramBusError::Bind)?;

        let socket = UdpSocket::from_std(raw.into()).map_err(DatagramBusError::Bind)?;
        Ok(DatagramBus {
            socket,
            extra_broadcast_targets,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send one message to a single destination.
    pub async fn send_to(
        &self,
        msg: &ControlMessage,
        dest: SocketAddr,
    ) -> Result<(), DatagramBusError> {
        let bytes = serde_json::to_vec(msg).map_err(DatagramBusError::Serialize)?;
        if bytes.len() > MAX_DATAGRAM_SIZE {
            warn!(len = bytes.len(), "outbound datagram exceeds size cap, dropping");
            return Ok(());
        }
        self.socket
            .send_to(&bytes, dest)
            .await
            .map_err(DatagramBusError::Send)?;
        Ok(())
    }

    /// Broadcast a message to the subnet broadcast address, the IPv4
    /// global broadcast address, and every configured extra target
    /// (single-host discovery destinations, per spec §4.5).
    pub async fn send_broadcast(
        &self,
        msg: &ControlMessage,
        port: u16,
    ) -> Result<(), DatagramBusError> {
        let global_broadcast: SocketAddr = ([255, 255, 255, 255], port).into();
        self.send_to(msg, global_broadcast).await?;
        for target in &self.extra_broadcast_targets {
            let mut target = *target;
            target.set_port(port);
            self.send_to(msg, target).await?;
        }
        Ok(())
    }

    /// Blocking receive of the next well-formed message. Malformed records
    /// are logged and skipped (spec §7: "malformed record: discard, log,
    /// continue; never fatal") rather than returned as an error, so the
    /// caller's read loop never has to special-case parse failures.
    pub async fn recv(&self) -> Result<(ControlMessage, SocketAddr), DatagramBusError> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, src) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(DatagramBusError::Recv)?;
            match serde_json::from_slice::<ControlMessage>(&buf[..len]) {
                Ok(msg) => return Ok((msg, src)),
                Err(e) => {
                    debug!(error = %e, from = %src, "discarding malformed datagram");
                    continue;
                }
            }
        }
    }
}
