//! Leader-side order sequencing (spec §4.3, §5).
//!
//! Accepts stream-transport connections from followers (and from local
//! submitters), assigns each accepted `NEW_ORDER` the next dense sequence
//! number in the current epoch, appends it to the WAL, and fans it out to
//! every connected follower. Also services `RESEND_REQUEST` by replaying
//! from the WAL — the same durable store the live path writes to, so a
//! follower can never be told "no such order" for anything the leader has
//! ever broadcast.

use std::net::SocketAddr;
use std::sync::Arc;

use obus_protocol::{DataMessage, NewOrder, Order, Seq};
use obus_wal::WalRecord;
use tokio::io::AsyncWrite;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PeerError;
use crate::net::{StreamTransportError, read_framed, write_framed};
use crate::sink::ApplicationSink;
use crate::state::{ConnectionId, FollowerProgress, Role, Shared};

/// Accept stream-transport connections for as long as this process runs.
/// Every peer listens regardless of current role; a connection is only
/// served while this peer is leader at the time it arrives, since a
/// follower has no order history of its own to serve from.
pub async fn run_accept_loop(
    shared: Arc<Mutex<Shared>>,
    sink: Arc<Mutex<Box<dyn ApplicationSink>>>,
    bind_addr: SocketAddr,
    cancel: CancellationToken,
) -> Result<(), PeerError> {
    let listener = TcpListener::bind(bind_addr).await?;
    let mut next_conn_id: ConnectionId = 0;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                next_conn_id += 1;
                let conn_id = next_conn_id;
                let shared = shared.clone();
                let sink = sink.clone();
                let conn_cancel = cancel.child_token();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(shared, sink, stream, conn_id, conn_cancel).await {
                        debug!(error = %e, from = %addr, "follower connection ended");
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    shared: Arc<Mutex<Shared>>,
    sink: Arc<Mutex<Box<dyn ApplicationSink>>>,
    stream: TcpStream,
    conn_id: ConnectionId,
    cancel: CancellationToken,
) -> Result<(), PeerError> {
    let (mut read_half, mut write_half) = stream.into_split();

    let mut broadcast_rx = {
        let guard = shared.lock().await;
        let Role::Leader(leader_state) = &guard.state.role else {
            return Ok(());
        };
        leader_state.broadcast_tx.subscribe()
    };

    // Followers drive their own catch-up by sending `RESEND_REQUEST`
    // immediately after connecting (see `replica::run_connection`), so
    // there is nothing to replay proactively here — a connection that
    // never asks for history (e.g. a bare submitter) gets none, which is
    // correct: it only cares about the order it is about to submit.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_framed(&mut read_half) => {
                match frame {
                    Ok(DataMessage::NewOrder(new_order)) => {
                        handle_new_order(&shared, &sink, new_order).await?;
                    }
                    Ok(DataMessage::ResendRequest(req)) => {
                        catch_up(&shared, &mut write_half, conn_id, req.from_seq).await?;
                    }
                    Ok(DataMessage::Order(_)) => {
                        // Followers never push Order upstream; ignore if one arrives.
                    }
                    Err(StreamTransportError::Closed) => return Ok(()),
                    Err(e) => return Err(e.into()),
                }
            }
            recv = broadcast_rx.recv() => {
                match recv {
                    Ok(order) => forward_if_new(&shared, &mut write_half, conn_id, order).await?,
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let from_seq = {
                            let guard = shared.lock().await;
                            let Role::Leader(leader_state) = &guard.state.role else { continue; };
                            leader_state
                                .followers
                                .get(&conn_id)
                                .map(|p| p.last_sent + 1)
                                .unwrap_or(1)
                        };
                        catch_up(&shared, &mut write_half, conn_id, from_seq).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                }
            }
        }
    }
}

/// Accept one submitted order: dedup, assign `(epoch, seq)`, append to the
/// WAL, and enqueue for broadcast, all under one lock (spec §5). The leader
/// is its own first deliverer (spec §4.7 step 4), so it also advances its
/// own replica watermark and hands the order to the local application sink,
/// exactly as a follower would on receiving it over the wire.
pub(crate) async fn handle_new_order(
    shared: &Arc<Mutex<Shared>>,
    sink: &Arc<Mutex<Box<dyn ApplicationSink>>>,
    new_order: NewOrder,
) -> Result<(), PeerError> {
    let delivered = {
        let mut guard = shared.lock().await;
        let Role::Leader(leader_state) = &guard.state.role else {
            return Ok(());
        };
        if leader_state.seen_payload_ids.contains(&new_order.payload_id) {
            return Ok(());
        }
        let order = Order {
            epoch: leader_state.epoch,
            seq: leader_state.next_seq,
            payload_id: new_order.payload_id,
            submitter_id: new_order.submitter_id,
            submit_timestamp: new_order.submit_timestamp,
            body: new_order.body,
        };
        let record = WalRecord {
            epoch: order.epoch,
            seq: order.seq,
            payload_id: order.payload_id.clone(),
            submitter_id: order.submitter_id,
            submit_timestamp: order.submit_timestamp,
            body: order.body.clone(),
        };
        guard.wal.append(&record)?;

        let Role::Leader(leader_state) = &mut guard.state.role else {
            unreachable!("role cannot change while holding the lock");
        };
        leader_state.next_seq += 1;
        leader_state.seen_payload_ids.insert(order.payload_id.clone());
        let _ = leader_state.broadcast_tx.send(order.clone());
        guard.state.replica.expected_seq = order.seq + 1;
        order.as_delivered()
    };
    sink.lock().await.deliver(&delivered);
    Ok(())
}

async fn forward_if_new<W: AsyncWrite + Unpin>(
    shared: &Arc<Mutex<Shared>>,
    write_half: &mut W,
    conn_id: ConnectionId,
    order: Order,
) -> Result<(), PeerError> {
    let should_send = {
        let mut guard = shared.lock().await;
        let Role::Leader(leader_state) = &mut guard.state.role else {
            return Ok(());
        };
        let progress = leader_state
            .followers
            .entry(conn_id)
            .or_insert(FollowerProgress { last_sent: 0 });
        if order.seq > progress.last_sent {
            progress.last_sent = order.seq;
            true
        } else {
            false
        }
    };
    if should_send {
        write_framed(write_half, &DataMessage::Order(order)).await?;
    }
    Ok(())
}

/// Replay every WAL record from `from_seq` onward, regardless of which
/// epoch assigned it — `seq` is a single stream across epochs (spec.md
/// §3), so a follower catching up across a leader failover still needs
/// the tail of the previous epoch, not just the current one — and send
/// each as an `Order` frame, then record the new watermark so the live
/// broadcast path doesn't resend what catch-up just delivered.
async fn catch_up<W: AsyncWrite + Unpin>(
    shared: &Arc<Mutex<Shared>>,
    write_half: &mut W,
    conn_id: ConnectionId,
    from_seq: Seq,
) -> Result<(), PeerError> {
    let records = {
        let guard = shared.lock().await;
        if !matches!(guard.state.role, Role::Leader(_)) {
            return Ok(());
        }
        guard
            .wal
            .replay()?
            .into_iter()
            .filter(|r| r.seq >= from_seq)
            .collect::<Vec<_>>()
    };

    let mut last_sent = from_seq.saturating_sub(1);
    for record in records {
        let order = Order {
            epoch: record.epoch,
            seq: record.seq,
            payload_id: record.payload_id,
            submitter_id: record.submitter_id,
            submit_timestamp: record.submit_timestamp,
            body: record.body,
        };
        last_sent = order.seq;
        write_framed(write_half, &DataMessage::Order(order)).await?;
    }

    let mut guard = shared.lock().await;
    if let Role::Leader(leader_state) = &mut guard.state.role {
        leader_state
            .followers
            .insert(conn_id, FollowerProgress { last_sent });
    }
    Ok(())
}
