//! Follower-side order application (spec §4.4, §5).
//!
//! `apply_incoming_order` is a pure function over [`ReplicaState`]: given
//! the next `Order` off the wire, it decides what to durably persist and
//! deliver (in sequence order, with no gaps) and whether a
//! `RESEND_REQUEST` is owed. Keeping it pure (no I/O, no lock) makes the
//! gap-buffering and dense-delivery invariants checkable without a running
//! connection.

use std::sync::Arc;

use obus_protocol::{DataMessage, DeliveredOrder, ResendRequest, Seq};
use obus_wal::WalRecord;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::PeerError;
use crate::net::{StreamTransportError, read_framed, write_framed};
use crate::sink::ApplicationSink;
use crate::state::{LeaderBinding, ReplicaState, Role, Shared};

/// What applying one incoming `Order` requires the caller to do.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct OrderOutcome {
    /// Orders now contiguous with history, in delivery order, each to be
    /// persisted to the WAL and handed to the sink.
    pub to_deliver: Vec<DeliveredOrder>,
    /// Set when a gap was just discovered (or re-discovered) and the
    /// leader should be asked to resend starting here.
    pub resend_from: Option<Seq>,
}

/// Apply one incoming, already-durable-on-the-leader order to replica
/// state. Does not touch the WAL or the sink itself — see [`OrderOutcome`].
pub fn apply_incoming_order(replica: &mut ReplicaState, order: DeliveredOrder) -> OrderOutcome {
    if order.seq < replica.expected_seq {
        return OrderOutcome::default();
    }
    if order.seq == replica.expected_seq {
        replica.expected_seq += 1;
        let mut to_deliver = vec![order];
        to_deliver.extend(replica.drain_contiguous());
        return OrderOutcome {
            to_deliver,
            resend_from: None,
        };
    }

    let was_already_aware_of_a_gap = replica.has_buffered_gap();
    let resend_from = replica.expected_seq;
    replica.buffer_out_of_order(order);
    OrderOutcome {
        to_deliver: Vec::new(),
        resend_from: if was_already_aware_of_a_gap {
            None
        } else {
            Some(resend_from)
        },
    }
}

/// Connect to the current leader and stream orders until the connection
/// drops or this peer stops being a follower bound to that leader.
pub async fn run_connection(
    shared: Arc<Mutex<Shared>>,
    sink: Arc<Mutex<Box<dyn ApplicationSink>>>,
    binding: LeaderBinding,
    cancel: CancellationToken,
) -> Result<(), PeerError> {
    let stream = TcpStream::connect(binding.leader_stream_endpoint).await?;
    let (mut read_half, mut write_half) = stream.into_split();

    let expected_seq = shared.lock().await.state.replica.expected_seq;
    write_framed(
        &mut write_half,
        &DataMessage::ResendRequest(ResendRequest {
            from_seq: expected_seq.max(1),
        }),
    )
    .await?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_framed(&mut read_half) => {
                let msg = match frame {
                    Ok(msg) => msg,
                    Err(StreamTransportError::Closed) => return Ok(()),
                    Err(e) => return Err(e.into()),
                };
                let DataMessage::Order(order) = msg else {
                    continue;
                };
                if !still_bound_to(&shared, &binding).await {
                    return Ok(());
                }
                let outcome = {
                    let mut guard = shared.lock().await;
                    apply_incoming_order(&mut guard.state.replica, order.as_delivered())
                };
                for delivered in outcome.to_deliver {
                    persist_and_deliver(&shared, &sink, delivered).await?;
                }
                if let Some(from_seq) = outcome.resend_from {
                    warn!(from_seq, "gap detected, requesting resend");
                    write_framed(
                        &mut write_half,
                        &DataMessage::ResendRequest(ResendRequest { from_seq }),
                    )
                    .await?;
                }
            }
        }
    }
}

async fn still_bound_to(shared: &Arc<Mutex<Shared>>, binding: &LeaderBinding) -> bool {
    let guard = shared.lock().await;
    matches!(
        &guard.state.role,
        Role::Follower { binding: Some(current) }
            if current.leader_id == binding.leader_id && current.leader_epoch == binding.leader_epoch
    )
}

async fn persist_and_deliver(
    shared: &Arc<Mutex<Shared>>,
    sink: &Arc<Mutex<Box<dyn ApplicationSink>>>,
    order: DeliveredOrder,
) -> Result<(), PeerError> {
    let record = WalRecord {
        epoch: order.epoch,
        seq: order.seq,
        payload_id: order.payload_id.clone(),
        submitter_id: order.submitter_id,
        submit_timestamp: order.submit_timestamp,
        body: order.body.clone(),
    };
    {
        let mut guard = shared.lock().await;
        guard.wal.append(&record)?;
    }
    info!(epoch = order.epoch, seq = order.seq, "applied");
    sink.lock().await.deliver(&order);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(seq: Seq) -> DeliveredOrder {
        DeliveredOrder {
            epoch: 1,
            seq,
            payload_id: format!("p{seq}"),
            submitter_id: 2,
            submit_timestamp: 0,
            body: b"body".to_vec(),
        }
    }

    #[test]
    fn in_order_delivery_advances_expected_seq_and_delivers_immediately() {
        let mut replica = ReplicaState {
            expected_seq: 1,
            ..Default::default()
        };
        let outcome = apply_incoming_order(&mut replica, order(1));
        assert_eq!(outcome.to_deliver, vec![order(1)]);
        assert_eq!(outcome.resend_from, None);
        assert_eq!(replica.expected_seq, 2);
    }

    #[test]
    fn a_gap_is_buffered_and_triggers_exactly_one_resend_request() {
        let mut replica = ReplicaState {
            expected_seq: 1,
            ..Default::default()
        };
        let first = apply_incoming_order(&mut replica, order(3));
        assert!(first.to_deliver.is_empty());
        assert_eq!(first.resend_from, Some(1));

        let second = apply_incoming_order(&mut replica, order(4));
        assert!(second.to_deliver.is_empty());
        assert_eq!(second.resend_from, None, "should not re-request while a gap is already known");
    }

    #[test]
    fn filling_a_gap_drains_every_buffered_entry_in_order() {
        let mut replica = ReplicaState {
            expected_seq: 1,
            ..Default::default()
        };
        apply_incoming_order(&mut replica, order(2));
        apply_incoming_order(&mut replica, order(3));
        let outcome = apply_incoming_order(&mut replica, order(1));

        assert_eq!(
            outcome.to_deliver.iter().map(|o| o.seq).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(replica.expected_seq, 4);
        assert!(replica.out_of_order_buffer.is_empty());
    }

    #[test]
    fn an_order_already_applied_is_ignored() {
        let mut replica = ReplicaState {
            expected_seq: 5,
            ..Default::default()
        };
        let outcome = apply_incoming_order(&mut replica, order(3));
        assert_eq!(outcome, OrderOutcome::default());
        assert_eq!(replica.expected_seq, 5);
    }
}
