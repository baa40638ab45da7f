// obus-protocol: wire types for the order-bus replication protocol.
//
// Two families of message travel over two different transports:
//
// - `ControlMessage` rides the datagram bus (UDP, best-effort, lossy):
//   discovery and election chatter, plus leader heartbeats.
// - `DataMessage` rides the stream transport (TCP, reliable, in-order):
//   order submission, sequenced broadcast, and gap-fill requests.
//
// Both are tagged unions serialized with `serde_json`; the `kind` field
// (derived from the variant name via `#[serde(tag = "kind")]`) makes
// every record self-describing on the wire.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Shared scalars
// ---------------------------------------------------------------------------

pub type NodeId = u32;
pub type Epoch = u64;
pub type Seq = u64;

// ---------------------------------------------------------------------------
// Control messages (datagram bus)
// ---------------------------------------------------------------------------

/// An unbound peer's query for the current leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhoIsLeader {
    pub sender_id: NodeId,
    /// The sender's own stream-transport endpoint, in case it is later elected.
    pub sender_stream_endpoint: String,
}

/// The leader's unicast reply to `WhoIsLeader`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IAmLeader {
    pub leader_id: NodeId,
    pub leader_ip: String,
    pub leader_stream_endpoint: String,
    pub epoch: Epoch,
    pub last_seq: Seq,
}

/// Periodic leader liveness broadcast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderAlive {
    pub leader_id: NodeId,
    pub epoch: Epoch,
    pub last_seq: Seq,
}

/// Bully campaign announcement, sent to every higher-id peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Election {
    pub candidate_id: NodeId,
    pub epoch: Epoch,
}

/// Reply to `Election` from a higher-id peer, preempting the campaign.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Answer {
    pub responder_id: NodeId,
    pub epoch: Epoch,
}

/// Announces the winner of an election (or an already-settled leadership).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinator {
    pub leader_id: NodeId,
    pub epoch: Epoch,
}

/// All datagram-bus message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum ControlMessage {
    WhoIsLeader(WhoIsLeader),
    IAmLeader(IAmLeader),
    LeaderAlive(LeaderAlive),
    Election(Election),
    Answer(Answer),
    Coordinator(Coordinator),
}

// ---------------------------------------------------------------------------
// Data messages (stream transport)
// ---------------------------------------------------------------------------

/// A payload submission, Follower (or local client) -> Leader.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOrder {
    /// Minted by the submitter; used solely for leader-side dedup.
    pub payload_id: String,
    pub submitter_id: NodeId,
    pub submit_timestamp: u64,
    pub body: Vec<u8>,
}

/// A sequenced, durable order, Leader -> Follower (per-connection, in order).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    pub epoch: Epoch,
    pub seq: Seq,
    pub payload_id: String,
    pub submitter_id: NodeId,
    pub submit_timestamp: u64,
    pub body: Vec<u8>,
}

/// A retransmission request, Follower -> Leader: "send me everything from
/// `from_seq` onward" — `seq` is a single stream across epochs, so this
/// makes no reference to epoch at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResendRequest {
    pub from_seq: Seq,
}

/// All stream-transport message kinds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
#[serde(rename_all = "snake_case")]
pub enum DataMessage {
    NewOrder(NewOrder),
    Order(Order),
    ResendRequest(ResendRequest),
}

impl Order {
    pub fn as_delivered(&self) -> DeliveredOrder {
        DeliveredOrder {
            epoch: self.epoch,
            seq: self.seq,
            payload_id: self.payload_id.clone(),
            submitter_id: self.submitter_id,
            submit_timestamp: self.submit_timestamp,
            body: self.body.clone(),
        }
    }
}

/// An order after it has been durably sequenced and is ready for delivery
/// to the application sink. Identical fields to `Order`; kept as a distinct
/// type so sink implementors don't accidentally depend on wire framing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveredOrder {
    pub epoch: Epoch,
    pub seq: Seq,
    pub payload_id: String,
    pub submitter_id: NodeId,
    pub submit_timestamp: u64,
    pub body: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_message_round_trips_through_json() {
        let msg = ControlMessage::Election(Election {
            candidate_id: 3,
            epoch: 7,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"kind\":\"election\""));
        let back: ControlMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn data_message_round_trips_through_json() {
        let msg = DataMessage::Order(Order {
            epoch: 1,
            seq: 42,
            payload_id: "abc".to_owned(),
            submitter_id: 2,
            submit_timestamp: 0,
            body: b"hello".to_vec(),
        });
        let json = serde_json::to_string(&msg).unwrap();
        let back: DataMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(msg, back);
    }

    #[test]
    fn order_as_delivered_preserves_fields() {
        let order = Order {
            epoch: 2,
            seq: 5,
            payload_id: "p1".to_owned(),
            submitter_id: 10,
            submit_timestamp: 123,
            body: b"order body".to_vec(),
        };
        let delivered = order.as_delivered();
        assert_eq!(delivered.epoch, order.epoch);
        assert_eq!(delivered.seq, order.seq);
        assert_eq!(delivered.payload_id, order.payload_id);
        assert_eq!(delivered.body, order.body);
    }
}
