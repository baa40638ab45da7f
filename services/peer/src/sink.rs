//! Application delivery sinks (SPEC_FULL §4.10).
//!
//! The replication engine's job ends at "deliver this order, in order,
//! exactly once." What happens to a delivered order is the application's
//! business, expressed here as a small trait with two concrete
//! implementations standing in for the two ends of the original
//! kitchen/waiter pairing the distilled spec dropped.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use obus_protocol::{DeliveredOrder, NewOrder, NodeId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::info;

/// Where a sequenced, durable order goes once it has been delivered, and
/// where a local submission comes from.
pub trait ApplicationSink: Send + Sync {
    fn deliver(&mut self, order: &DeliveredOrder);

    /// Spawn whatever local producer this sink uses and return a channel
    /// of submissions to forward to the leader (SPEC_FULL §4.10). The
    /// default reads one submission per stdin line, minting a fresh
    /// `payload_id`; a headless peer with no stdin attached simply sees
    /// the channel close at EOF, which is harmless — it only means this
    /// node never originates its own submissions.
    fn submit_stream(&self, submitter_id: NodeId) -> mpsc::Receiver<NewOrder> {
        spawn_stdin_submitter(submitter_id)
    }
}

fn spawn_stdin_submitter(submitter_id: NodeId) -> mpsc::Receiver<NewOrder> {
    let (tx, rx) = mpsc::channel(64);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) if !line.is_empty() => {
                    let new_order = NewOrder {
                        payload_id: uuid::Uuid::new_v4().to_string(),
                        submitter_id,
                        submit_timestamp: now_unix(),
                        body: line.into_bytes(),
                    };
                    if tx.send(new_order).await.is_err() {
                        return;
                    }
                }
                Ok(Some(_)) => {} // blank line, nothing to submit
                Ok(None) => return, // EOF
                Err(_) => return,
            }
        }
    });
    rx
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Which concrete sink `--ui` selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SinkKind {
    /// Structured `tracing` log line per delivered order. Default; has no
    /// external dependency, useful for headless nodes and tests.
    Log,
    /// Stands in for the kitchen display: prints what to prepare.
    Kitchen,
    /// Stands in for the waiter terminal: prints what is ready to serve.
    Waiter,
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SinkKind::Log => "log",
            SinkKind::Kitchen => "kitchen",
            SinkKind::Waiter => "waiter",
        };
        f.write_str(s)
    }
}

pub fn build_sink(kind: SinkKind) -> Box<dyn ApplicationSink> {
    match kind {
        SinkKind::Log => Box::new(LogSink),
        SinkKind::Kitchen => Box::new(KitchenSink),
        SinkKind::Waiter => Box::new(WaiterSink),
    }
}

struct LogSink;

impl ApplicationSink for LogSink {
    fn deliver(&mut self, order: &DeliveredOrder) {
        info!(
            epoch = order.epoch,
            seq = order.seq,
            payload_id = %order.payload_id,
            "delivered"
        );
    }
}

/// Prints orders as prep tickets, one line per delivery, in delivery order.
struct KitchenSink;

impl ApplicationSink for KitchenSink {
    fn deliver(&mut self, order: &DeliveredOrder) {
        println!(
            "[kitchen] ticket #{}.{} ({} bytes) from node {}",
            order.epoch,
            order.seq,
            order.body.len(),
            order.submitter_id
        );
    }
}

/// Prints orders as ready-to-serve notices.
struct WaiterSink;

impl ApplicationSink for WaiterSink {
    fn deliver(&mut self, order: &DeliveredOrder) {
        println!(
            "[waiter] order #{}.{} ready to serve (submitted by node {})",
            order.epoch, order.seq, order.submitter_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(seq: u64) -> DeliveredOrder {
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
    fn build_sink_produces_the_requested_kind_without_panicking_on_deliver() {
        for kind in [SinkKind::Log, SinkKind::Kitchen, SinkKind::Waiter] {
            let mut sink = build_sink(kind);
            sink.deliver(&sample(1));
        }
    }

    #[tokio::test]
    async fn submit_stream_does_not_panic_and_is_a_live_channel() {
        let sink = build_sink(SinkKind::Log);
        let mut rx = sink.submit_stream(1);
        // Don't assume anything about what's attached to stdin under a test
        // runner; just prove the channel is usable and the spawned reader
        // doesn't panic before anything arrives.
        let _ = tokio::time::timeout(std::time::Duration::from_millis(20), rx.recv()).await;
    }
}
