//! Local application-submission forwarding (spec.md §2 "payload →
//! Follower → Leader", SPEC_FULL §4.10).
//!
//! Bridges whatever an [`ApplicationSink`] produces (by default, one
//! submission per stdin line) to the stream transport: a local submission
//! becomes a `NewOrder` sent to whichever peer currently holds (or is) the
//! leader. The resulting `Order` isn't read back here — it arrives, in
//! order, through this peer's own replica (or self-delivery) path, same as
//! any other submitter's, and is handed to the sink from there.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use obus_protocol::{DataMessage, NewOrder};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PeerError;
use crate::net::write_framed;
use crate::sequencer;
use crate::sink::ApplicationSink;
use crate::state::{Role, Shared};

const SUBMIT_RETRY_BACKOFF: Duration = Duration::from_millis(300);

/// Drain `rx` for as long as this peer runs, forwarding each submission to
/// the current leader (or, if this peer is itself leader, sequencing it
/// in-process via the exact path a remote submission would take).
pub async fn run_local_submitter(
    shared: Arc<Mutex<Shared>>,
    sink: Arc<Mutex<Box<dyn ApplicationSink>>>,
    mut rx: mpsc::Receiver<NewOrder>,
    cancel: CancellationToken,
) -> Result<(), PeerError> {
    loop {
        let new_order = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            received = rx.recv() => match received {
                Some(new_order) => new_order,
                None => return Ok(()), // sink's submission source ran dry (e.g. stdin EOF)
            },
        };
        forward_until_delivered(&shared, &sink, new_order, &cancel).await?;
    }
}

enum Target {
    SelfLeader,
    Remote(SocketAddr),
    Unknown,
}

/// Keep retrying a submission until it is handed off (locally sequenced or
/// sent upstream), or this peer is cancelled. A follower with no leader
/// bound yet (e.g. mid-election) just waits it out rather than dropping
/// the submission; `seen_payload_ids` dedup makes this safe to retry
/// indefinitely without risk of double-sequencing once it lands.
async fn forward_until_delivered(
    shared: &Arc<Mutex<Shared>>,
    sink: &Arc<Mutex<Box<dyn ApplicationSink>>>,
    new_order: NewOrder,
    cancel: &CancellationToken,
) -> Result<(), PeerError> {
    loop {
        let target = {
            let guard = shared.lock().await;
            match &guard.state.role {
                Role::Leader(_) => Target::SelfLeader,
                Role::Follower {
                    binding: Some(binding),
                } => Target::Remote(binding.leader_stream_endpoint),
                _ => Target::Unknown,
            }
        };

        match target {
            Target::SelfLeader => {
                sequencer::handle_new_order(shared, sink, new_order).await?;
                return Ok(());
            }
            Target::Remote(addr) => match submit_to(addr, &new_order).await {
                Ok(()) => return Ok(()),
                Err(e) => debug!(error = %e, %addr, "submission to leader failed, will retry"),
            },
            Target::Unknown => {}
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(SUBMIT_RETRY_BACKOFF) => {}
        }
    }
}

async fn submit_to(addr: SocketAddr, new_order: &NewOrder) -> Result<(), PeerError> {
    let mut stream = TcpStream::connect(addr).await?;
    write_framed(&mut stream, &DataMessage::NewOrder(new_order.clone())).await?;
    Ok(())
}
