//! Transport layer (spec §4.1): a best-effort datagram bus for discovery,
//! heartbeats, and election, and a reliable length-framed TCP stream for
//! order replication.

mod datagram_bus;
mod stream_transport;

pub use datagram_bus::{DatagramBus, DatagramBusError};
pub use stream_transport::{StreamTransportError, read_framed, write_framed};
