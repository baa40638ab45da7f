//! Top-level error type, aggregating every submodule's error enum.

use crate::net::{DatagramBusError, StreamTransportError};
use obus_wal::WalError;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("datagram bus error: {0}")]
    DatagramBus(#[from] DatagramBusError),
    #[error("stream transport error: {0}")]
    StreamTransport(#[from] StreamTransportError),
    #[error("wal error: {0}")]
    Wal(#[from] WalError),
    #[error("config error: {0}")]
    Config(#[from] crate::config::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
