//! Length-framed TCP stream transport (spec §4.1, reliable ordered channel).
//!
//! Generalizes the byte-oriented fanout pattern into a typed, bidirectional
//! framing of [`obus_protocol::DataMessage`]: each frame is a 4-byte
//! big-endian length prefix followed by that many bytes of `serde_json`.
//! The accept loop, per-connection task, and `broadcast`-channel fanout
//! that use these helpers live in [`crate::sequencer`] (Leader side) and
//! [`crate::replica`] (Follower side).

use obus_protocol::DataMessage;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frames larger than this are refused rather than allocated for, so a
/// corrupt or adversarial length prefix can't be used to exhaust memory.
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum StreamTransportError {
    #[error("connection closed")]
    Closed,
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    FrameTooLarge(u32),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Write one length-prefixed `DataMessage` frame and flush it.
pub async fn write_framed<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &DataMessage,
) -> Result<(), StreamTransportError> {
    let bytes = serde_json::to_vec(msg)?;
    let len = u32::try_from(bytes.len()).map_err(|_| StreamTransportError::FrameTooLarge(u32::MAX))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed `DataMessage` frame. Returns
/// [`StreamTransportError::Closed`] on a clean EOF before any bytes of the
/// next frame arrive, distinguishing a graceful disconnect from a torn read.
pub async fn read_framed<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<DataMessage, StreamTransportError> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(StreamTransportError::Closed);
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(StreamTransportError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let msg = serde_json::from_slice(&body)?;
    Ok(msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use obus_protocol::{NewOrder, Order};
    use std::io::Cursor;

    #[tokio::test]
    async fn a_frame_written_is_read_back_unchanged() {
        let msg = DataMessage::NewOrder(NewOrder {
            payload_id: "p1".into(),
            submitter_id: 9,
            submit_timestamp: 1,
            body: b"hello".to_vec(),
        });

        let mut buf = Vec::new();
        write_framed(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let read_back = read_framed(&mut cursor).await.unwrap();
        assert_eq!(read_back, msg);
    }

    #[tokio::test]
    async fn reading_past_the_last_frame_reports_closed() {
        let msg = DataMessage::Order(Order {
            epoch: 1,
            seq: 1,
            payload_id: "p1".into(),
            submitter_id: 2,
            submit_timestamp: 1,
            body: b"hello".to_vec(),
        });
        let mut buf = Vec::new();
        write_framed(&mut buf, &msg).await.unwrap();

        let mut cursor = Cursor::new(buf);
        read_framed(&mut cursor).await.unwrap();
        let err = read_framed(&mut cursor).await.unwrap_err();
        assert!(matches!(err, StreamTransportError::Closed));
    }

    #[tokio::test]
    async fn an_oversized_length_prefix_is_rejected_before_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_LEN + 1).to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let err = read_framed(&mut cursor).await.unwrap_err();
        assert!(matches!(err, StreamTransportError::FrameTooLarge(_)));
    }
}
