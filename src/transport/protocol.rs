//! Wire framing.
//!
//! Every envelope travels as one frame:
//!
//! ```text
//! +----------------+------------------------+
//! | Length (u32 BE)| Envelope bytes         |
//! | 4 bytes        | `length` bytes         |
//! +----------------+------------------------+
//! ```
//!
//! The length is checked against the configured ceiling before any body
//! bytes are read, so an oversized declaration never allocates.

use crate::utils::{NetworkError, ProtocolError, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of the length prefix in bytes
pub const FRAME_HEADER_SIZE: usize = 4;

fn transport_error(err: std::io::Error) -> NetworkError {
    NetworkError::Transport {
        reason: err.to_string(),
    }
}

/// Read one length-prefixed frame
///
/// # Errors
///
/// Returns `ProtocolError::EmptyFrame` for a zero length,
/// `ProtocolError::FrameTooLarge` when the declared length exceeds
/// `max_frame_size`, and `NetworkError::Transport` if the stream fails or
/// closes early.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_u32().await.map_err(transport_error)? as usize;

    if length == 0 {
        return Err(ProtocolError::EmptyFrame.into());
    }
    if length > max_frame_size {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max: max_frame_size,
        }
        .into());
    }

    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await.map_err(transport_error)?;
    Ok(body)
}

/// Write one length-prefixed frame and flush
pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if body.is_empty() {
        return Err(ProtocolError::EmptyFrame.into());
    }
    let length = u32::try_from(body.len()).map_err(|_| ProtocolError::FrameTooLarge {
        size: body.len(),
        max: u32::MAX as usize,
    })?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(body);

    writer.write_all(&frame).await.map_err(transport_error)?;
    writer.flush().await.map_err(transport_error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MessengerError;

    #[tokio::test]
    async fn test_frame_round_trip() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"envelope").await.unwrap();
        assert_eq!(&wire[..4], &8u32.to_be_bytes());

        let mut reader = wire.as_slice();
        let body = read_frame(&mut reader, 1024).await.unwrap();
        assert_eq!(body, b"envelope");
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected_before_body() {
        // Declares 2048 bytes but carries none.
        let wire = 2048u32.to_be_bytes();
        let mut reader = &wire[..];
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(
            err,
            MessengerError::Protocol(ProtocolError::FrameTooLarge { size: 2048, max: 1024 })
        ));
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        let wire = 0u32.to_be_bytes();
        let mut reader = &wire[..];
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, MessengerError::Protocol(ProtocolError::EmptyFrame)));

        let mut sink = Vec::new();
        assert!(write_frame(&mut sink, b"").await.is_err());
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let mut wire = 10u32.to_be_bytes().to_vec();
        wire.extend_from_slice(b"short");
        let mut reader = wire.as_slice();
        let err = read_frame(&mut reader, 1024).await.unwrap_err();
        assert!(matches!(err, MessengerError::Network(NetworkError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_frame_split_across_reads() {
        let mut mock = tokio_test::io::Builder::new()
            .read(&5u32.to_be_bytes()[..2])
            .read(&5u32.to_be_bytes()[2..])
            .read(b"hel")
            .read(b"lo")
            .build();

        let body = read_frame(&mut mock, 1024).await.unwrap();
        assert_eq!(body, b"hello");
    }

    #[tokio::test]
    async fn test_write_frame_bytes() {
        let mut mock = tokio_test::io::Builder::new()
            .write(&[0, 0, 0, 3, b'a', b'b', b'c'])
            .build();
        tokio_test::assert_ok!(write_frame(&mut mock, b"abc").await);
    }

    #[tokio::test]
    async fn test_frame_over_duplex() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let payload = vec![0xAB; 300];

        let writer = tokio::spawn(async move {
            write_frame(&mut client, &payload).await.unwrap();
        });
        let body = read_frame(&mut server, 1024).await.unwrap();
        writer.await.unwrap();

        assert_eq!(body.len(), 300);
        assert!(body.iter().all(|b| *b == 0xAB));
    }
}
