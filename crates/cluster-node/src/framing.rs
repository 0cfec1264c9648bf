//! Newline-delimited frame reading.
//!
//! Every read is bounded twice: in time by a deadline, and in size by
//! [`MAX_PACKET_SIZE`], so a silent or misbehaving peer can neither hang a
//! reader nor exhaust memory.

use cluster_core::{CodecError, DELIMITER, MAX_PACKET_SIZE, Packet};
use std::io;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("no data received within {0:?}")]
    Timeout(Duration),
    #[error("connection closed by peer")]
    Closed,
    #[error("frame exceeds max size ({MAX_PACKET_SIZE} bytes)")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Read and decode the next frame, waiting at most `deadline`.
pub async fn read_packet<R>(reader: &mut R, deadline: Duration) -> Result<Packet, ReadError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let read = async {
        let mut limited = (&mut *reader).take(MAX_PACKET_SIZE as u64 + 1);
        limited.read_until(DELIMITER, &mut buf).await
    };
    let n = tokio::time::timeout(deadline, read)
        .await
        .map_err(|_| ReadError::Timeout(deadline))??;

    if n == 0 {
        return Err(ReadError::Closed);
    }
    if buf.last() != Some(&DELIMITER) {
        // Either the size cap cut the line short or the peer hung up mid-frame
        return Err(if buf.len() > MAX_PACKET_SIZE {
            ReadError::TooLarge
        } else {
            ReadError::Closed
        });
    }
    Ok(Packet::decode(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncWriteExt, BufReader};

    #[tokio::test]
    async fn test_reads_consecutive_frames() {
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut reader = BufReader::new(rx);

        let first = Packet::new("node-a", "chat", "one").unwrap();
        let second = Packet::new("node-a", "chat", "two").unwrap();
        let mut data = first.encode().unwrap();
        data.extend(second.encode().unwrap());
        tx.write_all(&data).await.unwrap();

        let timeout = Duration::from_secs(1);
        assert_eq!(read_packet(&mut reader, timeout).await.unwrap(), first);
        assert_eq!(read_packet(&mut reader, timeout).await.unwrap(), second);
    }

    #[tokio::test]
    async fn test_timeout() {
        let (_tx, rx) = tokio::io::duplex(64);
        let mut reader = BufReader::new(rx);

        let result = read_packet(&mut reader, Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ReadError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_eof() {
        let (tx, rx) = tokio::io::duplex(64);
        drop(tx);
        let mut reader = BufReader::new(rx);

        let result = read_packet(&mut reader, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ReadError::Closed)));
    }

    #[tokio::test]
    async fn test_partial_frame_then_eof() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"{\"name\":").await.unwrap();
        drop(tx);
        let mut reader = BufReader::new(rx);

        let result = read_packet(&mut reader, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ReadError::Closed)));
    }

    #[tokio::test]
    async fn test_garbage_is_codec_error() {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(b"hello there\n").await.unwrap();
        let mut reader = BufReader::new(rx);

        let result = read_packet(&mut reader, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(ReadError::Codec(CodecError::Decode(_)))));
    }
}
