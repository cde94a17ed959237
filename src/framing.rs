//! Length-prefixed framing: every payload travels as `u32 BE length` + bytes.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{LinkError, Result};

pub const LENGTH_PREFIX_LEN: usize = 4;

/// Builds a complete frame in one contiguous buffer (queued writer path).
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Writes one frame and flushes (synchronous send path).
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one frame. `Ok(None)` means the peer shut down cleanly at a frame
/// boundary; EOF inside a frame is an error. A non-zero `max_frame_len`
/// rejects oversized frames before allocating for them.
pub async fn read_frame<R>(reader: &mut R, max_frame_len: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; LENGTH_PREFIX_LEN];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(LinkError::Network(err)),
    }

    let len = u32::from_be_bytes(prefix) as usize;
    if max_frame_len > 0 && len > max_frame_len {
        return Err(LinkError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_frame_prefixes_length() {
        let frame = encode_frame(b"abc");
        assert_eq!(&frame[..4], &3u32.to_be_bytes());
        assert_eq!(&frame[4..], b"abc");

        let empty = encode_frame(b"");
        assert_eq!(&empty[..], &0u32.to_be_bytes());
    }

    #[tokio::test]
    async fn frame_round_trip_various_sizes() {
        for payload in [vec![], vec![0x42], vec![7u8; 10_000]] {
            let (mut a, b) = tokio::io::duplex(64 * 1024);
            write_frame(&mut a, &payload).await.unwrap();
            drop(a);

            let (mut reader, _w) = tokio::io::split(b);
            let got = read_frame(&mut reader, 0).await.unwrap().unwrap();
            assert_eq!(got, payload);
            assert!(read_frame(&mut reader, 0).await.unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn back_to_back_frames_arrive_in_order() {
        let (mut a, b) = tokio::io::duplex(64 * 1024);
        for i in 0u8..10 {
            write_frame(&mut a, &[i; 100]).await.unwrap();
        }
        drop(a);

        let (mut reader, _w) = tokio::io::split(b);
        for i in 0u8..10 {
            let got = read_frame(&mut reader, 0).await.unwrap().unwrap();
            assert_eq!(got, vec![i; 100]);
        }
        assert!(read_frame(&mut reader, 0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut a, b) = tokio::io::duplex(1024);
        use tokio::io::AsyncWriteExt;
        a.write_all(&100u32.to_be_bytes()).await.unwrap();
        a.write_all(b"short").await.unwrap();
        drop(a);

        let (mut reader, _w) = tokio::io::split(b);
        let err = read_frame(&mut reader, 0).await.unwrap_err();
        assert!(matches!(err, LinkError::Network(_)));
    }

    #[tokio::test]
    async fn oversized_frame_rejected_without_reading_payload() {
        let (mut a, b) = tokio::io::duplex(1024);
        use tokio::io::AsyncWriteExt;
        a.write_all(&(1_000_000u32).to_be_bytes()).await.unwrap();

        let (mut reader, _w) = tokio::io::split(b);
        let err = read_frame(&mut reader, 64 * 1024).await.unwrap_err();
        assert!(matches!(
            err,
            LinkError::FrameTooLarge { len: 1_000_000, max: 65_536 }
        ));
    }
}
