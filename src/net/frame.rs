use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{error::Error, Frame, Frames};

/// Upper bound on frames per message. PHOTONDATA behind a routing envelope
/// is the largest legitimate message at 17 frames.
pub const MAX_FRAMES: u32 = 64;

/// Upper bound on a single frame.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Writes multi-frame messages as `count | (len | bytes)*`, all lengths
/// u32 little-endian.
pub struct FrameSendStream<W>(W);

impl<W: AsyncWrite + Unpin> FrameSendStream<W> {
    pub fn new(stream: W) -> Self {
        Self(stream)
    }

    pub async fn send(&mut self, frames: &[Frame]) -> Result<(), Error> {
        if frames.len() > MAX_FRAMES as usize {
            return Err(Error::TooManyFrames(frames.len() as u32));
        }
        let len = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
        let mut buf = Vec::with_capacity(len);
        buf.extend_from_slice(&(frames.len() as u32).to_le_bytes());
        for frame in frames {
            if frame.len() > MAX_FRAME_LEN as usize {
                let len = u32::try_from(frame.len()).unwrap_or(u32::MAX);
                return Err(Error::FrameTooLarge(len));
            }
            buf.extend_from_slice(&(frame.len() as u32).to_le_bytes());
            buf.extend_from_slice(frame);
        }
        self.0.write_all(&buf).await?;
        self.0.flush().await?;
        Ok(())
    }
}

pub struct FrameRecvStream<R>(R);

impl<R: AsyncRead + Unpin> FrameRecvStream<R> {
    pub fn new(stream: R) -> Self {
        Self(stream)
    }

    /// Reads the next message. A clean end of stream between messages is
    /// `Error::ConnectionClosed`.
    ///
    /// Not cancel safe: a dropped future may leave a message half read.
    pub async fn recv(&mut self) -> Result<Frames, Error> {
        let mut len_buf = [0u8; 4];
        match self.0.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(Error::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        }
        let count = u32::from_le_bytes(len_buf);
        if count > MAX_FRAMES {
            return Err(Error::TooManyFrames(count));
        }

        let mut frames = Vec::with_capacity(count as usize);
        for _ in 0..count {
            self.0.read_exact(&mut len_buf).await?;
            let len = u32::from_le_bytes(len_buf);
            if len > MAX_FRAME_LEN {
                return Err(Error::FrameTooLarge(len));
            }
            let mut frame = vec![0u8; len as usize];
            self.0.read_exact(&mut frame).await?;
            frames.push(frame);
        }
        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn messages_keep_frame_boundaries() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = FrameSendStream::new(a);
        let mut rx = FrameRecvStream::new(b);

        let first = vec![b"client".to_vec(), vec![], b"PING".to_vec()];
        tx.send(&first).await.unwrap();
        tx.send(&[]).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), first);
        assert!(rx.recv().await.unwrap().is_empty());

        drop(tx);
        assert!(matches!(rx.recv().await, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn oversized_frame_count_is_rejected() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&(MAX_FRAMES + 1).to_le_bytes()).await.unwrap();
        let mut rx = FrameRecvStream::new(b);
        assert!(matches!(rx.recv().await, Err(Error::TooManyFrames(65))));
    }

    #[tokio::test]
    async fn truncated_message_is_an_io_error() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&1u32.to_le_bytes()).await.unwrap();
        a.write_all(&10u32.to_le_bytes()).await.unwrap();
        a.write_all(b"abc").await.unwrap();
        drop(a);
        let mut rx = FrameRecvStream::new(b);
        assert!(matches!(rx.recv().await, Err(Error::Io(_))));
    }
}
