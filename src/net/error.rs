use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    /// Wrong leading tag, too few frames or an unreadable block.
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    /// Parallel arrays disagree with each other or with the declared count.
    #[error("length mismatch in `{field}`: expected {expected}, got {actual}")]
    LengthMismatch {
        field: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("message has {0} frames, more than allowed")]
    TooManyFrames(u32),
    #[error("frame of {0} bytes exceeds the frame size limit")]
    FrameTooLarge(u32),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("timed out waiting for a reply")]
    Timeout,
    #[error("gave up reconnecting to the broker after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    #[error("no run is open")]
    NoOpenRun,
    #[error("could not archive run record: {0}")]
    Archive(String),
    #[error("run file is corrupt: {0}")]
    CorruptRun(String),
}

impl Error {
    pub(crate) fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedRequest(reason.into())
    }
}
