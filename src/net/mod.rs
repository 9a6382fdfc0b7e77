use std::{borrow::Borrow, fmt};

pub mod client;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod wire;

pub use error::Error;

/// A single block of a multi-frame message.
pub type Frame = Vec<u8>;

/// An ordered multi-frame message.
pub type Frames = Vec<Frame>;

pub const FRONTEND_PORT: u16 = 5555;
pub const BACKEND_PORT: u16 = 5556;

/// Opaque routing identity of a peer connected to a [`endpoint::Router`].
///
/// Displayed as lowercase hex so it can be logged.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Address(Vec<u8>);

impl Address {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_frame(self) -> Frame {
        self.0
    }
}

impl From<Vec<u8>> for Address {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<&[u8]> for Address {
    fn from(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }
}

impl Borrow<[u8]> for Address {
    fn borrow(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}
