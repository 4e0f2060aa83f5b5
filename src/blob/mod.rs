// Content-addressed blob storage
//
// Every audio artifact (chunks and the transmissions split out of them) is
// stored under the SHA-256 of its bytes. Keys are the only addressing
// scheme; storing the same bytes twice is a no-op.

mod disk;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

pub use disk::DiskStorage;

/// Number of raw bytes in a blob key.
pub const KEY_LENGTH: usize = 32;

/// A blob's address: the SHA-256 of its contents.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; KEY_LENGTH]);

impl Key {
    /// The key the blob store would use for these bytes.
    pub fn for_bytes(data: &[u8]) -> Key {
        Key(Sha256::digest(data).into())
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LENGTH] {
        &self.0
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({self})")
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum KeyError {
    #[error("blob keys are {KEY_LENGTH} bytes, got {0}")]
    WrongLength(usize),
    #[error("blob keys are hex-encoded: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

impl FromStr for Key {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let buffer: [u8; KEY_LENGTH] = bytes
            .try_into()
            .map_err(|b: Vec<u8>| KeyError::WrongLength(b.len()))?;
        Ok(Key(buffer))
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("storage server error: {0}")]
    Server(String),
}

/// A content-addressable storage layer.
///
/// All methods are safe to call concurrently.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Upload a blob, returning the key it is stored under. Storing bytes
    /// that already exist succeeds without rewriting them.
    async fn store(&self, data: &[u8]) -> Result<Key, StorageError>;

    /// Create a link that can be used to download an item. The link stays
    /// valid for at least `valid_for`.
    async fn link(&self, key: Key, valid_for: Duration) -> Result<Url, StorageError>;

    /// Shut down any helpers owned by the store. Closing twice is fine.
    async fn close(&self) -> Result<(), StorageError>;
}
