use std::io;
use thiserror::Error;

/// Errors produced by the session, its components and the rendezvous service.
#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[cfg(feature = "client")]
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Datagram without a known tag, or with a payload its tag does not allow.
    #[error("malformed datagram: {0}")]
    Malformed(String),

    /// STUN server unreachable, silent or answering with something unusable.
    #[error("stun: {0}")]
    Stun(String),

    /// Secure frame shorter than its nonce prefix.
    #[error("secure frame too short: {0} bytes")]
    FrameTooShort(usize),

    #[error("encryption failed")]
    Encryption,

    /// Wrong key or tampered ciphertext.
    #[error("decryption failed (wrong key or tampered frame)")]
    Decryption,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("peer {0} not found")]
    PeerNotFound(String),

    #[error("registration of {username} failed: {reason}")]
    Registration { username: String, reason: String },

    #[error("could not establish connection after {attempts} punch attempts")]
    TraversalFailed { attempts: u32 },

    #[error("no peer connection established")]
    NotEstablished,

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
