//! HTTP rendezvous.
//!
//! Peers register the endpoint discovery found for them under a username and look
//! each other up by name. Entries idle for longer than [`STALE_AFTER`] are dropped,
//! so a live peer re-registers periodically.
//!
//! use `Client` to register and resolve, `Server` to run the registry.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::{Client, RetryPolicy};

#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::{router, Clock, Registry, RegistryEntry, Server, SystemClock};

/// Registry entries untouched for longer than this are treated as absent.
pub const STALE_AFTER: Duration = Duration::from_secs(300);

/// `GET /`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerStatus {
    pub status: String,
    pub active_peers: usize,
    pub server_time: String,
}

/// `POST /register` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: String,
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterReply {
    pub status: String,
    pub message: String,
    pub active_peers: usize,
}

/// `GET /list_peers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerList {
    pub peers: Vec<String>,
    pub count: usize,
    pub server_time: String,
}

/// Body of every non-2xx answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorReply {
    pub status: String,
    pub message: String,
}
