//!Encrypted peer to peer chat over UDP hole punching.
//!
//!Two peers behind NAT can't reach each other until both have sent traffic towards the other.
//!Each peer learns its public address, registers it on a rendezvous server under a username,
//!looks the other peer up and then both punch: send datagrams to the other's public address
//!until one comes back. The socket used for discovery and punching is the one used for chat,
//!so the NAT mappings opened by punching carry the conversation.
//!
//!## How it works
//!- discovery sends STUN binding requests to a set of servers, votes on the mapped addresses
//!  and calls the NAT symmetric when servers see different ports. Plain HTTP address echo
//!  services are the fallback; they only learn the ip.
//!- the rendezvous server is a small HTTP registry, entries expire after 5 minutes without activity.
//!- punching sends bursts of `PUNCH` datagrams and waits for an `ACK`. When the peer's port can't
//!  be predicted (symmetric NAT), one side scans a port range while the other keeps punching a
//!  well known port.
//!- once established, keepalives hold the mapping open and chat messages are sealed with
//!  ChaCha20-Poly1305 under a pre-shared key.
//!
//!## Feature flags
//!Both halves are built by default. A chat client rarely needs the rendezvous server, so
//!depend on a single half by turning the default features off:
//!
//!```toml
//!rndz-chat = { version = "0.1", default-features=false, features=["client"]}
//!```
//!
//!- `client`: rendezvous client, HTTP address echo probe and session orchestration
//!- `server`: rendezvous server

pub mod config;
pub mod crypto;
pub mod discovery;
pub mod endpoint;
pub mod error;
mod keepalive;
pub mod punch;
pub mod rendezvous;
pub mod session;
mod stop;
pub mod stun;
pub mod wire;

pub use config::Config;
pub use crypto::{Cipher, SharedKey};
pub use discovery::{Discovered, Discovery, StunProbe, StunReply};
pub use endpoint::{Endpoint, NatType};
pub use error::{Error, Result};
pub use punch::{HolePunch, PunchConfig, PunchState, ScanConfig, Strategy};
pub use session::{Inbound, Inbox, PeerSession, SessionOptions, Target};
pub use stop::StopSignal;
pub use wire::WireMessage;

#[cfg(feature = "client")]
pub use session::{start, Rendezvous};
