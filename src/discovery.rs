//! Public endpoint discovery.
//!
//! The exchange itself is hidden behind [`StunProbe`]; this module only asks every
//! configured server, votes on the answers and falls back to the local interface
//! address when nobody answers. Fallback servers, such as HTTP address echoes, are
//! only asked when no primary server answered.

use crate::endpoint::{Endpoint, NatType};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};

/// How one server sees us.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StunReply {
    pub ip: IpAddr,
    pub port: u16,
    pub nat_type: NatType,
}

/// Black box STUN query: server in, reflexive address and NAT classification out.
///
/// `local` is the address of the socket whose mapping is wanted. Implementations that can
/// only learn the ip are free to ignore it and answer port 0.
#[async_trait]
pub trait StunProbe: Send + Sync {
    async fn query(&self, server: &str, local: SocketAddr) -> Result<StunReply>;
}

#[derive(Debug, Clone)]
pub struct Discovered {
    pub endpoint: Endpoint,
    pub nat_type: NatType,
    /// Every distinct classification reported, for diagnostics.
    pub observed: BTreeSet<NatType>,
    /// Number of servers that answered.
    pub responders: usize,
}

impl Discovered {
    /// Nobody answered; port 0 tells the caller to use its bound port.
    pub fn fallback() -> Self {
        Self {
            endpoint: Endpoint::new(local_ip(), 0),
            nat_type: NatType::Unknown,
            observed: BTreeSet::new(),
            responders: 0,
        }
    }
}

pub struct Discovery<P> {
    probe: P,
    servers: Vec<String>,
    fallback: Vec<String>,
}

impl<P: StunProbe> Discovery<P> {
    pub fn new(probe: P, servers: Vec<String>) -> Self {
        Self {
            probe,
            servers,
            fallback: Vec::new(),
        }
    }

    /// Servers asked only when none of the primary ones answered.
    pub fn with_fallback(mut self, servers: Vec<String>) -> Self {
        self.fallback = servers;
        self
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// How the socket bound at `local` is seen from outside.
    pub async fn discover(&self, local: SocketAddr) -> Discovered {
        let mut replies = self.ask(&self.servers, local).await;
        if replies.is_empty() && !self.fallback.is_empty() {
            log::info!("no stun server answered, trying fallback servers");
            replies = self.ask(&self.fallback, local).await;
        }

        let mut discovered = match elect(&replies) {
            Some(reply) => Discovered {
                endpoint: Endpoint::new(reply.ip, reply.port),
                nat_type: reply.nat_type,
                observed: replies.iter().map(|r| r.nat_type).collect(),
                responders: replies.len(),
            },
            None => {
                log::warn!("all stun servers failed, falling back to local address");
                Discovered::fallback()
            }
        };

        if discovered.observed.len() > 1 {
            log::info!("servers disagree on nat type: {:?}", discovered.observed);
        }

        if mapping_varies(&replies, discovered.endpoint.ip) {
            log::info!("servers see different ports, the nat maps per destination");
            discovered.nat_type = NatType::Symmetric;
        }

        discovered
    }

    async fn ask(&self, servers: &[String], local: SocketAddr) -> Vec<StunReply> {
        let mut replies = Vec::new();

        for server in servers {
            match self.probe.query(server, local).await {
                Ok(reply) => {
                    log::info!(
                        "stun {}: {}:{} ({})",
                        server,
                        reply.ip,
                        reply.port,
                        reply.nat_type
                    );
                    replies.push(reply);
                }
                Err(e) => log::warn!("stun {} failed: {}", server, e),
            }
        }

        replies
    }
}

/// Most common ip wins, ties go to the earliest reply.
fn elect(replies: &[StunReply]) -> Option<&StunReply> {
    let mut votes: HashMap<IpAddr, usize> = HashMap::new();
    for r in replies {
        *votes.entry(r.ip).or_default() += 1;
    }

    let best = votes.values().copied().max()?;
    replies.iter().find(|r| votes[&r.ip] == best)
}

/// The same socket seen at more than one port of `ip`.
fn mapping_varies(replies: &[StunReply], ip: IpAddr) -> bool {
    let ports: BTreeSet<u16> = replies
        .iter()
        .filter(|r| r.ip == ip && r.port != 0)
        .map(|r| r.port)
        .collect();
    ports.len() > 1
}

/// Address of the interface that routes to the internet. Connecting a udp socket
/// sends nothing, it only selects the route.
pub fn local_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|s| {
            s.connect("8.8.8.8:80")?;
            s.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[cfg(feature = "client")]
pub use http_echo::{HttpEchoProbe, PublicLookup};

#[cfg(feature = "client")]
mod http_echo {
    use super::{StunProbe, StunReply};
    use crate::endpoint::NatType;
    use crate::error::{Error, Result};
    use crate::stun::StunClient;
    use async_trait::async_trait;
    use serde::Deserialize;
    use std::net::{IpAddr, SocketAddr};
    use std::time::Duration;

    /// Probe backed by "what is my ip" http services.
    ///
    /// Only the external ip is learned: the reply carries port 0 and an unknown NAT
    /// type, so the session substitutes its bound port.
    pub struct HttpEchoProbe {
        http: reqwest::Client,
    }

    impl HttpEchoProbe {
        pub fn new(timeout: Duration) -> Result<Self> {
            let http = reqwest::Client::builder().timeout(timeout).build()?;
            Ok(Self { http })
        }
    }

    #[async_trait]
    impl StunProbe for HttpEchoProbe {
        async fn query(&self, server: &str, _local: SocketAddr) -> Result<StunReply> {
            let body = self
                .http
                .get(server)
                .send()
                .await?
                .error_for_status()?
                .text()
                .await?;

            Ok(StunReply {
                ip: parse_echo(&body)?,
                port: 0,
                nat_type: NatType::Unknown,
            })
        }
    }

    /// STUN for `host:port` servers, the address echo for `http(s)://` urls.
    pub struct PublicLookup {
        stun: StunClient,
        echo: HttpEchoProbe,
    }

    impl PublicLookup {
        pub fn new(timeout: Duration) -> Result<Self> {
            Ok(Self {
                stun: StunClient::new(timeout),
                echo: HttpEchoProbe::new(timeout)?,
            })
        }
    }

    pub(crate) fn is_url(server: &str) -> bool {
        server.starts_with("http://") || server.starts_with("https://")
    }

    #[async_trait]
    impl StunProbe for PublicLookup {
        async fn query(&self, server: &str, local: SocketAddr) -> Result<StunReply> {
            if is_url(server) {
                self.echo.query(server, local).await
            } else {
                self.stun.query(server, local).await
            }
        }
    }

    #[derive(Deserialize)]
    struct Echo {
        ip: IpAddr,
    }

    /// Accepts a bare address or `{"ip": "..."}`.
    pub(super) fn parse_echo(body: &str) -> Result<IpAddr> {
        let body = body.trim();
        if body.starts_with('{') {
            return Ok(serde_json::from_str::<Echo>(body)?.ip);
        }

        body.parse()
            .map_err(|_| Error::Malformed(format!("address echo answered {:?}", body)))
    }
}
