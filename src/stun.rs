//! STUN binding client (RFC 5389), just enough to learn a mapped address.
//!
//! The request leaves from the chat socket's own local address: a second socket with
//! address reuse is bound next to it and connected to the server, so the NAT mapping
//! that gets reported is the one peers will punch.

use crate::discovery::{local_ip, StunProbe, StunReply};
use crate::endpoint::NatType;
use crate::error::{Error, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::{lookup_host, UdpSocket};
use tokio::time::{timeout_at, Instant};

const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const BINDING_ERROR: u16 = 0x0111;

const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const HEADER_LEN: usize = 20;

const FAMILY_V4: u8 = 0x01;
const FAMILY_V6: u8 = 0x02;

pub type TransactionId = [u8; 12];

pub fn binding_request(id: &TransactionId) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN);
    buf.extend_from_slice(&BINDING_REQUEST.to_be_bytes());
    buf.extend_from_slice(&0u16.to_be_bytes());
    buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
    buf.extend_from_slice(id);
    buf
}

/// Whether `buf` is a STUN message of transaction `id`.
pub fn answers(buf: &[u8], id: &TransactionId) -> bool {
    buf.len() >= HEADER_LEN
        && buf[0] & 0xc0 == 0
        && buf[4..8] == MAGIC_COOKIE.to_be_bytes()
        && buf[8..HEADER_LEN] == id[..]
}

/// Mapped address carried by a binding response to `id`. XOR-MAPPED-ADDRESS wins
/// over the legacy MAPPED-ADDRESS.
pub fn parse_binding_response(buf: &[u8], id: &TransactionId) -> Result<SocketAddr> {
    if !answers(buf, id) {
        return Err(Error::Stun("not a response to our request".into()));
    }

    match u16::from_be_bytes([buf[0], buf[1]]) {
        BINDING_SUCCESS => {}
        BINDING_ERROR => return Err(Error::Stun("binding error response".into())),
        kind => {
            return Err(Error::Stun(format!(
                "unexpected message type {:#06x}",
                kind
            )))
        }
    }

    let len = u16::from_be_bytes([buf[2], buf[3]]) as usize;
    let mut rest = buf
        .get(HEADER_LEN..HEADER_LEN + len)
        .ok_or_else(|| Error::Stun("truncated message".into()))?;

    let mut mapped = None;
    while rest.len() >= 4 {
        let kind = u16::from_be_bytes([rest[0], rest[1]]);
        let len = u16::from_be_bytes([rest[2], rest[3]]) as usize;
        let value = rest
            .get(4..4 + len)
            .ok_or_else(|| Error::Stun("truncated attribute".into()))?;

        match kind {
            ATTR_XOR_MAPPED_ADDRESS => return address(value, Some(id)),
            ATTR_MAPPED_ADDRESS => mapped = Some(address(value, None)?),
            _ => {}
        }

        // values are padded to 4 bytes
        let next = 4 + ((len + 3) & !3);
        rest = rest.get(next..).unwrap_or(&[]);
    }

    mapped.ok_or_else(|| Error::Stun("no mapped address in response".into()))
}

fn address(value: &[u8], xor: Option<&TransactionId>) -> Result<SocketAddr> {
    let short = || Error::Stun("short address attribute".into());
    if value.len() < 4 {
        return Err(short());
    }

    let mut mask = [0u8; 16];
    if let Some(id) = xor {
        mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
        mask[4..].copy_from_slice(id);
    }
    let unmask = |raw: &[u8]| -> Vec<u8> { raw.iter().zip(&mask).map(|(b, m)| b ^ m).collect() };

    let port = u16::from_be_bytes([value[2] ^ mask[0], value[3] ^ mask[1]]);
    let ip = match value[1] {
        FAMILY_V4 => {
            let b = unmask(value.get(4..8).ok_or_else(short)?);
            IpAddr::V4(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
        }
        FAMILY_V6 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&unmask(value.get(4..20).ok_or_else(short)?));
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        family => {
            return Err(Error::Stun(format!(
                "unknown address family {:#04x}",
                family
            )))
        }
    };

    Ok(SocketAddr::new(ip, port))
}

/// Coarse classification from a single binding. Without CHANGE-REQUEST tests a
/// translated address is assumed port restricted; [`crate::Discovery`] upgrades it to
/// symmetric when servers see different ports.
pub fn classify(mapped: SocketAddr, local: SocketAddr, interface: IpAddr) -> NatType {
    let local_ip = if local.ip().is_unspecified() {
        interface
    } else {
        local.ip()
    };

    if mapped.ip() == local_ip {
        NatType::Open
    } else {
        NatType::PortRestrictedCone
    }
}

/// Sends binding requests from the session's local address.
pub struct StunClient {
    timeout: Duration,
    interface: IpAddr,
}

impl StunClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            interface: local_ip(),
        }
    }
}

#[async_trait]
impl StunProbe for StunClient {
    async fn query(&self, server: &str, local: SocketAddr) -> Result<StunReply> {
        let server_addr = resolve(server, local).await?;
        let socket = beside(local, server_addr)?;

        let id: TransactionId = rand::random();
        socket.send(&binding_request(&id)).await?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 576];
        let mapped = loop {
            let n = timeout_at(deadline, socket.recv(&mut buf))
                .await
                .map_err(|_| Error::Stun(format!("{} did not answer", server)))??;

            if answers(&buf[..n], &id) {
                break parse_binding_response(&buf[..n], &id)?;
            }
            log::debug!("stray {} byte datagram from {}", n, server_addr);
        };

        Ok(StunReply {
            ip: mapped.ip(),
            port: mapped.port(),
            nat_type: classify(mapped, local, self.interface),
        })
    }
}

/// First address of `server` in the family of `local`.
async fn resolve(server: &str, local: SocketAddr) -> Result<SocketAddr> {
    lookup_host(server)
        .await?
        .find(|addr| addr.is_ipv4() == local.is_ipv4())
        .ok_or_else(|| Error::Stun(format!("{} has no address usable from {}", server, local)))
}

/// A socket sharing `local`, connected to `server` so its answers are not handed to
/// the unconnected chat socket.
fn beside(local: SocketAddr, server: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "linux")))]
    socket.set_reuse_port(true)?;
    socket.bind(&local.into())?;
    socket.connect(&server.into())?;
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::bind_socket;
    use tokio::task::JoinHandle;

    const ID: TransactionId = [7, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11];

    fn attribute(kind: u16, addr: SocketAddr, xor: Option<&TransactionId>) -> Vec<u8> {
        let mut mask = [0u8; 16];
        if let Some(id) = xor {
            mask[..4].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
            mask[4..].copy_from_slice(id);
        }

        let (family, ip) = match addr.ip() {
            IpAddr::V4(ip) => (FAMILY_V4, ip.octets().to_vec()),
            IpAddr::V6(ip) => (FAMILY_V6, ip.octets().to_vec()),
        };
        let port = addr.port().to_be_bytes();

        let mut value = vec![0, family, port[0] ^ mask[0], port[1] ^ mask[1]];
        value.extend(ip.iter().zip(&mask).map(|(b, m)| b ^ m));

        let mut attr = kind.to_be_bytes().to_vec();
        attr.extend_from_slice(&(value.len() as u16).to_be_bytes());
        attr.extend(value);
        attr
    }

    fn response(kind: u16, id: &TransactionId, attrs: &[Vec<u8>]) -> Vec<u8> {
        let body: Vec<u8> = attrs.concat();
        let mut buf = kind.to_be_bytes().to_vec();
        buf.extend_from_slice(&(body.len() as u16).to_be_bytes());
        buf.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        buf.extend_from_slice(id);
        buf.extend(body);
        buf
    }

    // answers every binding request with the address it came from
    fn fake_server(socket: UdpSocket) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = [0u8; 576];
            while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                if n < HEADER_LEN {
                    continue;
                }
                let mut id = [0u8; 12];
                id.copy_from_slice(&buf[8..HEADER_LEN]);

                let mapped = attribute(ATTR_XOR_MAPPED_ADDRESS, from, Some(&id));
                let reply = response(BINDING_SUCCESS, &id, &[mapped]);
                let _ = socket.send_to(&reply, from).await;
            }
        })
    }

    #[test]
    fn test_binding_request() {
        let req = binding_request(&ID);
        assert_eq!(req.len(), HEADER_LEN);
        assert_eq!(req[..4], [0x00, 0x01, 0x00, 0x00]);
        assert_eq!(req[4..8], [0x21, 0x12, 0xa4, 0x42]);
        assert_eq!(req[8..], ID);
        assert!(answers(&req, &ID));
        assert!(!answers(&req, &[0; 12]));
    }

    #[test]
    fn test_parse_mapped_addresses() {
        let v4: SocketAddr = "203.0.113.9:40001".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::7]:40002".parse().unwrap();
        let legacy: SocketAddr = "198.51.100.3:5000".parse().unwrap();

        let res = response(
            BINDING_SUCCESS,
            &ID,
            &[attribute(ATTR_XOR_MAPPED_ADDRESS, v4, Some(&ID))],
        );
        assert_eq!(parse_binding_response(&res, &ID).unwrap(), v4);

        let res = response(
            BINDING_SUCCESS,
            &ID,
            &[attribute(ATTR_XOR_MAPPED_ADDRESS, v6, Some(&ID))],
        );
        assert_eq!(parse_binding_response(&res, &ID).unwrap(), v6);

        // old servers only send MAPPED-ADDRESS, the xor form still wins when both come
        let res = response(
            BINDING_SUCCESS,
            &ID,
            &[attribute(ATTR_MAPPED_ADDRESS, legacy, None)],
        );
        assert_eq!(parse_binding_response(&res, &ID).unwrap(), legacy);

        let res = response(
            BINDING_SUCCESS,
            &ID,
            &[
                attribute(ATTR_MAPPED_ADDRESS, legacy, None),
                attribute(ATTR_XOR_MAPPED_ADDRESS, v4, Some(&ID)),
            ],
        );
        assert_eq!(parse_binding_response(&res, &ID).unwrap(), v4);
    }

    #[test]
    fn test_parse_rejects() {
        let v4: SocketAddr = "203.0.113.9:40001".parse().unwrap();
        let good = response(
            BINDING_SUCCESS,
            &ID,
            &[attribute(ATTR_XOR_MAPPED_ADDRESS, v4, Some(&ID))],
        );

        assert!(parse_binding_response(&good, &[0; 12]).is_err());
        assert!(parse_binding_response(&good[..HEADER_LEN + 6], &ID).is_err());
        assert!(parse_binding_response(&good[..10], &ID).is_err());

        let error = response(BINDING_ERROR, &ID, &[]);
        assert!(matches!(
            parse_binding_response(&error, &ID),
            Err(Error::Stun(_))
        ));

        let empty = response(BINDING_SUCCESS, &ID, &[]);
        assert!(parse_binding_response(&empty, &ID).is_err());

        // our own wire tags never look like stun
        assert!(!answers(&[0x01], &ID));
    }

    #[test]
    fn test_classify() {
        let public: SocketAddr = "203.0.113.9:40001".parse().unwrap();
        let wildcard: SocketAddr = "0.0.0.0:40001".parse().unwrap();
        let lan: IpAddr = "192.168.1.20".parse().unwrap();

        assert_eq!(classify(public, wildcard, public.ip()), NatType::Open);
        assert_eq!(
            classify(public, wildcard, lan),
            NatType::PortRestrictedCone
        );
        assert_eq!(
            classify(public, "192.168.1.20:40001".parse().unwrap(), lan),
            NatType::PortRestrictedCone
        );
    }

    #[tokio::test]
    async fn test_query_reports_session_mapping() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let s = fake_server(server);

        let session = bind_socket("127.0.0.1:0".parse().unwrap()).unwrap();
        let local = session.local_addr().unwrap();

        let client = StunClient::new(Duration::from_secs(3));
        let reply = client
            .query(&server_addr.to_string(), local)
            .await
            .unwrap();

        assert_eq!(reply.ip, local.ip());
        assert_eq!(reply.port, local.port());
        assert_eq!(reply.nat_type, NatType::Open);

        s.abort();
    }

    #[tokio::test]
    async fn test_query_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let session = bind_socket("127.0.0.1:0".parse().unwrap()).unwrap();

        let client = StunClient::new(Duration::from_millis(200));
        let res = client
            .query(
                &silent.local_addr().unwrap().to_string(),
                session.local_addr().unwrap(),
            )
            .await;

        assert!(matches!(res, Err(Error::Stun(_))));
    }
}
