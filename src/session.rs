//! A peer session: one UDP socket, the hole punch state on it and the encrypted chat
//! channel once established.
//!
//! [`PeerSession::bind`] starts the receive loop. It is the only reader of the
//! socket: control datagrams go to [`HolePunch::on_control`], chat frames are
//! decrypted and handed out through the [`Inbox`].

use crate::crypto::{Cipher, SharedKey};
use crate::discovery::{Discovered, Discovery, StunProbe};
use crate::error::{Error, Result};
use crate::keepalive;
use crate::punch::{HolePunch, PunchConfig, PunchState, Reply, Strategy};
use crate::stop::StopSignal;
use crate::wire::{WireMessage, MAX_DATAGRAM};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;

#[cfg(feature = "client")]
use crate::{endpoint::Endpoint, rendezvous};

const SOCKET_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub bind_addr: SocketAddr,
    pub punch: PunchConfig,
    pub keepalive: Duration,
    /// Receive wait of the receive loop, bounds how long a stop takes to be seen.
    pub recv_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            punch: PunchConfig::default(),
            keepalive: Duration::from_secs(25),
            recv_timeout: Duration::from_millis(500),
        }
    }
}

#[derive(Debug)]
pub enum Inbound {
    Message { from: SocketAddr, text: String },
    /// A chat frame from the peer that could not be opened.
    Undeliverable { from: SocketAddr, error: Error },
}

pub struct Inbox {
    rx: UnboundedReceiver<Inbound>,
}

impl Inbox {
    /// Next inbound message, `None` once the session is closed.
    pub async fn recv(&mut self) -> Option<Inbound> {
        self.rx.recv().await
    }
}

pub struct PeerSession {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    punch: Arc<HolePunch>,
    cipher: Arc<Cipher>,
    stop: StopSignal,
    keepalive: Duration,
    keepalive_task: Option<JoinHandle<()>>,
    tasks: Vec<JoinHandle<()>>,
    inbox: Option<Inbox>,
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.stop.stop();
    }
}

impl PeerSession {
    pub async fn bind(options: SessionOptions, key: &SharedKey) -> Result<Self> {
        let socket = Arc::new(bind_socket(options.bind_addr)?);
        let local_addr = socket.local_addr()?;
        log::info!("udp socket bound to {}", local_addr);

        let punch = Arc::new(HolePunch::new(options.punch));
        let cipher = Arc::new(Cipher::new(key));
        let stop = StopSignal::new();
        let (tx, rx) = unbounded_channel();

        let receiver = tokio::spawn(receive_loop(
            socket.clone(),
            punch.clone(),
            cipher.clone(),
            stop.clone(),
            tx,
            options.recv_timeout,
        ));

        Ok(Self {
            socket,
            local_addr,
            punch,
            cipher,
            stop,
            keepalive: options.keepalive,
            keepalive_task: None,
            tasks: vec![receiver],
            inbox: Some(Inbox { rx }),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> PunchState {
        self.punch.state()
    }

    pub fn is_established(&self) -> bool {
        self.punch.is_established()
    }

    pub fn remote(&self) -> Option<SocketAddr> {
        self.punch.remote()
    }

    /// Punch datagrams sent so far.
    pub fn attempts(&self) -> u32 {
        self.punch.attempts()
    }

    pub fn is_closed(&self) -> bool {
        self.stop.is_stopped()
    }

    /// The receiving half of the chat, available once.
    pub fn inbox(&mut self) -> Option<Inbox> {
        self.inbox.take()
    }

    /// Discover the public endpoint of the session socket. An unknown external port
    /// is replaced by the locally bound one.
    pub async fn discover<P: StunProbe>(&self, discovery: &Discovery<P>) -> Discovered {
        let mut discovered = discovery.discover(self.local_addr).await;

        if !discovered.endpoint.has_port() {
            log::info!(
                "external port unknown, assuming local port {}",
                self.local_addr.port()
            );
            discovered.endpoint = discovered.endpoint.or_port(self.local_addr.port());
        }

        discovered
    }

    /// Register with the rendezvous server and keep the entry fresh until closed.
    #[cfg(feature = "client")]
    pub async fn register(
        &mut self,
        rendezvous: &rendezvous::Client,
        username: &str,
        endpoint: Endpoint,
    ) -> Result<()> {
        rendezvous.register(username, &endpoint).await?;
        self.tasks.push(rendezvous.spawn_refresher(
            username.to_string(),
            endpoint,
            self.stop.clone(),
        ));
        Ok(())
    }

    /// Punch until established, or close the session and fail.
    pub async fn punch(&mut self, strategy: Strategy) -> Result<SocketAddr> {
        match self.punch.run(&self.socket, &strategy, &self.stop).await {
            Ok(remote) => {
                log::info!("p2p connection established with {}", remote);
                if self.keepalive_task.is_none() {
                    self.keepalive_task = Some(keepalive::spawn(
                        self.socket.clone(),
                        remote,
                        self.keepalive,
                        self.stop.clone(),
                    ));
                }
                Ok(remote)
            }
            Err(e) => {
                log::warn!("hole punching failed: {}", self.punch.diagnosis());
                self.close().await;
                Err(e)
            }
        }
    }

    /// Encrypt `text` and send it to the established peer.
    pub async fn send(&self, text: &str) -> Result<()> {
        let remote = match (self.punch.state(), self.punch.remote()) {
            (PunchState::Established, Some(remote)) if !self.stop.is_stopped() => remote,
            _ => return Err(Error::NotEstablished),
        };

        let frame = self.cipher.seal(text.as_bytes())?;
        self.socket
            .send_to(&WireMessage::Chat(frame).encode(), remote)
            .await?;
        Ok(())
    }

    /// Stop every task of the session and wait for them to finish.
    pub async fn close(&mut self) {
        self.stop.stop();
        self.punch.abort();

        let tasks: Vec<_> = self
            .tasks
            .drain(..)
            .chain(self.keepalive_task.take())
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                log::debug!("session task ended abnormally: {}", e);
            }
        }
        log::debug!("session on {} closed", self.local_addr);
    }
}

pub(crate) fn bind_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(target_os = "linux")))]
    socket.set_reuse_port(true)?;
    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER) {
        log::debug!("set_recv_buffer_size: {}", e);
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER) {
        log::debug!("set_send_buffer_size: {}", e);
    }
    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    Ok(UdpSocket::from_std(socket.into())?)
}

async fn receive_loop(
    socket: Arc<UdpSocket>,
    punch: Arc<HolePunch>,
    cipher: Arc<Cipher>,
    stop: StopSignal,
    inbox: UnboundedSender<Inbound>,
    wait: Duration,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    let ack = WireMessage::Ack.encode();

    while !stop.is_stopped() {
        let (n, from) = match timeout(wait, socket.recv_from(&mut buf)).await {
            Err(_) => continue,
            Ok(Err(e)) => {
                log::debug!("recv_from: {}", e);
                continue;
            }
            Ok(Ok(v)) => v,
        };

        let msg = match WireMessage::decode(&buf[..n]) {
            Ok(msg) => msg,
            Err(e) => {
                log::debug!("dropping datagram from {}: {}", from, e);
                continue;
            }
        };

        match msg {
            WireMessage::Chat(frame) => deliver(&punch, &cipher, &inbox, &frame, from),
            control => {
                if punch.on_control(&control, from) == Reply::Ack {
                    if let Err(e) = socket.send_to(&ack, from).await {
                        log::debug!("ack to {} failed: {}", from, e);
                    }
                }
            }
        }
    }

    log::debug!("receive loop stopped");
}

fn deliver(
    punch: &HolePunch,
    cipher: &Cipher,
    inbox: &UnboundedSender<Inbound>,
    frame: &[u8],
    from: SocketAddr,
) {
    if punch.remote() != Some(from) {
        log::warn!("dropping chat from unconfirmed source {}", from);
        return;
    }

    let inbound = match cipher.open(frame) {
        Ok(plain) => match String::from_utf8(plain) {
            Ok(text) => Inbound::Message { from, text },
            Err(_) => Inbound::Undeliverable {
                from,
                error: Error::Malformed("chat text is not utf-8".into()),
            },
        },
        Err(Error::FrameTooShort(len)) => {
            log::debug!("dropping {} byte chat frame from {}", len, from);
            return;
        }
        Err(error) => {
            log::warn!("undeliverable message from {}: {}", from, error);
            Inbound::Undeliverable { from, error }
        }
    };

    if inbox.send(inbound).is_err() {
        log::trace!("inbox dropped, discarding message from {}", from);
    }
}

/// Who to connect to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Look the username up on the rendezvous server and punch directly.
    Peer(String),
    /// Punch a known address directly.
    Address(SocketAddr),
    /// Sweep the scan port range of this ip.
    Scan(IpAddr),
    /// Punch the scan listen port of this ip until found.
    Beacon(IpAddr),
}

impl Target {
    fn scanning(&self) -> bool {
        matches!(self, Target::Scan(_) | Target::Beacon(_))
    }
}

/// Rendezvous server and the name to register under.
#[cfg(feature = "client")]
pub struct Rendezvous<'a> {
    pub client: &'a rendezvous::Client,
    pub username: &'a str,
}

/// Bind, discover, register, resolve and punch.
///
/// Scan and beacon sessions bind the scan listen port unless a port was given,
/// so the beacon side knows where to aim. Any failure closes the session.
#[cfg(feature = "client")]
pub async fn start<P: StunProbe>(
    mut options: SessionOptions,
    key: &SharedKey,
    discovery: &Discovery<P>,
    rendezvous: Option<Rendezvous<'_>>,
    target: Target,
) -> Result<PeerSession> {
    if target.scanning() && options.bind_addr.port() == 0 {
        options
            .bind_addr
            .set_port(options.punch.scan.listen_port);
    }
    let listen_port = options.punch.scan.listen_port;

    let mut session = PeerSession::bind(options, key).await?;
    match connect(&mut session, discovery, rendezvous, target, listen_port).await {
        Ok(remote) => {
            log::debug!("session ready, chatting with {}", remote);
            Ok(session)
        }
        Err(e) => {
            session.close().await;
            Err(e)
        }
    }
}

#[cfg(feature = "client")]
async fn connect<P: StunProbe>(
    session: &mut PeerSession,
    discovery: &Discovery<P>,
    rendezvous: Option<Rendezvous<'_>>,
    target: Target,
    listen_port: u16,
) -> Result<SocketAddr> {
    let discovered = session.discover(discovery).await;
    log::info!(
        "public endpoint {} (nat: {})",
        discovered.endpoint,
        discovered.nat_type
    );
    if discovered.nat_type.is_symmetric() && !target.scanning() {
        log::warn!("symmetric nat detected, direct punching may fail; try a port scan");
    }

    if let Some(rdv) = &rendezvous {
        match rdv.client.status().await {
            Ok(status) => log::info!(
                "rendezvous server {} with {} active peers",
                status.status,
                status.active_peers
            ),
            Err(e) => log::warn!("rendezvous status check failed: {}", e),
        }
        session
            .register(rdv.client, rdv.username, discovered.endpoint)
            .await?;
    }

    let strategy = match target {
        Target::Peer(username) => {
            let rdv = rendezvous.as_ref().ok_or_else(|| {
                Error::Config(format!("looking up {} needs a rendezvous server", username))
            })?;
            Strategy::Directed(rdv.client.resolve(&username).await?.socket_addr())
        }
        Target::Address(addr) => Strategy::Directed(addr),
        Target::Scan(ip) => Strategy::Scan(ip),
        Target::Beacon(ip) => Strategy::Beacon(SocketAddr::new(ip, listen_port)),
    };

    session.punch(strategy).await
}
