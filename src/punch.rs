//! Hole punching.
//!
//! [`HolePunch`] is shared between the task sending punches ([`HolePunch::run`]) and the
//! receive loop feeding it every control datagram ([`HolePunch::on_control`]). The state
//! only moves forward, `Established` and `Failed` are final, and the remote endpoint is
//! written once: the first source that confirms wins.

use crate::error::{Error, Result};
use crate::stop::StopSignal;
use crate::wire::WireMessage;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering::SeqCst},
    OnceLock,
};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::sleep;

const POLL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PunchState {
    Idle = 0,
    Punching = 1,
    Established = 2,
    Failed = 3,
}

impl PunchState {
    pub fn is_terminal(self) -> bool {
        matches!(self, PunchState::Established | PunchState::Failed)
    }

    fn from_u8(v: u8) -> Self {
        match v {
            0 => PunchState::Idle,
            1 => PunchState::Punching,
            2 => PunchState::Established,
            _ => PunchState::Failed,
        }
    }
}

/// How to reach the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
    /// Remote endpoint known, usually from the rendezvous registry.
    Directed(SocketAddr),
    /// Remote port unknown: sweep the configured port range of this ip.
    Scan(IpAddr),
    /// Counterpart of a scan: keep punching one well known port and wait to be found.
    Beacon(SocketAddr),
}

#[derive(Debug, Clone)]
pub struct ScanConfig {
    pub first_port: u16,
    pub last_port: u16,
    pub batch_size: u16,
    /// Pause after each batch, gives answers time to arrive.
    pub settle: Duration,
    /// Port the beacon side punches on the scanner's ip.
    pub listen_port: u16,
    pub beacon_interval: Duration,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            first_port: 10000,
            last_port: 65535,
            batch_size: 200,
            settle: Duration::from_millis(500),
            listen_port: 5000,
            beacon_interval: Duration::from_secs(1),
        }
    }
}

impl ScanConfig {
    pub fn ports(&self) -> RangeInclusive<u16> {
        self.first_port..=self.last_port
    }

    pub fn port_count(&self) -> u32 {
        (self.last_port as u32 + 1).saturating_sub(self.first_port as u32)
    }

    /// Rough wall clock of a full sweep, the beacon side waits this long.
    pub fn budget(&self) -> Duration {
        let count = self.port_count();
        let batch = self.batch_size.max(1) as u32;
        let batches = (count + batch - 1) / batch;
        self.settle * (batches + 1) + Duration::from_millis(count as u64)
    }
}

#[derive(Debug, Clone)]
pub struct PunchConfig {
    /// Punches per burst.
    pub burst: u32,
    pub burst_gap: Duration,
    /// Pause between bursts, doubled after each one up to `max_interval`.
    pub interval: Duration,
    pub max_interval: Duration,
    /// Overall budget of directed punching.
    pub timeout: Duration,
    /// Carrier grade NAT mode: having sent a punch and heard any punch back is enough.
    pub aggressive: bool,
    pub scan: ScanConfig,
}

impl Default for PunchConfig {
    fn default() -> Self {
        Self {
            burst: 5,
            burst_gap: Duration::from_millis(50),
            interval: Duration::from_secs(2),
            max_interval: Duration::from_secs(8),
            timeout: Duration::from_secs(30),
            aggressive: false,
            scan: ScanConfig::default(),
        }
    }
}

/// What the receive loop should answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    Nothing,
    Ack,
}

pub struct HolePunch {
    config: PunchConfig,
    state: AtomicU8,
    remote: OnceLock<SocketAddr>,
    attempts: AtomicU32,
    // scan and beacon: a punch from the peer is as good as an ack
    lenient: AtomicBool,
    sent: AtomicBool,
    heard: AtomicBool,
}

impl HolePunch {
    pub fn new(config: PunchConfig) -> Self {
        Self {
            config,
            state: AtomicU8::new(PunchState::Idle as u8),
            remote: OnceLock::new(),
            attempts: AtomicU32::new(0),
            lenient: AtomicBool::new(false),
            sent: AtomicBool::new(false),
            heard: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &PunchConfig {
        &self.config
    }

    pub fn state(&self) -> PunchState {
        PunchState::from_u8(self.state.load(SeqCst))
    }

    pub fn is_established(&self) -> bool {
        self.state() == PunchState::Established
    }

    /// Confirmed remote endpoint, fixed once set.
    pub fn remote(&self) -> Option<SocketAddr> {
        self.remote.get().copied()
    }

    /// Punch datagrams sent so far.
    pub fn attempts(&self) -> u32 {
        self.attempts.load(SeqCst)
    }

    pub fn outcome(&self) -> Result<SocketAddr> {
        match (self.state(), self.remote()) {
            (PunchState::Established, Some(remote)) => Ok(remote),
            _ => Err(Error::TraversalFailed {
                attempts: self.attempts(),
            }),
        }
    }

    /// Short explanation of a failed attempt.
    pub fn diagnosis(&self) -> &'static str {
        match (self.heard.load(SeqCst), self.sent.load(SeqCst)) {
            (true, _) => "heard from the peer but never got an ack",
            (false, true) => "sent punches but got no response",
            (false, false) => "no packets exchanged",
        }
    }

    /// Abandon punching, e.g. when the session shuts down first.
    pub fn abort(&self) -> bool {
        self.advance(PunchState::Failed)
    }

    fn advance(&self, to: PunchState) -> bool {
        let moved = self
            .state
            .fetch_update(SeqCst, SeqCst, |cur| {
                let cur = PunchState::from_u8(cur);
                if cur.is_terminal() || cur == to {
                    None
                } else {
                    Some(to as u8)
                }
            })
            .is_ok();

        if moved {
            log::info!("hole punch {:?}", to);
        }
        moved
    }

    fn establish(&self) -> bool {
        self.remote.get().is_some() && self.advance(PunchState::Established)
    }

    fn confirm(&self, from: SocketAddr) -> bool {
        if self.remote.set(from).is_ok() {
            log::info!("remote endpoint confirmed as {}", from);
            return true;
        }

        if self.remote() == Some(from) {
            true
        } else {
            self.anomalous(from);
            false
        }
    }

    fn anomalous(&self, from: SocketAddr) {
        log::warn!(
            "ignoring datagram from {}, remote is {:?}",
            from,
            self.remote()
        );
    }

    fn note_sent(&self) {
        self.attempts.fetch_add(1, SeqCst);
        self.sent.store(true, SeqCst);

        if self.config.aggressive && self.heard.load(SeqCst) && self.establish() {
            log::info!("cgnat: bidirectional traffic seen, treating as established");
        }
    }

    /// Feed a control datagram received from `from`.
    pub fn on_control(&self, msg: &WireMessage, from: SocketAddr) -> Reply {
        match msg {
            WireMessage::Punch => {
                if self.state().is_terminal() {
                    // peers may keep punching after we settled, keep answering
                    return match self.remote() {
                        Some(remote) if remote == from => Reply::Ack,
                        _ => {
                            self.anomalous(from);
                            Reply::Nothing
                        }
                    };
                }

                self.heard.store(true, SeqCst);
                if !self.confirm(from) {
                    return Reply::Nothing;
                }

                if self.lenient.load(SeqCst)
                    || (self.config.aggressive && self.sent.load(SeqCst))
                {
                    self.establish();
                }
                Reply::Ack
            }
            WireMessage::Ack => {
                if self.state().is_terminal() {
                    log::trace!("late ack from {}", from);
                    return Reply::Nothing;
                }

                self.heard.store(true, SeqCst);
                if self.confirm(from) {
                    self.establish();
                }
                Reply::Nothing
            }
            WireMessage::Keepalive => match self.remote() {
                Some(remote) if remote == from => Reply::Ack,
                Some(_) => {
                    self.anomalous(from);
                    Reply::Nothing
                }
                None => {
                    log::debug!("keepalive from {} before any peer was confirmed", from);
                    Reply::Nothing
                }
            },
            WireMessage::Chat(_) => Reply::Nothing,
        }
    }

    fn begin(&self, strategy: &Strategy) -> bool {
        self.lenient
            .store(!matches!(strategy, Strategy::Directed(_)), SeqCst);

        self.state
            .compare_exchange(
                PunchState::Idle as u8,
                PunchState::Punching as u8,
                SeqCst,
                SeqCst,
            )
            .is_ok()
    }

    /// Drive the sending side until established, failed or stopped.
    ///
    /// Answers are consumed by the receive loop through [`HolePunch::on_control`],
    /// this only sends.
    pub async fn run(
        &self,
        socket: &UdpSocket,
        strategy: &Strategy,
        stop: &StopSignal,
    ) -> Result<SocketAddr> {
        if self.begin(strategy) {
            log::info!("hole punching: {:?}", strategy);

            match *strategy {
                Strategy::Directed(target) => self.directed(socket, target, stop).await,
                Strategy::Scan(ip) => {
                    if let Err(e) = self.scan(socket, ip, stop).await {
                        log::warn!("port scan aborted: {}", e);
                    }
                }
                Strategy::Beacon(target) => self.beacon(socket, target, stop).await,
            }

            if !self.is_established() {
                self.advance(PunchState::Failed);
            }
        }

        self.outcome()
    }

    fn settled(&self, stop: &StopSignal) -> bool {
        stop.is_stopped() || self.state().is_terminal()
    }

    /// Returns true if settled before `period` elapsed.
    async fn wait(&self, period: Duration, stop: &StopSignal) -> bool {
        let deadline = Instant::now() + period;
        loop {
            if self.settled(stop) {
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            sleep(POLL.min(deadline - now)).await;
        }
    }

    async fn send_punch(&self, socket: &UdpSocket, target: SocketAddr) {
        match socket.send_to(&WireMessage::Punch.encode(), target).await {
            Ok(_) => self.note_sent(),
            Err(e) => log::debug!("punch to {} failed: {}", target, e),
        }
    }

    async fn burst(&self, socket: &UdpSocket, target: SocketAddr, stop: &StopSignal) {
        for i in 0..self.config.burst {
            if self.settled(stop) {
                return;
            }

            // a confirmed source wins over the address we were given
            let to = self.remote().unwrap_or(target);
            self.send_punch(socket, to).await;

            if i + 1 < self.config.burst {
                sleep(self.config.burst_gap).await;
            }
        }
    }

    async fn directed(&self, socket: &UdpSocket, target: SocketAddr, stop: &StopSignal) {
        let deadline = Instant::now() + self.config.timeout;
        let max_interval = self.config.max_interval.max(self.config.interval);
        let mut interval = self.config.interval;

        loop {
            self.burst(socket, target, stop).await;

            let now = Instant::now();
            if self.settled(stop) || now >= deadline {
                return;
            }

            if self.wait(interval.min(deadline - now), stop).await {
                return;
            }

            match self.remote() {
                Some(remote) if remote != target => {
                    log::info!("{} answered in place of {}, punching it", remote, target)
                }
                _ => log::debug!("no answer from {} yet, punching again", target),
            }
            interval = (interval * 2).min(max_interval);
        }
    }

    async fn scan(&self, socket: &UdpSocket, ip: IpAddr, stop: &StopSignal) -> Result<()> {
        let local = socket.local_addr()?;
        let scan = &self.config.scan;
        let batch = scan.batch_size.max(1) as u32;
        let last = scan.last_port as u32;
        let mut port = scan.first_port as u32;

        while port <= last {
            let end = (port + batch - 1).min(last);
            log::info!("trying ports {}-{} on {}", port, end, ip);

            for p in port..=end {
                if self.settled(stop) {
                    return Ok(());
                }

                let target = SocketAddr::new(ip, p as u16);
                if is_self(local, target) {
                    continue;
                }

                self.send_punch(socket, target).await;
                tokio::task::yield_now().await;
            }

            if self.wait(scan.settle, stop).await {
                return Ok(());
            }
            port = end + 1;
        }

        log::info!("port range {:?} exhausted on {}", scan.ports(), ip);
        Ok(())
    }

    async fn beacon(&self, socket: &UdpSocket, target: SocketAddr, stop: &StopSignal) {
        let deadline = Instant::now() + self.config.scan.budget();

        while !self.settled(stop) {
            let now = Instant::now();
            if now >= deadline {
                return;
            }

            self.send_punch(socket, target).await;

            let remaining = deadline.saturating_duration_since(Instant::now());
            if self
                .wait(self.config.scan.beacon_interval.min(remaining), stop)
                .await
            {
                return;
            }
        }
    }
}

// A scan over loopback would otherwise find our own socket.
fn is_self(local: SocketAddr, target: SocketAddr) -> bool {
    local.port() == target.port()
        && (local.ip() == target.ip() || (local.ip().is_unspecified() && target.ip().is_loopback()))
}
