use super::{ErrorReply, PeerList, RegisterReply, ServerStatus, STALE_AFTER};
use crate::endpoint::Endpoint;
use crate::error::Result;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::net::{TcpListener, ToSocketAddrs};

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryEntry {
    pub endpoint: Endpoint,
    pub last_seen: DateTime<Utc>,
}

/// Username to endpoint map with expiry.
///
/// Every operation first drops entries older than the staleness window, so
/// stale peers are never returned or counted.
pub struct Registry {
    entries: Mutex<HashMap<String, RegistryEntry>>,
    clock: Arc<dyn Clock>,
    stale_after: TimeDelta,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            stale_after: TimeDelta::seconds(STALE_AFTER.as_secs() as i64),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Insert or overwrite `username`. Returns the number of active peers.
    pub fn register(&self, username: &str, endpoint: Endpoint) -> usize {
        let now = self.now();
        let mut entries = self.lock();
        self.gc(&mut entries, now);

        let old = entries.insert(
            username.to_string(),
            RegistryEntry {
                endpoint,
                last_seen: now,
            },
        );
        match old {
            Some(old) if old.endpoint != endpoint => {
                log::info!("{} moved from {} to {}", username, old.endpoint, endpoint)
            }
            Some(_) => log::debug!("{} refreshed", username),
            None => log::info!("registered {} at {}", username, endpoint),
        }

        entries.len()
    }

    /// Look `username` up. A hit counts as activity and refreshes the entry.
    pub fn lookup(&self, username: &str) -> Option<Endpoint> {
        let now = self.now();
        let mut entries = self.lock();
        self.gc(&mut entries, now);

        entries.get_mut(username).map(|entry| {
            entry.last_seen = now;
            entry.endpoint
        })
    }

    pub fn get(&self, username: &str) -> Option<RegistryEntry> {
        let now = self.now();
        let mut entries = self.lock();
        self.gc(&mut entries, now);
        entries.get(username).cloned()
    }

    /// Active usernames, sorted.
    pub fn usernames(&self) -> Vec<String> {
        let now = self.now();
        let mut entries = self.lock();
        self.gc(&mut entries, now);

        let mut names: Vec<String> = entries.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        let now = self.now();
        let mut entries = self.lock();
        self.gc(&mut entries, now);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, RegistryEntry>> {
        // entries are replaced whole, a panicking holder cannot leave one half written
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn gc(&self, entries: &mut HashMap<String, RegistryEntry>, now: DateTime<Utc>) {
        entries.retain(|name, entry| {
            let alive = now.signed_duration_since(entry.last_seen) <= self.stale_after;
            if !alive {
                log::info!("expired {} ({})", name, entry.endpoint);
            }
            alive
        });
    }
}

pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Server {
    pub async fn new<A: ToSocketAddrs>(listen_addr: A) -> Result<Self> {
        Self::with_registry(listen_addr, Arc::new(Registry::new())).await
    }

    pub async fn with_registry<A: ToSocketAddrs>(
        listen_addr: A,
        registry: Arc<Registry>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;
        Ok(Self { listener, registry })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub async fn run(self) -> Result<()> {
        log::info!("rendezvous server listening on {}", self.local_addr()?);
        axum::serve(self.listener, router(self.registry)).await?;
        Ok(())
    }
}

pub fn router(registry: Arc<Registry>) -> Router {
    Router::new()
        .route("/", get(status))
        .route("/register", post(register))
        .route("/get_peer/{username}", get(get_peer))
        .route("/list_peers", get(list_peers))
        .with_state(registry)
}

fn timestamp(registry: &Registry) -> String {
    registry.now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn error(code: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorReply {
        status: "error".to_string(),
        message: message.into(),
    };
    (code, Json(body)).into_response()
}

async fn status(State(registry): State<Arc<Registry>>) -> Json<ServerStatus> {
    Json(ServerStatus {
        status: "online".to_string(),
        active_peers: registry.len(),
        server_time: timestamp(&registry),
    })
}

async fn register(State(registry): State<Arc<Registry>>, body: Bytes) -> Response {
    let (username, endpoint) = match parse_register(&body) {
        Ok(v) => v,
        Err(msg) => {
            log::debug!("rejected registration: {}", msg);
            return error(StatusCode::BAD_REQUEST, msg);
        }
    };

    let active_peers = registry.register(&username, endpoint);
    Json(RegisterReply {
        status: "success".to_string(),
        message: format!("User {} registered", username),
        active_peers,
    })
    .into_response()
}

async fn get_peer(State(registry): State<Arc<Registry>>, Path(username): Path<String>) -> Response {
    match registry.lookup(&username) {
        Some(endpoint) => Json(endpoint).into_response(),
        None => error(StatusCode::NOT_FOUND, "Peer not found"),
    }
}

async fn list_peers(State(registry): State<Arc<Registry>>) -> Json<PeerList> {
    let peers = registry.usernames();
    Json(PeerList {
        count: peers.len(),
        peers,
        server_time: timestamp(&registry),
    })
}

/// Validate a registration body by hand so every bad input maps to a 400.
fn parse_register(body: &[u8]) -> std::result::Result<(String, Endpoint), &'static str> {
    let v: Value = serde_json::from_slice(body).map_err(|_| "No JSON data received")?;

    let username = v
        .get("username")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let ip = v
        .get("ip")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty());
    let port = v.get("port").filter(|p| !p.is_null());

    let (Some(username), Some(ip), Some(port)) = (username, ip, port) else {
        return Err("Missing required parameters");
    };

    // clients may send the port as a number or a numeric string
    let port = match port {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .and_then(|p| u16::try_from(p).ok())
    .ok_or("Port must be a number between 1 and 65535")?;
    if port == 0 {
        return Err("Missing required parameters");
    }

    let ip: IpAddr = ip.parse().map_err(|_| "Invalid ip address")?;

    Ok((username.to_string(), Endpoint::new(ip, port)))
}
