use super::{PeerList, RegisterReply, RegisterRequest, ServerStatus};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::stop::StopSignal;
use reqwest::{StatusCode, Url};
use std::time::Duration;
use tokio::{task::JoinHandle, time::sleep};

/// Retry and refresh timing of the rendezvous client.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub register_attempts: u32,
    pub register_delay: Duration,
    pub resolve_attempts: u32,
    pub resolve_interval: Duration,
    /// Re-registration period, well inside the server's staleness window.
    pub refresh_period: Duration,
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            register_attempts: 3,
            register_delay: Duration::from_secs(2),
            resolve_attempts: 30,
            resolve_interval: Duration::from_secs(2),
            refresh_period: Duration::from_secs(240),
            request_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
    base: Url,
    policy: RetryPolicy,
}

impl Client {
    pub fn new(server_url: &str, policy: RetryPolicy) -> Result<Self> {
        let base = Url::parse(server_url)
            .map_err(|e| Error::Config(format!("rendezvous url {:?}: {}", server_url, e)))?;
        if base.cannot_be_a_base() {
            return Err(Error::Config(format!(
                "rendezvous url {:?} cannot carry a path",
                server_url
            )));
        }

        let http = reqwest::Client::builder()
            .timeout(policy.request_timeout)
            .build()?;

        Ok(Self { http, base, policy })
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    /// Health check, `GET /`.
    pub async fn status(&self) -> Result<ServerStatus> {
        let status = self
            .http
            .get(self.url(&[]))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(status)
    }

    /// Register `username` at `endpoint`, retrying on any failure.
    pub async fn register(&self, username: &str, endpoint: &Endpoint) -> Result<RegisterReply> {
        let attempts = self.policy.register_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.try_register(username, endpoint).await {
                Ok(reply) => {
                    log::info!(
                        "registered as {} at {} ({} active peers)",
                        username,
                        endpoint,
                        reply.active_peers
                    );
                    return Ok(reply);
                }
                Err(e) => {
                    log::warn!("registration attempt {}/{} failed: {}", attempt, attempts, e);
                    last_error = Some(e);
                }
            }

            if attempt < attempts {
                sleep(self.policy.register_delay).await;
            }
        }

        Err(Error::Registration {
            username: username.to_string(),
            reason: last_error.map(|e| e.to_string()).unwrap_or_default(),
        })
    }

    async fn try_register(&self, username: &str, endpoint: &Endpoint) -> Result<RegisterReply> {
        let body = RegisterRequest {
            username: username.to_string(),
            ip: endpoint.ip,
            port: endpoint.port,
        };

        let reply = self
            .http
            .post(self.url(&["register"]))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }

    /// Look `username` up, polling until it shows up or the attempts run out.
    pub async fn resolve(&self, username: &str) -> Result<Endpoint> {
        let attempts = self.policy.resolve_attempts.max(1);
        let url = self.url(&["get_peer", username]);

        for attempt in 1..=attempts {
            match self.try_resolve(&url).await {
                Ok(Some(endpoint)) => {
                    log::info!("found {} at {}", username, endpoint);
                    return Ok(endpoint);
                }
                Ok(None) => log::info!(
                    "waiting for {} to come online ({}/{})",
                    username,
                    attempt,
                    attempts
                ),
                Err(e) => log::warn!("lookup of {} failed ({}/{}): {}", username, attempt, attempts, e),
            }

            if attempt < attempts {
                sleep(self.policy.resolve_interval).await;
            }
        }

        Err(Error::PeerNotFound(username.to_string()))
    }

    async fn try_resolve(&self, url: &Url) -> Result<Option<Endpoint>> {
        let res = self.http.get(url.clone()).send().await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let endpoint = res.error_for_status()?.json().await?;
        Ok(Some(endpoint))
    }

    pub async fn list_peers(&self) -> Result<PeerList> {
        let list = self
            .http
            .get(self.url(&["list_peers"]))
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(list)
    }

    /// Re-register every refresh period until `stop` fires.
    pub fn spawn_refresher(
        &self,
        username: String,
        endpoint: Endpoint,
        stop: StopSignal,
    ) -> JoinHandle<()> {
        let client = self.clone();

        tokio::spawn(async move {
            while stop.sleep(client.policy.refresh_period).await {
                if let Err(e) = client.register(&username, &endpoint).await {
                    log::warn!("registration refresh failed: {}", e);
                }
            }
            log::debug!("registration refresh of {} stopped", username);
        })
    }
}
