//! Remote torrent clients.
//!
//! [`TorrentClient`] is the seam the detector works against; [`QbitClient`] implements it over the
//! qBittorrent Web API (v2).

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicBool, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    models::{Peer, Torrent},
};

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const MAX_PEER_SAMPLES_PER_TORRENT: usize = 1000;

#[async_trait]
pub trait TorrentClient: Send + Sync {
    /// Human readable server identity, used in logs and results.
    fn name(&self) -> &str;

    async fn list_torrents(&self) -> Result<Vec<Torrent>>;

    async fn list_peers(&self, hash: &str) -> Result<Vec<Peer>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Copy)]
struct PeerSample {
    first_seen: Instant,
}

pub struct QbitClient {
    name: String,
    base_url: String,
    username: String,
    password: String,
    http: reqwest::Client,
    authenticated: AtomicBool,
    login_lock: tokio::sync::Mutex<()>,
    /// torrent hash -> "ip:port" -> sample
    peer_samples: Mutex<HashMap<String, HashMap<String, PeerSample>>>,
}

impl QbitClient {
    pub fn new(cfg: &ServerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::transport(&cfg.name, e))?;
        Ok(Self {
            name: cfg.name.clone(),
            base_url: cfg.url.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
            http,
            authenticated: AtomicBool::new(false),
            login_lock: tokio::sync::Mutex::new(()),
            peer_samples: Mutex::new(HashMap::new()),
        })
    }

    pub async fn login(&self) -> Result<()> {
        let _guard = self.login_lock.lock().await;
        self.login_locked().await
    }

    /// Logs in unless another task already did while we waited for the lock.
    async fn ensure_login(&self) -> Result<()> {
        let _guard = self.login_lock.lock().await;
        if self.authenticated.load(Ordering::Acquire) {
            return Ok(());
        }
        self.login_locked().await
    }

    async fn login_locked(&self) -> Result<()> {
        let resp = self
            .http
            .post(format!("{}/api/v2/auth/login", self.base_url))
            .form(&[("username", &self.username), ("password", &self.password)])
            .send()
            .await
            .map_err(|e| self.transport(e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| self.transport(format!("failed to read login response: {e}")))?;
        if status != StatusCode::OK || body.trim() == "Fails." {
            self.authenticated.store(false, Ordering::Release);
            return Err(self.transport(format!(
                "login failed (status {}): {}",
                status.as_u16(),
                body.trim()
            )));
        }

        self.authenticated.store(true, Ordering::Release);
        info!("[{}] logged in to {}", self.name, self.base_url);
        Ok(())
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        if !self.authenticated.load(Ordering::Acquire) {
            self.ensure_login().await?;
        }

        let resp = self.send_get(path, query).await?;
        if !matches!(resp.status(), StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
            return self.check(resp);
        }

        debug!("[{}] session rejected, logging in again", self.name);
        self.authenticated.store(false, Ordering::Release);
        self.login().await?;
        let resp = self.send_get(path, query).await?;
        self.check(resp)
    }

    async fn send_get(&self, path: &str, query: &[(&str, &str)]) -> Result<reqwest::Response> {
        self.http
            .get(format!("{}{}", self.base_url, path))
            .query(query)
            .send()
            .await
            .map_err(|e| self.transport(e))
    }

    fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response> {
        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(self.transport(format!("{} returned status {}", resp.url().path(), status.as_u16())))
        }
    }

    fn transport(&self, e: impl ToString) -> Error {
        Error::transport(&self.name, e)
    }

    /// Seconds each peer has been seen on this torrent, pruning peers that went away.
    fn observe_peers(&self, hash: &str, addrs: &[String]) -> Vec<u64> {
        let now = Instant::now();
        let mut all = self.peer_samples.lock();
        let samples = all.entry(hash.to_string()).or_default();

        let current: HashSet<&str> = addrs.iter().map(String::as_str).collect();
        samples.retain(|k, _| current.contains(k.as_str()));

        let out = addrs
            .iter()
            .map(|addr| {
                let sample = samples
                    .entry(addr.clone())
                    .or_insert(PeerSample { first_seen: now });
                now.duration_since(sample.first_seen).as_secs()
            })
            .collect();

        // Over the cap the oldest samples go, so newcomers still start aging.
        if samples.len() > MAX_PEER_SAMPLES_PER_TORRENT {
            let mut by_age: Vec<(String, Instant)> =
                samples.iter().map(|(k, s)| (k.clone(), s.first_seen)).collect();
            by_age.sort_by_key(|(_, first_seen)| std::cmp::Reverse(*first_seen));
            for (key, _) in by_age.into_iter().skip(MAX_PEER_SAMPLES_PER_TORRENT) {
                samples.remove(&key);
            }
        }
        out
    }

    fn retain_torrents(&self, torrents: &[Torrent]) {
        let live: HashSet<&str> = torrents.iter().map(|t| t.hash.as_str()).collect();
        self.peer_samples
            .lock()
            .retain(|hash, _| live.contains(hash.as_str()));
    }
}

#[derive(Debug, Deserialize)]
struct QbitTorrent {
    hash: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    uploaded: i64,
    #[serde(default)]
    downloaded: i64,
    #[serde(default)]
    ratio: f64,
    #[serde(default)]
    num_seeds: i64,
    #[serde(default)]
    num_leechs: i64,
    #[serde(default)]
    category: String,
    /// Comma separated.
    #[serde(default)]
    tags: String,
}

impl From<QbitTorrent> for Torrent {
    fn from(t: QbitTorrent) -> Self {
        Torrent {
            hash: t.hash,
            name: t.name,
            size: t.size.max(0) as u64,
            progress: t.progress,
            uploaded: t.uploaded.max(0) as u64,
            downloaded: t.downloaded.max(0) as u64,
            ratio: t.ratio,
            num_seeds: t.num_seeds.clamp(0, u32::MAX as i64) as u32,
            num_leechs: t.num_leechs.clamp(0, u32::MAX as i64) as u32,
            category: Some(t.category).filter(|c| !c.is_empty()),
            tags: t
                .tags
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct QbitPeer {
    #[serde(default)]
    ip: String,
    #[serde(default)]
    port: u16,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    downloaded: i64,
    #[serde(default)]
    uploaded: i64,
    #[serde(default)]
    flags: String,
    #[serde(default)]
    relevance: f64,
    #[serde(default)]
    client: String,
}

#[derive(Debug, Deserialize)]
struct TorrentPeersResponse {
    #[serde(default)]
    peers: HashMap<String, QbitPeer>,
}

#[async_trait]
impl TorrentClient for QbitClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list_torrents(&self) -> Result<Vec<Torrent>> {
        let resp = self.get("/api/v2/torrents/info", &[]).await?;
        let raw: Vec<QbitTorrent> = resp
            .json()
            .await
            .map_err(|e| self.transport(format!("failed to decode torrents: {e}")))?;
        let torrents: Vec<Torrent> = raw.into_iter().map(Torrent::from).collect();
        self.retain_torrents(&torrents);
        Ok(torrents)
    }

    async fn list_peers(&self, hash: &str) -> Result<Vec<Peer>> {
        let resp = self
            .get("/api/v2/sync/torrentPeers", &[("hash", hash), ("rid", "0")])
            .await?;
        let body: TorrentPeersResponse = resp
            .json()
            .await
            .map_err(|e| self.transport(format!("failed to decode peers: {e}")))?;

        let (addrs, peers): (Vec<String>, Vec<QbitPeer>) = body.peers.into_iter().unzip();
        let active = self.observe_peers(hash, &addrs);

        Ok(peers
            .into_iter()
            .zip(addrs.iter().zip(active))
            .map(|(p, (addr, active_time))| {
                let (ip, port) = if p.ip.is_empty() {
                    split_addr(addr)
                } else {
                    (p.ip, p.port)
                };
                Peer {
                    ip,
                    port,
                    progress: p.progress,
                    downloaded: p.downloaded.max(0) as u64,
                    uploaded: p.uploaded.max(0) as u64,
                    flags: p.flags,
                    relevance: p.relevance,
                    active_time,
                    client: Some(p.client).filter(|c| !c.is_empty()),
                }
            })
            .collect())
    }
}

/// Splits "ip:port" or "[v6]:port" into its parts.
fn split_addr(addr: &str) -> (String, u16) {
    if let Ok(sa) = addr.parse::<std::net::SocketAddr>() {
        return (sa.ip().to_string(), sa.port());
    }
    if let Some((host, port)) = addr.rsplit_once(':') {
        if let Ok(p) = port.parse::<u16>() {
            return (host.trim_matches(['[', ']']).to_string(), p);
        }
    }
    (addr.to_string(), 0)
}
