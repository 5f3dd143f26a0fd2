use std::{collections::HashSet, sync::Arc};

use parking_lot::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    ban::BanManager,
    client::TorrentClient,
    error::Result,
    models::{DetectionResult, Peer, Torrent},
    rule::Rule,
    whitelist::Whitelist,
};

/// Counters and dedup set shared by the per-torrent tasks of one cycle.
struct CycleState {
    seen: HashSet<String>,
    result: DetectionResult,
}

/// Leecher detection for one remote client.
#[derive(Clone)]
pub struct Detector {
    client: Arc<dyn TorrentClient>,
    rules: Arc<[Rule]>,
    whitelist: Arc<Whitelist>,
    bans: Arc<BanManager>,
}

impl Detector {
    pub fn new(
        client: Arc<dyn TorrentClient>,
        rules: Vec<Rule>,
        whitelist: Whitelist,
        bans: Arc<BanManager>,
    ) -> Self {
        Self {
            client,
            rules: rules.into(),
            whitelist: Arc::new(whitelist),
            bans,
        }
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Runs one detection cycle: every torrent is scanned concurrently and each IP is
    /// evaluated at most once.
    ///
    /// Fails only if the torrent list cannot be fetched; per-torrent failures are logged and
    /// the torrent is skipped.
    pub async fn detect(&self) -> Result<DetectionResult> {
        let result = DetectionResult::new(self.client.name());
        let span = info_span!("detect", server = %self.client.name(), cycle = %result.cycle_id);
        self.run_cycle(result).instrument(span).await
    }

    async fn run_cycle(&self, result: DetectionResult) -> Result<DetectionResult> {
        let torrents = self.client.list_torrents().await?;
        info!("checking {} torrents against {} rules", torrents.len(), self.rules.len());

        let cycle = Arc::new(Mutex::new(CycleState {
            seen: HashSet::new(),
            result,
        }));

        let mut tasks = JoinSet::new();
        for torrent in torrents {
            let this = self.clone();
            let cycle = cycle.clone();
            tasks.spawn(
                async move { this.scan_torrent(torrent, &cycle).await }.in_current_span(),
            );
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("torrent scan task failed: {e}");
            }
        }

        let state = match Arc::try_unwrap(cycle) {
            Ok(m) => m.into_inner(),
            Err(shared) => {
                let guard = shared.lock();
                CycleState {
                    seen: guard.seen.clone(),
                    result: guard.result.clone(),
                }
            }
        };
        info!(
            "cycle done: {} peers seen, {} unique, {} banned",
            state.result.total_peers,
            state.seen.len(),
            state.result.total_banned
        );
        Ok(state.result)
    }

    async fn scan_torrent(&self, torrent: Torrent, cycle: &Mutex<CycleState>) {
        let peers = match self.client.list_peers(&torrent.hash).await {
            Ok(peers) => peers,
            Err(e) => {
                warn!("failed to get peers for torrent {}: {e}", torrent.name);
                return;
            }
        };

        for peer in &peers {
            {
                let mut c = cycle.lock();
                c.result.total_peers += 1;
                if peer.ip.is_empty() || !c.seen.insert(peer.ip.clone()) {
                    continue;
                }
            }

            if self.whitelist.is_whitelisted(&peer.ip) {
                debug!("{} is whitelisted", peer.ip);
                continue;
            }

            let Some(rule) = self.first_match(peer, &torrent) else {
                continue;
            };
            let ban = self.bans.add_ban(
                &peer.ip,
                &rule.reason(),
                &rule.name,
                rule.ban_duration,
                rule.max_ban_count,
            );
            cycle
                .lock()
                .result
                .add_banned_ip(&peer.ip, &ban.reason, &rule.name);
            info!(
                "banned {} (rule: {}, action: {}, progress: {:.1}%, uploaded: {}, count: {}, permanent: {})",
                peer.ip,
                rule.name,
                rule.action,
                peer.progress * 100.0,
                peer.uploaded,
                ban.ban_count,
                ban.is_permanent
            );
        }
    }

    /// First rule, in configured order, that matches the peer.
    fn first_match(&self, peer: &Peer, torrent: &Torrent) -> Option<&Rule> {
        self.rules.iter().find(|r| r.matches(peer, torrent))
    }
}
