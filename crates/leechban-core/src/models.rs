use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A peer connected to a torrent, as reported by the client in one scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Peer {
    pub ip: String,
    pub port: u16,
    /// Peer progress in [0..1].
    pub progress: f64,
    /// Total bytes downloaded from this peer.
    pub downloaded: u64,
    /// Total bytes uploaded to this peer.
    pub uploaded: u64,
    /// Flags in qBittorrent notation, e.g. "D X E P".
    pub flags: String,
    pub relevance: f64,
    /// Seconds this peer has been observed connected.
    pub active_time: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Torrent {
    pub hash: String,
    pub name: String,
    /// Total size in bytes; 0 when the client does not know it yet.
    pub size: u64,
    pub progress: f64,
    pub uploaded: u64,
    pub downloaded: u64,
    pub ratio: f64,
    pub num_seeds: u32,
    pub num_leechs: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// One IP banned during a detection cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleBan {
    pub ip: String,
    pub reason: String,
    pub rule_name: String,
    pub banned_at: DateTime<Utc>,
}

/// Output of one detection cycle against one server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionResult {
    pub cycle_id: Uuid,
    pub server_name: String,
    pub timestamp: DateTime<Utc>,
    pub total_peers: usize,
    pub total_banned: usize,
    pub banned: HashMap<String, CycleBan>,
}

impl DetectionResult {
    pub fn new(server_name: impl Into<String>) -> Self {
        Self {
            cycle_id: Uuid::new_v4(),
            server_name: server_name.into(),
            timestamp: Utc::now(),
            total_peers: 0,
            total_banned: 0,
            banned: HashMap::new(),
        }
    }

    /// Records a ban for this cycle. Returns false if the IP was already recorded.
    pub fn add_banned_ip(&mut self, ip: &str, reason: &str, rule_name: &str) -> bool {
        if self.banned.contains_key(ip) {
            return false;
        }
        self.banned.insert(
            ip.to_string(),
            CycleBan {
                ip: ip.to_string(),
                reason: reason.to_string(),
                rule_name: rule_name.to_string(),
                banned_at: Utc::now(),
            },
        );
        self.total_banned += 1;
        true
    }
}
