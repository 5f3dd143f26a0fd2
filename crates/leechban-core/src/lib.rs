//! leechban core: rule engine, ban state and the detection cycle used by the leechban daemon.
//!
//! A [`Detector`] pulls torrents and peers from a [`TorrentClient`], evaluates every peer against
//! an ordered list of [`Rule`]s and records matches in a shared [`BanManager`].

pub mod ban;
pub mod client;
pub mod criteria;
pub mod detector;
pub mod error;
pub mod models;
pub mod output;
pub mod rule;
pub mod value;
pub mod whitelist;

use serde::Serialize;

pub use ban::{BanManager, BanStats, BanStatus, BannedIp};
pub use client::{QbitClient, ServerConfig, TorrentClient};
pub use criteria::{Criterion, Field, Operator};
pub use detector::Detector;
pub use error::{Error, Result};
pub use models::{CycleBan, DetectionResult, Peer, Torrent};
pub use output::{summary, DatWriter, OutputFormat};
pub use rule::{build_rules, FilterConfig, Rule, RuleConfig};
pub use value::Value;
pub use whitelist::Whitelist;

#[derive(Debug, Clone, Serialize)]
pub struct Version {
    pub version: String,
}

pub fn version() -> Version {
    Version {
        version: env!("CARGO_PKG_VERSION").to_string(),
    }
}
