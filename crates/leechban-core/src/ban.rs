//! Durable ban list with expiry and escalation to permanent bans.
//!
//! `BanManager` owns the only copy of the [`BanState`]. Reads take a shared lock, every mutation
//! takes the exclusive lock and bumps `last_updated`. The state is flushed as a whole-file rewrite
//! through a temporary file; a missing or unreadable file loads as an empty state.

use std::{
    collections::BTreeMap,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use chrono::{DateTime, Datelike, TimeDelta, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Deserializer, Serialize};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

pub const BAN_STATE_VERSION: u32 = 2;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BannedIp {
    /// Filled from the map key when absent.
    #[serde(default)]
    pub ip: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub rule_name: String,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_time")]
    pub banned_at: DateTime<Utc>,
    /// `None` means no expiry. Only meaningful while `is_permanent` is false.
    #[serde(
        default,
        deserialize_with = "deserialize_expiry",
        skip_serializing_if = "Option::is_none"
    )]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ban_count: u32,
    #[serde(default)]
    pub is_permanent: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BanStatus {
    Timed,
    Permanent,
    Expired,
}

impl BannedIp {
    pub fn status_at(&self, now: DateTime<Utc>) -> BanStatus {
        if self.is_permanent {
            BanStatus::Permanent
        } else if self.expires_at.is_some_and(|t| now > t) {
            BanStatus::Expired
        } else {
            BanStatus::Timed
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status_at(now) == BanStatus::Expired
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    pub fn should_escalate(&self, max_ban_count: u32) -> bool {
        max_ban_count > 0 && self.ban_count >= max_ban_count
    }

    fn make_permanent(&mut self) {
        self.is_permanent = true;
        self.expires_at = None;
    }
}

/// Go-style writers encode "no expiry" as the zero time `0001-01-01T00:00:00Z`.
fn deserialize_expiry<'de, D>(de: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<serde_json::Value>::deserialize(de)?;
    Ok(raw
        .and_then(|v| serde_json::from_value::<DateTime<Utc>>(v).ok())
        .filter(|t| t.year() > 1))
}

/// Unparsable timestamps in a hand-edited file read as now.
fn deserialize_time<'de, D>(de: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = serde_json::Value::deserialize(de)?;
    Ok(serde_json::from_value(raw).unwrap_or_else(|_| Utc::now()))
}

/// The persisted aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanState {
    #[serde(default)]
    pub version: u32,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_time")]
    pub last_updated: DateTime<Utc>,
    #[serde(default)]
    pub bans: BTreeMap<String, BannedIp>,
}

impl Default for BanState {
    fn default() -> Self {
        Self {
            version: BAN_STATE_VERSION,
            last_updated: Utc::now(),
            bans: BTreeMap::new(),
        }
    }
}

impl BanState {
    /// Migrates legacy records and drops expired ones. Returns the number removed.
    fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.bans.len();
        self.bans.retain(|ip, ban| {
            if ban.ip.is_empty() {
                ban.ip = ip.clone();
            }
            if !ban.is_permanent && ban.expires_at.is_none() {
                // Older files stored zero-duration bans as "no expiry" without the flag.
                if ban.ban_count == 0 {
                    warn!("dropping ban record for {} with no count and no expiry", ip);
                    return false;
                }
                ban.make_permanent();
            }
            !ban.is_expired_at(now)
        });
        let removed = before - self.bans.len();
        if removed > 0 {
            self.last_updated = now;
        }
        self.version = BAN_STATE_VERSION;
        removed
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BanStats {
    pub total: usize,
    pub active: usize,
    pub expired: usize,
    pub permanent: usize,
}

pub struct BanManager {
    path: Option<PathBuf>,
    state: RwLock<BanState>,
    flush: Mutex<()>,
}

impl BanManager {
    /// A manager that never touches disk.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: RwLock::new(BanState::default()),
            flush: Mutex::new(()),
        }
    }

    /// Opens the state file, falling back to an empty state if it is unreadable or corrupt.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = match read_state(&path) {
            Ok(Some(mut state)) => {
                let cleaned = state.sweep(Utc::now());
                info!(
                    "loaded {} bans from {} ({} expired removed)",
                    state.bans.len(),
                    path.display(),
                    cleaned
                );
                state
            }
            Ok(None) => {
                info!("no ban state at {}, starting empty", path.display());
                BanState::default()
            }
            Err(e) => {
                warn!("failed to load ban state, starting empty: {e}");
                BanState::default()
            }
        };
        Self {
            path: Some(path),
            state: RwLock::new(state),
            flush: Mutex::new(()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Replaces the in-memory state with the file contents. On error the current state is kept.
    ///
    /// Returns the number of expired bans dropped during the load.
    pub fn load(&self) -> Result<usize> {
        let Some(path) = &self.path else {
            return Ok(0);
        };
        let mut loaded = read_state(path)?.unwrap_or_default();
        let cleaned = loaded.sweep(Utc::now());
        *self.state.write() = loaded;
        Ok(cleaned)
    }

    /// Writes the whole state to disk through a temporary file.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let _flush = self.flush.lock();
        let data = {
            let state = self.state.read();
            serde_json::to_vec_pretty(&*state).map_err(|e| Error::persistence(path, e))?
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| Error::persistence(dir, e))?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &data).map_err(|e| Error::persistence(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| Error::persistence(path, e))?;
        debug!("saved {} bytes of ban state to {}", data.len(), path.display());
        Ok(())
    }

    /// Registers a violation for `ip`, creating, renewing or escalating its ban.
    ///
    /// A zero `duration` bans permanently. With `max_ban_count > 0` the ban becomes permanent
    /// once the IP has been banned that many times. Returns the updated record.
    pub fn add_ban(
        &self,
        ip: &str,
        reason: &str,
        rule_name: &str,
        duration: Duration,
        max_ban_count: u32,
    ) -> BannedIp {
        self.add_ban_at(ip, reason, rule_name, duration, max_ban_count, Utc::now())
    }

    fn add_ban_at(
        &self,
        ip: &str,
        reason: &str,
        rule_name: &str,
        duration: Duration,
        max_ban_count: u32,
        now: DateTime<Utc>,
    ) -> BannedIp {
        let mut state = self.state.write();
        let ban = state.bans.entry(ip.to_string()).or_insert_with(|| BannedIp {
            ip: ip.to_string(),
            reason: String::new(),
            rule_name: String::new(),
            banned_at: now,
            expires_at: None,
            ban_count: 0,
            is_permanent: false,
        });

        ban.ban_count = ban.ban_count.saturating_add(1);
        ban.reason = reason.to_string();
        ban.rule_name = rule_name.to_string();

        if ban.should_escalate(max_ban_count) {
            if !ban.is_permanent {
                info!("escalating {} to a permanent ban after {} violations", ip, ban.ban_count);
            }
            ban.make_permanent();
            ban.reason = format!("Escalated to permanent ban after {} violations", ban.ban_count);
        } else if !ban.is_permanent {
            // Permanent bans never revert to timed ones.
            match expiry(now, duration) {
                Some(at) => ban.expires_at = Some(at),
                None => ban.make_permanent(),
            }
        }

        let out = ban.clone();
        state.last_updated = now;
        out
    }

    pub fn is_banned(&self, ip: &str) -> bool {
        self.is_banned_at(ip, Utc::now())
    }

    fn is_banned_at(&self, ip: &str, now: DateTime<Utc>) -> bool {
        self.state
            .read()
            .bans
            .get(ip)
            .is_some_and(|b| !b.is_expired_at(now))
    }

    pub fn get_ban(&self, ip: &str) -> Option<BannedIp> {
        self.state.read().bans.get(ip).cloned()
    }

    /// Deletes the record for `ip` regardless of its state.
    pub fn remove_ban(&self, ip: &str) -> bool {
        let mut state = self.state.write();
        let removed = state.bans.remove(ip).is_some();
        state.last_updated = Utc::now();
        removed
    }

    /// Drops every expired timed ban. Returns the number removed.
    pub fn cleanup_expired(&self) -> usize {
        self.cleanup_expired_at(Utc::now())
    }

    fn cleanup_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut state = self.state.write();
        let before = state.bans.len();
        state.bans.retain(|_, b| !b.is_expired_at(now));
        let removed = before - state.bans.len();
        if removed > 0 {
            state.last_updated = now;
        }
        removed
    }

    /// Bans that are currently in force, sorted by IP.
    pub fn active_bans(&self) -> Vec<BannedIp> {
        let now = Utc::now();
        self.state
            .read()
            .bans
            .values()
            .filter(|b| !b.is_expired_at(now))
            .cloned()
            .collect()
    }

    pub fn permanent_bans(&self) -> Vec<BannedIp> {
        self.state
            .read()
            .bans
            .values()
            .filter(|b| b.is_permanent)
            .cloned()
            .collect()
    }

    /// Every record, including expired ones not yet cleaned up.
    pub fn all_bans(&self) -> Vec<BannedIp> {
        self.state.read().bans.values().cloned().collect()
    }

    pub fn stats(&self) -> BanStats {
        let now = Utc::now();
        let state = self.state.read();
        let mut stats = BanStats {
            total: state.bans.len(),
            ..BanStats::default()
        };
        for ban in state.bans.values() {
            match ban.status_at(now) {
                BanStatus::Expired => stats.expired += 1,
                BanStatus::Permanent => {
                    stats.active += 1;
                    stats.permanent += 1;
                }
                BanStatus::Timed => stats.active += 1,
            }
        }
        stats
    }

    pub fn len(&self) -> usize {
        self.state.read().bans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_updated(&self) -> DateTime<Utc> {
        self.state.read().last_updated
    }
}

fn expiry(now: DateTime<Utc>, duration: Duration) -> Option<DateTime<Utc>> {
    if duration.is_zero() {
        return None;
    }
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
}

fn read_state(path: &Path) -> Result<Option<BanState>> {
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(Error::persistence(path, e)),
    };
    let raw: RawState = serde_json::from_slice(&data)
        .map_err(|e| Error::Parse(format!("ban state {}: {e}", path.display())))?;

    let mut bans = BTreeMap::new();
    for (ip, record) in raw.bans {
        match serde_json::from_value::<BannedIp>(record) {
            Ok(ban) => {
                bans.insert(ip, ban);
            }
            Err(e) => warn!("skipping unreadable ban record for {}: {e}", ip),
        }
    }
    Ok(Some(BanState {
        version: raw.version,
        last_updated: raw.last_updated,
        bans,
    }))
}

/// Records are decoded one by one so a single bad entry does not discard the file.
#[derive(Deserialize)]
struct RawState {
    #[serde(default)]
    version: u32,
    #[serde(default = "Utc::now", deserialize_with = "deserialize_time")]
    last_updated: DateTime<Utc>,
    #[serde(default)]
    bans: BTreeMap<String, serde_json::Value>,
}
