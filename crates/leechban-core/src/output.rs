use std::{
    fmt::Write as _,
    fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    ban::{BanManager, BannedIp},
    error::{Error, Result},
    models::DetectionResult,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// eMule `ipfilter.dat`, understood by qBittorrent's IP filter.
    #[default]
    Ipfilter,
    /// One address per line.
    Plain,
}

/// Renders the active ban list into a block-list file.
pub struct DatWriter {
    path: PathBuf,
    format: OutputFormat,
}

impl DatWriter {
    pub fn new(path: impl Into<PathBuf>, format: OutputFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes every currently active ban. Returns the number of entries rendered.
    pub fn write(&self, result: &DetectionResult, bans: &BanManager, dry_run: bool) -> Result<usize> {
        let mut active = bans.active_bans();
        active.sort_by(|a, b| ip_order(&a.ip, &b.ip));
        let body = self.render(result, &active);

        if dry_run {
            info!(
                "[dry-run] would write {} entries to {}",
                active.len(),
                self.path.display()
            );
            return Ok(active.len());
        }

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| Error::persistence(dir, e))?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, body).map_err(|e| Error::persistence(&tmp, e))?;
        fs::rename(&tmp, &self.path).map_err(|e| Error::persistence(&self.path, e))?;
        info!("wrote {} entries to {}", active.len(), self.path.display());
        Ok(active.len())
    }

    fn render(&self, result: &DetectionResult, bans: &[BannedIp]) -> String {
        let mut out = String::new();
        match self.format {
            OutputFormat::Ipfilter => {
                let _ = writeln!(
                    out,
                    "# leechban ipfilter for {} generated {} ({} entries)",
                    result.server_name,
                    result.timestamp.to_rfc3339(),
                    bans.len()
                );
                for ban in bans {
                    let label = if ban.rule_name.is_empty() {
                        "leechban".to_string()
                    } else {
                        format!("leechban: {}", sanitize(&ban.rule_name))
                    };
                    let _ = writeln!(out, "{ip} - {ip} , 000 , {label}", ip = ban.ip);
                }
            }
            OutputFormat::Plain => {
                for ban in bans {
                    let _ = writeln!(out, "{}", ban.ip);
                }
            }
        }
        out
    }
}

/// One-line cycle summary for logs.
pub fn summary(result: &DetectionResult) -> String {
    format!(
        "server: {}, total peers: {}, banned this cycle: {}",
        result.server_name, result.total_peers, result.total_banned
    )
}

// Commas and newlines would break the ipfilter line format.
fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| if c == ',' || c.is_control() { ' ' } else { c })
        .collect()
}

/// Numeric address order, with unparsable entries last.
fn ip_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<IpAddr>(), b.parse::<IpAddr>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn setup() -> (BanManager, DetectionResult) {
        let bans = BanManager::in_memory();
        bans.add_ban("10.0.0.20", "Matched rule: leech", "leech", Duration::from_secs(3600), 0);
        bans.add_ban("9.0.0.1", "Matched rule: xl", "x,l", Duration::ZERO, 0);
        let mut result = DetectionResult::new("home");
        result.total_peers = 12;
        result.add_banned_ip("10.0.0.20", "Matched rule: leech", "leech");
        (bans, result)
    }

    #[test]
    fn ipfilter_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipfilter.dat");
        let (bans, result) = setup();
        let written = DatWriter::new(&path, OutputFormat::Ipfilter)
            .write(&result, &bans, false)
            .unwrap();
        assert_eq!(written, 2);

        let text = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert!(lines[0].starts_with("# leechban ipfilter for home"));
        assert_eq!(lines[1], "9.0.0.1 - 9.0.0.1 , 000 , leechban: x l");
        assert_eq!(lines[2], "10.0.0.20 - 10.0.0.20 , 000 , leechban: leech");
    }

    #[test]
    fn plain_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("banned.txt");
        let (bans, result) = setup();
        DatWriter::new(&path, OutputFormat::Plain)
            .write(&result, &bans, false)
            .unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "9.0.0.1\n10.0.0.20\n");
    }

    #[test]
    fn dry_run_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ipfilter.dat");
        let (bans, result) = setup();
        let n = DatWriter::new(&path, OutputFormat::Ipfilter)
            .write(&result, &bans, true)
            .unwrap();
        assert_eq!(n, 2);
        assert!(!path.exists());
    }

    #[test]
    fn summary_line() {
        let (_, result) = setup();
        assert_eq!(
            summary(&result),
            "server: home, total peers: 12, banned this cycle: 1"
        );
    }

    #[test]
    fn format_deserializes_snake_case() {
        let f: OutputFormat = serde_json::from_str("\"plain\"").unwrap();
        assert_eq!(f, OutputFormat::Plain);
    }
}
