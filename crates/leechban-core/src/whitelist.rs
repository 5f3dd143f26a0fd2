use std::net::IpAddr;

use ipnet::IpNet;
use tracing::warn;

#[derive(Debug, Clone)]
enum Entry {
    Net(IpNet),
    /// Entries that are not CIDR networks are compared verbatim.
    Literal(String),
}

/// IPs and ranges exempt from rule evaluation.
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    entries: Vec<Entry>,
}

impl Whitelist {
    pub fn new<I, S>(ips: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut entries = Vec::new();
        for raw in ips {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }
            match raw.parse::<IpNet>() {
                Ok(net) => entries.push(Entry::Net(net)),
                Err(_) => {
                    if raw.parse::<IpAddr>().is_err() {
                        warn!("whitelist entry '{}' is neither a CIDR range nor an IP", raw);
                    }
                    entries.push(Entry::Literal(raw.to_string()));
                }
            }
        }
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_whitelisted(&self, ip: &str) -> bool {
        let ip = ip.trim();
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return false;
        };
        self.entries.iter().any(|e| match e {
            Entry::Net(net) => net.contains(&addr),
            Entry::Literal(lit) => lit == ip,
        })
    }
}
