use std::{collections::HashSet, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    criteria::{Criterion, Field, Operator},
    error::{Error, Result},
    models::{Peer, Torrent},
    value::{self, Value},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    pub field: String,
    pub operator: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_action")]
    pub action: String,
    /// Duration literal such as "24h" or "7d". Empty or zero bans permanently.
    #[serde(default)]
    pub ban_duration: String,
    /// Violations after which a ban becomes permanent. 0 disables escalation.
    #[serde(default)]
    pub max_ban_count: u32,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
}

fn default_enabled() -> bool {
    true
}

fn default_action() -> String {
    "ban".to_string()
}

/// A named AND-conjunction of criteria plus the ban policy applied on a match.
#[derive(Debug, Clone)]
pub struct Rule {
    pub name: String,
    pub action: String,
    pub ban_duration: Duration,
    pub max_ban_count: u32,
    criteria: Vec<Criterion>,
}

impl Rule {
    /// Builds a rule from configuration. Returns `Ok(None)` for disabled rules.
    pub fn from_config(cfg: &RuleConfig) -> Result<Option<Rule>> {
        let name = cfg.name.trim();
        if name.is_empty() {
            return Err(Error::configuration("<unnamed>", "rule name must not be empty"));
        }
        if !cfg.enabled {
            debug!("rule '{}' is disabled, skipping", name);
            return Ok(None);
        }

        let mut criteria = Vec::with_capacity(cfg.filters.len());
        for f in &cfg.filters {
            let field: Field = f.field.parse().map_err(|e| Error::configuration(name, e))?;
            let operator: Operator = f
                .operator
                .parse()
                .map_err(|e| Error::configuration(name, e))?;
            let criterion = Criterion::new(field, operator, &f.value);
            if !criterion.is_satisfiable() {
                warn!(
                    "rule '{}': criterion '{}' ({} value) can never match",
                    name,
                    criterion,
                    criterion.value().kind()
                );
            }
            criteria.push(criterion);
        }
        if criteria.is_empty() {
            warn!("rule '{}' has no filters and will match every peer", name);
        }

        Ok(Some(Rule {
            name: name.to_string(),
            action: cfg.action.clone(),
            ban_duration: parse_ban_duration(name, &cfg.ban_duration)?,
            max_ban_count: cfg.max_ban_count,
            criteria,
        }))
    }

    pub fn criteria(&self) -> &[Criterion] {
        &self.criteria
    }

    /// True iff every criterion matches. Stops at the first failing criterion.
    pub fn matches(&self, peer: &Peer, torrent: &Torrent) -> bool {
        self.criteria.iter().all(|c| c.matches(peer, torrent))
    }

    pub fn reason(&self) -> String {
        format!("Matched rule: {}", self.name)
    }
}

/// Builds the active rule set, preserving configured order and dropping disabled rules.
pub fn build_rules(configs: &[RuleConfig]) -> Result<Vec<Rule>> {
    let mut seen = HashSet::new();
    let mut rules = Vec::new();
    for cfg in configs {
        if !seen.insert(cfg.name.trim().to_string()) {
            return Err(Error::configuration(cfg.name.trim(), "duplicate rule name"));
        }
        if let Some(rule) = Rule::from_config(cfg)? {
            rules.push(rule);
        }
    }
    Ok(rules)
}

fn parse_ban_duration(rule: &str, raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Duration::ZERO);
    }
    match Value::parse(raw) {
        Value::Duration(d) => Ok(d),
        Value::Number(_) => Ok(value::parse_duration(raw)),
        other => Err(Error::configuration(
            rule,
            format!("ban_duration '{raw}' is a {}, expected a duration", other.kind()),
        )),
    }
}
