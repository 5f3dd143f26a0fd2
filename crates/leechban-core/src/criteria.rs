use std::{fmt, str::FromStr, time::Duration};

use crate::{
    models::{Peer, Torrent},
    value::Value,
};

/// Peer attribute a criterion inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// Peer progress as a percentage (0..100).
    Progress,
    /// Bytes uploaded to the peer, absolute or as a percentage of torrent size.
    Uploaded,
    /// Bytes downloaded from the peer, absolute or as a percentage of torrent size.
    Downloaded,
    Relevance,
    ActiveTime,
    /// Peer flag string, case folded.
    Flag,
}

impl FromStr for Field {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "progress" => Ok(Field::Progress),
            "uploaded" => Ok(Field::Uploaded),
            "downloaded" => Ok(Field::Downloaded),
            "relevance" => Ok(Field::Relevance),
            "active_time" => Ok(Field::ActiveTime),
            "flag" | "flags" => Ok(Field::Flag),
            other => Err(format!("unknown field '{other}'")),
        }
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Field::Progress => "progress",
            Field::Uploaded => "uploaded",
            Field::Downloaded => "downloaded",
            Field::Relevance => "relevance",
            Field::ActiveTime => "active_time",
            Field::Flag => "flag",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Lt,
    Gt,
    Le,
    Ge,
    Include,
    Exclude,
}

impl Operator {
    pub fn is_numeric(self) -> bool {
        matches!(self, Operator::Lt | Operator::Gt | Operator::Le | Operator::Ge)
    }
}

impl FromStr for Operator {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "<" => Ok(Operator::Lt),
            ">" => Ok(Operator::Gt),
            "<=" => Ok(Operator::Le),
            ">=" => Ok(Operator::Ge),
            "include" => Ok(Operator::Include),
            "exclude" => Ok(Operator::Exclude),
            other => Err(format!("unknown operator '{other}'")),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Lt => "<",
            Operator::Gt => ">",
            Operator::Le => "<=",
            Operator::Ge => ">=",
            Operator::Include => "include",
            Operator::Exclude => "exclude",
        };
        f.write_str(s)
    }
}

/// A single field/operator/value test against a peer and its torrent.
#[derive(Debug, Clone)]
pub struct Criterion {
    field: Field,
    operator: Operator,
    raw: String,
    value: Value,
    /// Lower-cased raw value, used by the flag field.
    needle: String,
}

impl Criterion {
    pub fn new(field: Field, operator: Operator, raw: &str) -> Self {
        let raw = raw.trim().to_string();
        Self {
            field,
            operator,
            value: Value::parse(&raw),
            needle: raw.to_lowercase(),
            raw,
        }
    }

    pub fn field(&self) -> Field {
        self.field
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Whether this field/operator/value combination can ever match.
    ///
    /// Unsatisfiable criteria are legal; they simply never match.
    pub fn is_satisfiable(&self) -> bool {
        match self.field {
            Field::Flag => !self.operator.is_numeric(),
            Field::Progress | Field::Relevance => {
                self.operator.is_numeric()
                    && matches!(self.value, Value::Percent(_) | Value::Number(_))
            }
            Field::Uploaded | Field::Downloaded => {
                self.operator.is_numeric()
                    && matches!(
                        self.value,
                        Value::Percent(_) | Value::Bytes(_) | Value::Number(_)
                    )
            }
            Field::ActiveTime => {
                self.operator.is_numeric()
                    && matches!(self.value, Value::Duration(_) | Value::Number(_))
            }
        }
    }

    pub fn matches(&self, peer: &Peer, torrent: &Torrent) -> bool {
        let op = self.operator;
        match self.field {
            Field::Progress => match self.value {
                Value::Percent(p) | Value::Number(p) => compare(peer.progress * 100.0, op, p),
                _ => false,
            },
            Field::Uploaded => self.match_transfer(peer.uploaded, torrent),
            Field::Downloaded => self.match_transfer(peer.downloaded, torrent),
            Field::Relevance => match self.value {
                Value::Number(n) => compare(peer.relevance, op, n),
                Value::Percent(p) => compare(peer.relevance, op, p / 100.0),
                _ => false,
            },
            Field::ActiveTime => match self.value {
                Value::Duration(d) => compare(Duration::from_secs(peer.active_time), op, d),
                Value::Number(n) => compare(peer.active_time as f64, op, n),
                _ => false,
            },
            Field::Flag => {
                let flags = peer.flags.to_lowercase();
                match op {
                    Operator::Include => flags.contains(&self.needle),
                    Operator::Exclude => !flags.contains(&self.needle),
                    _ => false,
                }
            }
        }
    }

    fn match_transfer(&self, bytes: u64, torrent: &Torrent) -> bool {
        let op = self.operator;
        match self.value {
            Value::Percent(p) => {
                if torrent.size == 0 {
                    return false;
                }
                let pct = bytes as f64 / torrent.size as f64 * 100.0;
                compare(pct, op, p)
            }
            Value::Bytes(b) => compare(bytes, op, b),
            Value::Number(n) => compare(bytes as f64, op, n),
            _ => false,
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.field, self.operator, self.raw)
    }
}

fn compare<T: PartialOrd>(lhs: T, op: Operator, rhs: T) -> bool {
    match op {
        Operator::Lt => lhs < rhs,
        Operator::Gt => lhs > rhs,
        Operator::Le => lhs <= rhs,
        Operator::Ge => lhs >= rhs,
        Operator::Include | Operator::Exclude => false,
    }
}
