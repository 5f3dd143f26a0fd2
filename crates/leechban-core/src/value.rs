//! Typed comparison values for rule filters.
//!
//! A filter literal such as `10%`, `2d`, `1.5GB` or `0.3` is classified by suffix, in this order:
//! percent (`%`), duration (`d`, `h`, `m`, `s`), bytes (`TB`, `GB`, `MB`, `KB`, `B`), plain number,
//! then string. Suffixes are case sensitive: duration letters are lower case and byte units end in
//! an upper case `B`, so the two sets never overlap. A suffix only claims its type when the rest of
//! the literal is a finite number; `5db` or `fastB` end up as strings.

use std::time::Duration;

const DAY_SECS: f64 = 24.0 * 60.0 * 60.0;

const BYTE_UNITS: [(&str, u64); 5] = [
    ("TB", 1 << 40),
    ("GB", 1 << 30),
    ("MB", 1 << 20),
    ("KB", 1 << 10),
    ("B", 1),
];

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Percent(f64),
    Duration(Duration),
    Bytes(u64),
    Number(f64),
    Str(String),
}

impl Value {
    pub fn parse(raw: &str) -> Self {
        let s = raw.trim();

        if let Some(p) = s.strip_suffix('%').and_then(mantissa) {
            return Value::Percent(p);
        }
        if let Some(d) = split_duration(s) {
            return Value::Duration(d);
        }
        if let Some(b) = split_bytes(s) {
            return Value::Bytes(b);
        }
        if let Some(n) = mantissa(s) {
            return Value::Number(n);
        }
        Value::Str(s.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Value::Percent(_) => "percent",
            Value::Duration(_) => "duration",
            Value::Bytes(_) => "bytes",
            Value::Number(_) => "number",
            Value::Str(_) => "string",
        }
    }
}

/// Parses a byte size like `1GB` or `512KB` using powers of 1024.
///
/// A bare number is taken as a byte count. Malformed input yields 0.
pub fn parse_bytes(s: &str) -> u64 {
    let s = s.trim();
    split_bytes(s)
        .or_else(|| mantissa(s).map(to_bytes))
        .unwrap_or(0)
}

/// Parses a duration like `2d`, `12h`, `90m` or `30s` (`d` is 24 hours).
///
/// A bare number is taken as seconds. Malformed input yields zero.
pub fn parse_duration(s: &str) -> Duration {
    let s = s.trim();
    split_duration(s)
        .or_else(|| mantissa(s).map(secs))
        .unwrap_or(Duration::ZERO)
}

fn split_duration(s: &str) -> Option<Duration> {
    let unit = match s.chars().last()? {
        'd' => DAY_SECS,
        'h' => 3600.0,
        'm' => 60.0,
        's' => 1.0,
        _ => return None,
    };
    let n = mantissa(&s[..s.len() - 1])?;
    Some(secs(n * unit))
}

fn split_bytes(s: &str) -> Option<u64> {
    let (num, mult) = BYTE_UNITS
        .iter()
        .find_map(|(suffix, mult)| s.strip_suffix(suffix).map(|num| (num, *mult)))?;
    let n = mantissa(num)?;
    Some(to_bytes(n * mult as f64))
}

fn mantissa(s: &str) -> Option<f64> {
    s.trim().parse::<f64>().ok().filter(|n| n.is_finite())
}

fn secs(n: f64) -> Duration {
    Duration::try_from_secs_f64(n).unwrap_or(Duration::ZERO)
}

// `as` saturates: negatives clamp to 0.
fn to_bytes(n: f64) -> u64 {
    n as u64
}
