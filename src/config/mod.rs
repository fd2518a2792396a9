//! Configuration management
//!
//! Two input forms produce the same [`RawConfig`]: a JSON document on disk,
//! or a single-line `Key1=Value1;Key2=Value2;...` string (the form mobile
//! plugin frontends hand over). In the single-line form `\\`, `\=` and `\;`
//! escape the separator characters; records are split on *unescaped*
//! separators before the escapes are resolved, so escaped separators
//! survive inside values.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown encryption method: {0}")]
    UnknownEncryption(String),

    #[error("failed to decode UID: {0}")]
    BadUid(base64::DecodeError),

    #[error("failed to decode public key: {0}")]
    BadPublicKey(String),

    #[error("malformed config JSON: {0}")]
    MalformedJson(#[from] serde_json::Error),

    #[error("cannot read config file: {0}")]
    MissingFile(#[from] std::io::Error),

    #[error("malformed config entry: {0}")]
    MalformedEntry(String),
}

/// Configuration fields as they appear on disk, before decoding
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RawConfig {
    /// SNI presented by the carrier disguise
    pub server_name: String,
    /// Upstream proxy protocol the remote peer forwards to
    pub proxy_method: String,
    /// One of `plain`, `aes`, `chacha20-poly1305`
    pub encryption_method: String,
    /// Client identity, base64
    #[serde(rename = "UID")]
    pub uid: String,
    /// Server's static curve point, base64
    pub public_key: String,
    /// Session ticket validity hint in seconds; also the keypair cache bucket width
    pub ticket_time_hint: u64,
    /// Browser fingerprint the carrier disguise imitates
    pub browser_sig: String,
    /// Number of carrier connections to maintain
    pub num_conn: usize,
}

impl RawConfig {
    /// Parse either a path to a JSON document or an inline single-line form.
    pub fn load(conf: &str) -> Result<Self, ConfigError> {
        if conf.contains(';') && conf.contains('=') {
            Self::from_key_values(conf)
        } else {
            Self::from_file(conf)
        }
    }

    /// Load from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Parse the single-line `;`-separated form
    pub fn from_key_values(ssv: &str) -> Result<Self, ConfigError> {
        let mut map = serde_json::Map::new();
        for record in split_escaped(ssv, ';') {
            if record.is_empty() {
                continue;
            }
            let (key, value) = split_once_escaped(&record, '=')
                .ok_or_else(|| ConfigError::MalformedEntry(record.clone()))?;
            let key = unescape(&key);
            let value = unescape(&value);
            // JSON wants these two unquoted
            let json_value = if key == "TicketTimeHint" || key == "NumConn" {
                let n: i64 = value
                    .parse()
                    .map_err(|_| ConfigError::MalformedEntry(format!("{key}={value}")))?;
                Value::from(n)
            } else {
                Value::String(value)
            };
            map.insert(key, json_value);
        }
        Ok(serde_json::from_value(Value::Object(map))?)
    }
}

/// Map an encryption method name to its wire code point.
pub fn encryption_method_byte(name: &str) -> Result<u8, ConfigError> {
    match name {
        "plain" => Ok(0x00),
        "aes" => Ok(0x01),
        "chacha20-poly1305" => Ok(0x02),
        other => Err(ConfigError::UnknownEncryption(other.to_string())),
    }
}

/// Split on `sep`, honouring backslash escapes. Escape sequences pass
/// through intact for a later [`unescape`].
fn split_escaped(input: &str, sep: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            current.push(c);
            if let Some(next) = chars.next() {
                current.push(next);
            }
        } else if c == sep {
            out.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    out.push(current);
    out
}

/// Split on the first unescaped `sep`, or None if there is none.
fn split_once_escaped(input: &str, sep: char) -> Option<(String, String)> {
    let mut head = String::new();
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            head.push(c);
            if let Some(next) = chars.next() {
                head.push(next);
            }
        } else if c == sep {
            return Some((head, chars.collect()));
        } else {
            head.push(c);
        }
    }
    None
}

/// Resolve `\\`, `\=` and `\;`; any other escape passes through unchanged.
fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(n @ ('\\' | '=' | ';')) => out.push(n),
                Some(n) => {
                    out.push(c);
                    out.push(n);
                }
                None => out.push(c),
            }
        } else {
            out.push(c);
        }
    }
    out
}
