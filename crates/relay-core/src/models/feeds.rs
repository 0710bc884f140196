//! Ordered list of absolute URLs attached to price-polling initiators.
//!
//! Two decode paths exist. The storage path reads a single text cell where
//! SQL `NULL` stands for the empty list; the document path reads the list as
//! embedded in a larger JSON body. Both reject the whole list when any
//! element is not an absolute URL.

use std::ops::Deref;

use rusqlite::types::{
    FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Value as SqlValue, ValueRef,
};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::{CoreError, CoreResult};

#[derive(Clone, Debug, Default, Eq, PartialEq, Hash)]
pub struct Feeds(Vec<String>);

impl Feeds {
    pub fn new(urls: Vec<String>) -> CoreResult<Self> {
        validate_urls(&urls)?;
        Ok(Self(urls))
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn into_inner(self) -> Vec<String> {
        self.0
    }

    /// Storage form: `None` for the empty list, compact JSON array otherwise.
    pub fn to_storage(&self) -> CoreResult<Option<String>> {
        if self.0.is_empty() {
            return Ok(None);
        }
        serde_json::to_string(&self.0)
            .map(Some)
            .map_err(|error| CoreError::invalid_feeds(format!("failed to encode feeds: {error}")))
    }

    pub fn from_storage(value: Option<&str>) -> CoreResult<Self> {
        let Some(text) = value else {
            return Ok(Self::empty());
        };
        if text.is_empty() {
            return Err(CoreError::invalid_feeds(
                "stored feeds value must not be an empty string",
            ));
        }
        let urls: Vec<String> = serde_json::from_str(text).map_err(|error| {
            CoreError::invalid_feeds(format!(
                "stored feeds value '{text}' is not a JSON array of strings: {error}"
            ))
        })?;
        Self::new(urls)
    }
}

impl Deref for Feeds {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<Vec<String>> for Feeds {
    type Error = CoreError;

    fn try_from(urls: Vec<String>) -> Result<Self, Self::Error> {
        Self::new(urls)
    }
}

impl Serialize for Feeds {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.0.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Feeds {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let urls = Vec::<String>::deserialize(deserializer)?;
        Self::new(urls).map_err(|error| D::Error::custom(error.message))
    }
}

impl ToSql for Feeds {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let stored = self
            .to_storage()
            .map_err(|error| rusqlite::Error::ToSqlConversionFailure(Box::new(error)))?;
        Ok(ToSqlOutput::Owned(match stored {
            Some(text) => SqlValue::Text(text),
            None => SqlValue::Null,
        }))
    }
}

impl FromSql for Feeds {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        match value {
            ValueRef::Null => Ok(Self::empty()),
            ValueRef::Text(bytes) => {
                let text = std::str::from_utf8(bytes)
                    .map_err(|error| FromSqlError::Other(Box::new(error)))?;
                Self::from_storage(Some(text))
                    .map_err(|error| FromSqlError::Other(Box::new(error)))
            }
            _ => Err(FromSqlError::InvalidType),
        }
    }
}

fn validate_urls(urls: &[String]) -> CoreResult<()> {
    for url in urls {
        if !is_absolute_url(url) {
            return Err(CoreError::invalid_feeds(format!(
                "feed '{url}' is not an absolute URL"
            )));
        }
    }
    Ok(())
}

/// Accepts `scheme://[userinfo@]host[:port][/path][?query][#fragment]`.
///
/// The host is either a bracketed IPv6 literal or a non-empty registered
/// name made of unreserved, sub-delimiter and percent-encoded characters.
pub fn is_absolute_url(raw: &str) -> bool {
    if raw.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return false;
    }
    let Some((scheme, rest)) = raw.split_once("://") else {
        return false;
    };
    if !is_valid_scheme(scheme) {
        return false;
    }

    let authority_end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..authority_end];
    let host_port = authority
        .rsplit_once('@')
        .map_or(authority, |(_, host_port)| host_port);

    if let Some(bracketed) = host_port.strip_prefix('[') {
        return match bracketed.split_once(']') {
            Some((host, "")) => is_ipv6_literal(host),
            Some((host, port)) => {
                is_ipv6_literal(host) && port.strip_prefix(':').is_some_and(is_port)
            }
            None => false,
        };
    }

    let host = match host_port.rsplit_once(':') {
        Some((host, port)) if is_port(port) => host,
        Some(_) => return false,
        None => host_port,
    };
    is_reg_name(host)
}

fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn is_reg_name(host: &str) -> bool {
    if host.is_empty() {
        return false;
    }
    let bytes = host.as_bytes();
    let mut index = 0;
    while index < bytes.len() {
        match bytes[index] {
            b'%' => {
                let escaped = bytes.get(index + 1..index + 3);
                if !escaped.is_some_and(|pair| pair.iter().all(u8::is_ascii_hexdigit)) {
                    return false;
                }
                index += 3;
            }
            byte if byte.is_ascii_alphanumeric() => index += 1,
            b'-' | b'.' | b'_' | b'~' | b'!' | b'$' | b'&' | b'\'' | b'(' | b')' | b'*' | b'+'
            | b',' | b';' | b'=' => index += 1,
            // Internationalized names are accepted as typed.
            byte if !byte.is_ascii() => index += 1,
            _ => return false,
        }
    }
    true
}

fn is_ipv6_literal(host: &str) -> bool {
    host.contains(':') && host.chars().all(|c| c.is_ascii_hexdigit() || matches!(c, ':' | '.'))
}

/// Empty ports are allowed; explicit ones must fit in 16 bits.
fn is_port(digits: &str) -> bool {
    digits.chars().all(|c| c.is_ascii_digit())
        && (digits.is_empty() || digits.parse::<u16>().is_ok())
}
