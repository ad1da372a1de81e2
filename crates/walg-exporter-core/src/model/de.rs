//! Lenient field decoders for the inventory tool's JSON.
//!
//! Different wal-g versions emit `null` for missing values, integers where
//! other versions emit strings, and Go's zero time for unset timestamps.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};

use crate::lsn;

/// Go's `time.Time{}` rendered as RFC 3339.
const GO_ZERO_TIME_SECS: i64 = -62_135_596_800;

/// `null` decodes to `T::default()`.
pub(crate) fn nullable<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TextOrNumber {
    Text(String),
    Number(u64),
}

/// String field that some versions emit as an unsigned integer.
pub(crate) fn text_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<TextOrNumber>::deserialize(deserializer)? {
        Some(TextOrNumber::Text(s)) => s,
        Some(TextOrNumber::Number(n)) => n.to_string(),
        None => String::new(),
    })
}

/// LSN field: either `"16/B374D848"` or its 64-bit value.
pub(crate) fn lsn_text<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<TextOrNumber>::deserialize(deserializer)? {
        Some(TextOrNumber::Text(s)) => s,
        Some(TextOrNumber::Number(n)) => lsn::format(n),
        None => String::new(),
    })
}

/// RFC 3339 timestamp with any offset; empty, `null` and Go's zero time are unset.
pub(crate) fn timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    if raw.is_empty() {
        return Ok(None);
    }
    let parsed = DateTime::parse_from_rfc3339(&raw).map_err(serde::de::Error::custom)?;
    if parsed.timestamp() == GO_ZERO_TIME_SECS {
        return Ok(None);
    }
    Ok(Some(parsed.with_timezone(&Utc)))
}
