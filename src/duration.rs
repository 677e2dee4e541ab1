//! Human-readable durations ("15m", "24h", "2s") for cache and timeout settings.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{de, Deserialize, Deserializer, Serializer};

const SECS_PER_MINUTE: u64 = 60;
const SECS_PER_HOUR: u64 = 60 * SECS_PER_MINUTE;
const SECS_PER_DAY: u64 = 24 * SECS_PER_HOUR;

/// Parse a duration string like "1d", "24h", "15m", "2s" or "500ms".
///
/// Input is case-insensitive and surrounding whitespace is ignored.
///
/// ```
/// use holdbook::duration::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(15 * 60));
/// assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
/// ```
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .context("Duration must end with a unit (ms, s, m, h or d)")?;
    let (num, unit) = s.split_at(split);
    if num.is_empty() {
        anyhow::bail!("Duration {s:?} has no number");
    }
    let num: u64 = num
        .parse()
        .with_context(|| format!("Invalid number in duration {s:?}"))?;

    let duration = match unit {
        "ms" => Duration::from_millis(num),
        "s" => Duration::from_secs(num),
        "m" => Duration::from_secs(num.checked_mul(SECS_PER_MINUTE).context("Duration is too large")?),
        "h" => Duration::from_secs(num.checked_mul(SECS_PER_HOUR).context("Duration is too large")?),
        "d" => Duration::from_secs(num.checked_mul(SECS_PER_DAY).context("Duration is too large")?),
        other => anyhow::bail!("Unknown duration unit {other:?}"),
    };
    Ok(duration)
}

/// Render a duration using the largest unit that divides it evenly.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() != 0 || (d.as_secs() == 0 && !d.is_zero()) {
        return format!("{}ms", d.as_millis());
    }
    let secs = d.as_secs();
    if secs == 0 {
        return "0s".to_string();
    }
    for (unit, size) in [("d", SECS_PER_DAY), ("h", SECS_PER_HOUR), ("m", SECS_PER_MINUTE)] {
        if secs % size == 0 {
            return format!("{}{unit}", secs / size);
        }
    }
    format!("{secs}s")
}

/// Convert to a chrono duration, saturating on overflow.
pub fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Serde deserializer for duration strings.
///
/// Use with `#[serde(deserialize_with = "deserialize_duration")]`.
pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration(&s).map_err(de::Error::custom)
}

/// Serde serializer producing the same format [`parse_duration`] accepts.
pub fn serialize_duration<S>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format_duration(*d))
}
