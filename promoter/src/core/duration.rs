//! Human-readable duration strings (`"90s"`, `"5m"`, `"1h30m"`).
//!
//! Step retry timeouts and sync window durations are written this way in
//! step configuration and Argo CD resources.

use std::time::Duration;

use anyhow::{Result, anyhow, bail};

/// Parse a duration made of `<number><unit>` segments.
///
/// Supported units: `ms`, `s`, `m`, `h`. Segments may repeat (`1h30m`).
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        bail!("empty duration");
    }
    if trimmed == "0" {
        return Ok(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = trimmed;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| anyhow!("duration {input:?} is missing a unit"))?;
        if digits == 0 {
            bail!("invalid duration {input:?}");
        }
        let value: u64 = rest[..digits]
            .parse()
            .map_err(|_| anyhow!("invalid duration {input:?}"))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let segment = match &rest[..unit_len] {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(60 * 60).map(Duration::from_secs),
            unit => bail!("unknown unit {unit:?} in duration {input:?}"),
        };
        total = segment
            .and_then(|segment| total.checked_add(segment))
            .ok_or_else(|| anyhow!("duration {input:?} is too long"))?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

/// Render a duration in the same notation accepted by [`parse_duration`].
pub fn format_duration(duration: Duration) -> String {
    let mut secs = duration.as_secs();
    let millis = duration.subsec_millis();
    if secs == 0 && millis == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();
    let hours = secs / 3600;
    secs %= 3600;
    let minutes = secs / 60;
    secs %= 60;
    if hours > 0 {
        out.push_str(&format!("{hours}h"));
    }
    if minutes > 0 {
        out.push_str(&format!("{minutes}m"));
    }
    if secs > 0 {
        out.push_str(&format!("{secs}s"));
    }
    if millis > 0 {
        out.push_str(&format!("{millis}ms"));
    }
    out
}

/// Serde adapter for `Option<Duration>` fields written as duration strings.
pub mod option {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => s.serialize_str(&super::format_duration(*duration)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| super::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
