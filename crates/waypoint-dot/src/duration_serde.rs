use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::Duration;

pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format!("{}ms", duration.as_millis()))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    parse_duration_str(&s).map_err(serde::de::Error::custom)
}

pub(crate) fn parse_duration_str(s: &str) -> Result<Duration, String> {
    let (digits, unit): (&str, fn(u64) -> Duration) = if let Some(v) = s.strip_suffix("ms") {
        (v, Duration::from_millis)
    } else if let Some(v) = s.strip_suffix('s') {
        (v, Duration::from_secs)
    } else if let Some(v) = s.strip_suffix('m') {
        (v, |n| Duration::from_secs(n * 60))
    } else if let Some(v) = s.strip_suffix('h') {
        (v, |n| Duration::from_secs(n * 3600))
    } else if let Some(v) = s.strip_suffix('d') {
        (v, |n| Duration::from_secs(n * 86400))
    } else {
        return Err(format!("unknown duration format: {s}"));
    };
    let n: u64 = digits
        .parse()
        .map_err(|e| format!("invalid duration '{s}': {e}"))?;
    Ok(unit(n))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_suffix() {
        assert_eq!(parse_duration_str("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration_str("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration_str("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration_str("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration_str("1d").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn rejects_missing_or_bad_suffix() {
        assert!(parse_duration_str("42").is_err());
        assert!(parse_duration_str("xs").is_err());
    }
}
