//! Utility helpers shared by the binaries.

use std::time::Duration;

/// Parses a human-readable duration ("500ms", "1s", "2m", or bare seconds).
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num_str, millis_per_unit) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1)
    } else if let Some(num) = s.strip_suffix('s') {
        (num, 1000)
    } else if let Some(num) = s.strip_suffix('m') {
        (num, 60_000)
    } else {
        (s, 1000)
    };

    let value = num_str
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid duration '{}': {}", s, e))?;
    let millis = value
        .checked_mul(millis_per_unit)
        .ok_or_else(|| format!("duration '{}' is too large", s))?;
    if millis == 0 {
        return Err(format!("duration '{}' must be positive", s));
    }
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1s").unwrap(), Duration::from_secs(1));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration(" 5 ").unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("1h").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration(&format!("{}m", u64::MAX)).is_err());
    }
}
