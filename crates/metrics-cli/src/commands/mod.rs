//! CLI command implementations

pub mod entities;
pub mod export;
pub mod query;

use anyhow::{bail, Result};

/// Parse a duration like `30m`, `6h`, `7d` into seconds.
pub fn parse_duration_secs(s: &str) -> Result<i64> {
    let s = s.trim();
    let (value, unit) = s.split_at(s.len().saturating_sub(1));
    let value: i64 = value
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration: {}", s))?;
    if value <= 0 {
        bail!("duration must be positive: {}", s);
    }
    match unit {
        "s" => Ok(value),
        "m" => Ok(value * 60),
        "h" => Ok(value * 3600),
        "d" => Ok(value * 86400),
        _ => bail!("invalid duration unit in {:?} (use s, m, h, or d)", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration_secs("30s").unwrap(), 30);
        assert_eq!(parse_duration_secs("5m").unwrap(), 300);
        assert_eq!(parse_duration_secs("24h").unwrap(), 86400);
        assert_eq!(parse_duration_secs("7d").unwrap(), 604800);
        assert!(parse_duration_secs("10").is_err());
        assert!(parse_duration_secs("-1h").is_err());
        assert!(parse_duration_secs("h").is_err());
    }
}
