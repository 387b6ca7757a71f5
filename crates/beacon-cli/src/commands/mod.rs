//! Subcommand implementations

pub mod admin;
pub mod ingest;
pub mod inspect;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::time::Duration;

/// Pretty JSON on stdout
pub fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialize output")?;
    println!("{}", json);
    Ok(())
}

/// Parse an age such as `90s`, `30m`, `24h` or `7d`. A bare number is hours.
pub fn parse_age(input: &str) -> Result<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (number, unit) = input.split_at(split);
    if number.is_empty() {
        bail!("expected a number followed by s, m, h or d: {:?}", input);
    }
    let value: u64 = number.parse().context("age is out of range")?;
    let seconds = match unit {
        "s" => 1,
        "m" => 60,
        "" | "h" => 3600,
        "d" => 86_400,
        other => bail!("unknown age unit {:?}", other),
    };
    value
        .checked_mul(seconds)
        .map(Duration::from_secs)
        .context("age is out of range")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_age() {
        assert_eq!(parse_age("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_age("30m").unwrap(), Duration::from_secs(1800));
        assert_eq!(parse_age("24").unwrap(), Duration::from_secs(86_400));
        assert_eq!(parse_age("7d").unwrap(), Duration::from_secs(7 * 86_400));
        assert!(parse_age("d").is_err());
        assert!(parse_age("5w").is_err());
    }
}
