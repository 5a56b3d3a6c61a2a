//! Runtime configuration, read from flags or the environment (`.env` is
//! loaded first).

use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};
use clap::Args;

#[derive(Debug, Clone, Args)]
pub struct AppConfig {
    /// Postgres connection string
    #[arg(long, env = "DATABASE_URL", hide_env_values = true)]
    pub database_url: String,

    /// Maximum pooled connections
    #[arg(long, env = "AGIT_MAX_CONNECTIONS", default_value_t = 5)]
    pub max_connections: u32,

    /// UTC offset of the school's calendar day, e.g. +09:00
    #[arg(long, env = "AGIT_UTC_OFFSET", default_value = "+09:00", value_parser = parse_utc_offset)]
    pub utc_offset: FixedOffset,

    /// Seconds between date-rollover checks while watching
    #[arg(long, env = "AGIT_TICK_SECONDS", default_value_t = 60)]
    pub tick_seconds: u64,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_FORMAT_JSON")]
    pub log_json: bool,
}

impl AppConfig {
    pub fn local_now(&self) -> DateTime<FixedOffset> {
        Utc::now().with_timezone(&self.utc_offset)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_seconds.max(1))
    }
}

pub fn parse_utc_offset(value: &str) -> Result<FixedOffset, String> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("z") || trimmed.eq_ignore_ascii_case("utc") {
        return FixedOffset::east_opt(0).ok_or_else(|| "invalid offset".to_string());
    }

    let (sign, rest) = if let Some(rest) = trimmed.strip_prefix('+') {
        (1, rest)
    } else if let Some(rest) = trimmed.strip_prefix('-') {
        (-1, rest)
    } else {
        return Err(format!("offset `{value}` must start with + or -"));
    };
    let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
    let hours: i32 = hours.parse().map_err(|_| format!("invalid hours in `{value}`"))?;
    let minutes: i32 = minutes.parse().map_err(|_| format!("invalid minutes in `{value}`"))?;
    if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
        return Err(format!("offset `{value}` is out of range"));
    }

    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("offset `{value}` is out of range"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_common_offsets() {
        assert_eq!(parse_utc_offset("+09:00").unwrap().local_minus_utc(), 9 * 3600);
        assert_eq!(parse_utc_offset("-05:30").unwrap().local_minus_utc(), -(5 * 3600 + 30 * 60));
        assert_eq!(parse_utc_offset("+9").unwrap().local_minus_utc(), 9 * 3600);
        assert_eq!(parse_utc_offset("UTC").unwrap().local_minus_utc(), 0);
    }

    #[test]
    fn rejects_malformed_offsets() {
        assert!(parse_utc_offset("09:00").is_err());
        assert!(parse_utc_offset("+25:00").is_err());
        assert!(parse_utc_offset("+09:75").is_err());
        assert!(parse_utc_offset("").is_err());
    }
}
