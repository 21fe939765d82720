//! Environment-driven dispatcher configuration.
use serde::Serialize;
use std::env;
use std::str::FromStr;

/// Dispatch mode: `mock` simulates authority responses deterministically,
/// `live` runs the full transform/sign/submit pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchMode {
    Mock,
    Live,
}

impl DispatchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DispatchMode::Mock => "mock",
            DispatchMode::Live => "live",
        }
    }
}

impl FromStr for DispatchMode {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mock" => Ok(DispatchMode::Mock),
            "live" => Ok(DispatchMode::Live),
            other => Err(format!("invalid dispatch mode: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub database_url: String,
    pub port: u16,
    /// Attempt cap; reaching it marks the event terminally rejected.
    pub max_attempts: u32,
    /// Wait minutes indexed by attempt count, clamped to the last entry.
    pub backoff_minutes: Vec<u64>,
    pub mode: DispatchMode,
    /// Simulated rejection rate in [0, 1], mock mode only.
    pub reject_rate: f64,
    /// Fall back to simulated acceptance when the endpoint is unreachable.
    /// Never enabled by default.
    pub fallback_enabled: bool,
    pub batch_size: i64,
    /// Base64-encoded 32-byte AES key for stored certificate material.
    pub cert_enc_key: Option<String>,
    pub jwt_secret: String,
}

const DEFAULT_BACKOFF: &str = "0,1,5,15,60,180,720";

impl DispatcherConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let backoff_minutes = env::var("VERIFACTU_BACKOFF")
            .unwrap_or_else(|_| DEFAULT_BACKOFF.to_string())
            .split(',')
            .filter_map(|n| n.trim().parse().ok())
            .collect::<Vec<u64>>();
        if backoff_minutes.is_empty() {
            anyhow::bail!("VERIFACTU_BACKOFF must contain at least one entry");
        }

        let mode = env::var("VERIFACTU_MODE")
            .unwrap_or_else(|_| "mock".to_string())
            .parse::<DispatchMode>()
            .map_err(|e| anyhow::anyhow!(e))?;

        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost:5432/simplifica".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()?,
            max_attempts: env::var("VERIFACTU_MAX_ATTEMPTS")
                .unwrap_or_else(|_| "7".to_string())
                .parse()?,
            backoff_minutes,
            mode,
            reject_rate: env::var("VERIFACTU_REJECT_RATE")
                .unwrap_or_else(|_| "0".to_string())
                .parse()?,
            fallback_enabled: env::var("VERIFACTU_ENABLE_FALLBACK")
                .map(|v| v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            batch_size: env::var("VERIFACTU_BATCH_SIZE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()?,
            cert_enc_key: env::var("VERIFACTU_CERT_ENC_KEY").ok(),
            jwt_secret: env::var("JWT_SECRET").unwrap_or_default(),
        })
    }

    /// Backoff wait for a given attempt count, clamped to the last entry of
    /// the table for attempts beyond its length.
    pub fn backoff_minutes(&self, attempts: u32) -> u64 {
        let index = (attempts as usize).min(self.backoff_minutes.len() - 1);
        self.backoff_minutes[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_backoff(backoff: Vec<u64>) -> DispatcherConfig {
        DispatcherConfig {
            database_url: String::new(),
            port: 8080,
            max_attempts: 7,
            backoff_minutes: backoff,
            mode: DispatchMode::Mock,
            reject_rate: 0.0,
            fallback_enabled: false,
            batch_size: 100,
            cert_enc_key: None,
            jwt_secret: String::new(),
        }
    }

    #[test]
    fn backoff_never_decreases_and_clamps() {
        let config = config_with_backoff(vec![0, 1, 5, 15, 60, 180, 720]);
        let mut previous = 0;
        for attempts in 0..20 {
            let wait = config.backoff_minutes(attempts);
            assert!(wait >= previous, "backoff decreased at attempt {attempts}");
            previous = wait;
        }
        assert_eq!(config.backoff_minutes(6), 720);
        assert_eq!(config.backoff_minutes(7), 720);
        assert_eq!(config.backoff_minutes(100), 720);
    }

    #[test]
    fn first_attempt_is_immediate_with_default_table() {
        let config = config_with_backoff(vec![0, 1, 5]);
        assert_eq!(config.backoff_minutes(0), 0);
        assert_eq!(config.backoff_minutes(1), 1);
    }

    #[test]
    fn dispatch_mode_parses() {
        assert_eq!("mock".parse::<DispatchMode>().unwrap(), DispatchMode::Mock);
        assert_eq!("LIVE".parse::<DispatchMode>().unwrap(), DispatchMode::Live);
        assert!("dry-run".parse::<DispatchMode>().is_err());
    }
}
