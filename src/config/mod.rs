//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Participants per session
    pub group_size: usize,
    /// Minimum connected participants for gated stages
    pub min_players: usize,
    /// Number of ultimatum rounds
    pub rounds: u32,
    /// Grace period before a disconnection becomes fatal
    pub disconnect_countdown: Duration,
    /// Experimental units per unit of payout currency
    pub ecu_per_unit: f64,

    /// JSON file with participant access/exit codes
    pub codes_file: String,
    /// Checkout endpoint; checkout is only logged when unset
    pub checkout_url: Option<String>,

    /// Public base URL for redirects
    pub public_base_url: String,
    /// Allowed client origin for CORS
    pub client_origin: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        // Render provides PORT env var, fall back to SERVER_ADDR or default
        let server_addr = if let Ok(port) = env::var("PORT") {
            format!("0.0.0.0:{}", port)
        } else {
            env::var("SERVER_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
        };

        let config = Self {
            server_addr: server_addr
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,

            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),

            group_size: parse_or("GROUP_SIZE", 2)?,
            min_players: parse_or("MIN_PLAYERS", 2)?,
            rounds: parse_or("ROUNDS", 1)?,
            disconnect_countdown: Duration::from_secs(parse_or("DISCONNECT_COUNTDOWN_SECS", 30)?),
            ecu_per_unit: parse_or("ECU_PER_UNIT", 1000.0)?,

            codes_file: env::var("CODES_FILE").map_err(|_| ConfigError::Missing("CODES_FILE"))?,
            checkout_url: env::var("CHECKOUT_URL").ok().filter(|s| !s.is_empty()),

            public_base_url: env::var("PUBLIC_BASE_URL")
                .map_err(|_| ConfigError::Missing("PUBLIC_BASE_URL"))?,
            client_origin: env::var("CLIENT_ORIGIN")
                .map_err(|_| ConfigError::Missing("CLIENT_ORIGIN"))?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.min_players == 0 || self.group_size < self.min_players {
            return Err(ConfigError::Invalid("GROUP_SIZE must be >= MIN_PLAYERS >= 1"));
        }
        if self.rounds == 0 {
            return Err(ConfigError::Invalid("ROUNDS must be at least 1"));
        }
        if self.ecu_per_unit <= 0.0 {
            return Err(ConfigError::Invalid("ECU_PER_UNIT must be positive"));
        }
        Ok(())
    }

    /// Page survivors are sent to after a fatal disconnection
    pub fn terminated_url(&self) -> String {
        format!("{}/ultimatum/gameterminated.html", self.public_base_url.trim_end_matches('/'))
    }

    /// Page unauthorized participants are sent to
    pub fn unauthorized_url(&self) -> String {
        format!("{}/ultimatum/unauth.htm", self.public_base_url.trim_end_matches('/'))
    }
}

fn parse_or<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Malformed(key)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Malformed value for environment variable: {0}")]
    Malformed(&'static str),

    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
