//! Startup configuration.
//!
//! The pipeline only ever sees a constructed [`Config`]. Where the values
//! come from is the binary's business; [`Config::from_env`] is the one
//! source it ships with.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::Error;

/// Longest accepted token lifetime: a year.
const MAX_TOKEN_TTL: Duration = Duration::from_secs(365 * 24 * 3600);

/// Debug or release. Only affects log verbosity and what `/health` reports.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum RunMode {
    #[default]
    Debug,
    Release,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Release => "release",
        }
    }
}

#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Requests allowed per key per window.
    pub max_requests: u32,
    pub window: Duration,
    /// Take the client key from `X-Forwarded-For` / `X-Real-IP` instead of
    /// the peer address. Only safe behind a proxy that overwrites them.
    pub trust_forwarded_for: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            trust_forwarded_for: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub bind: SocketAddr,
    pub frontend_origin: String,
    pub mode: RunMode,
    pub rate_limit: RateLimitConfig,
    pub jwt_secret: String,
    pub token_ttl: Duration,
    pub uploads_dir: PathBuf,
    pub max_body_bytes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 3000)),
            frontend_origin: "http://localhost:8080".to_owned(),
            mode: RunMode::Debug,
            rate_limit: RateLimitConfig::default(),
            jwt_secret: String::new(),
            token_ttl: Duration::from_secs(24 * 3600),
            uploads_dir: PathBuf::from("./uploads"),
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

impl Config {
    /// Reads `PORT`, `FRONTEND_URL`, `APP_MODE`, `RATE_LIMIT_MAX`,
    /// `RATE_LIMIT_WINDOW_SECS`, `TRUST_FORWARDED_FOR`, `JWT_SECRET`,
    /// `TOKEN_TTL_HOURS`, `UPLOADS_DIR` and `MAX_BODY_BYTES`. Unset or empty
    /// variables keep their defaults.
    pub fn from_env() -> Result<Self, Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, Error> {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut cfg = Self::default();

        if let Some(port) = get("PORT") {
            let port: u16 = parse("PORT", &port)?;
            cfg.bind.set_port(port);
        }
        if let Some(origin) = get("FRONTEND_URL") {
            cfg.frontend_origin = origin.trim_end_matches('/').to_owned();
        }
        if let Some(mode) = get("APP_MODE") {
            cfg.mode = match mode.as_str() {
                "debug" => RunMode::Debug,
                "release" => RunMode::Release,
                other => return Err(Error::Config(format!("APP_MODE: unknown mode `{other}`"))),
            };
        }
        if let Some(max) = get("RATE_LIMIT_MAX") {
            cfg.rate_limit.max_requests = parse("RATE_LIMIT_MAX", &max)?;
        }
        if let Some(secs) = get("RATE_LIMIT_WINDOW_SECS") {
            cfg.rate_limit.window = Duration::from_secs(parse("RATE_LIMIT_WINDOW_SECS", &secs)?);
        }
        if let Some(flag) = get("TRUST_FORWARDED_FOR") {
            cfg.rate_limit.trust_forwarded_for = parse("TRUST_FORWARDED_FOR", &flag)?;
        }
        if let Some(secret) = get("JWT_SECRET") {
            cfg.jwt_secret = secret;
        }
        if let Some(hours) = get("TOKEN_TTL_HOURS") {
            let hours: u64 = parse("TOKEN_TTL_HOURS", &hours)?;
            let secs = hours
                .checked_mul(3600)
                .ok_or_else(|| Error::Config(format!("TOKEN_TTL_HOURS: `{hours}` is out of range")))?;
            cfg.token_ttl = Duration::from_secs(secs);
        }
        if let Some(dir) = get("UPLOADS_DIR") {
            cfg.uploads_dir = PathBuf::from(dir);
        }
        if let Some(bytes) = get("MAX_BODY_BYTES") {
            cfg.max_body_bytes = parse("MAX_BODY_BYTES", &bytes)?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Rejects configurations the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        if self.jwt_secret.len() < 16 {
            return Err(Error::Config("JWT_SECRET must be at least 16 bytes".to_owned()));
        }
        if self.rate_limit.max_requests == 0 {
            return Err(Error::Config("RATE_LIMIT_MAX must be positive".to_owned()));
        }
        if self.rate_limit.window.is_zero() {
            return Err(Error::Config("RATE_LIMIT_WINDOW_SECS must be positive".to_owned()));
        }
        if self.token_ttl.is_zero() || self.token_ttl > MAX_TOKEN_TTL {
            return Err(Error::Config(format!(
                "TOKEN_TTL_HOURS must be between 1 and {}",
                MAX_TOKEN_TTL.as_secs() / 3600
            )));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, Error>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| Error::Config(format!("{key}: {e}")))
}
