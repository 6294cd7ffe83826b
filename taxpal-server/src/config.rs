use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful tax assistant. You can provide general \
information about taxes, government spending, and financial matters. Keep your answers concise \
and informative, and remind users to consult a tax professional for advice specific to their \
situation.";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value {value:?} for {var}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: IpAddr,
    pub port: u16,
    /// Allowed CORS origins; a single `*` allows any origin.
    pub allowed_origins: Vec<String>,
    pub static_dir: Option<PathBuf>,
    pub upstream: UpstreamConfig,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
}

#[derive(Clone)]
pub struct UpstreamConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
}

// Hand-written so the credential never reaches a log line.
impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("api_key", &self.api_key.as_ref().map(|_| "[redacted]"))
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .finish_non_exhaustive()
    }
}

/// Timeout and retry knobs for calls to the completion API.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub timeout: Duration,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `retries` (0-based): `base_delay * 2^retries`.
    pub fn backoff(&self, retries: u32) -> Duration {
        self.base_delay.saturating_mul(2u32.saturating_pow(retries))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            timeout: Duration::from_secs(30),
            base_delay: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub max_tokens: f64,
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_tokens: 10.0,
            refill_per_sec: 1.0,
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup. Unset and empty
    /// variables fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let allowed_origins = get("ALLOWED_ORIGINS")
            .map(|raw| {
                raw.split(',')
                    .map(|origin| origin.trim().to_string())
                    .filter(|origin| !origin.is_empty())
                    .collect()
            })
            .unwrap_or_else(|| {
                vec![
                    "http://localhost:3000".to_string(),
                    "http://127.0.0.1:3000".to_string(),
                ]
            });

        let upstream = UpstreamConfig {
            api_key: get("OPENAI_API_KEY").map(|key| key.trim().to_string()),
            model: get("OPENAI_MODEL").unwrap_or_else(|| "gpt-3.5-turbo".to_string()),
            base_url: get("OPENAI_BASE_URL")
                .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
                .trim_end_matches('/')
                .to_string(),
            max_tokens: parse_or(&get, "OPENAI_MAX_TOKENS", 500)?,
            temperature: parse_or(&get, "OPENAI_TEMPERATURE", 0.7)?,
            system_prompt: get("SYSTEM_PROMPT").unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
        };

        let retry = RetryPolicy {
            max_retries: parse_or(&get, "OPENAI_MAX_RETRIES", 2)?,
            timeout: Duration::from_millis(parse_or(&get, "OPENAI_TIMEOUT_MS", 30_000)?),
            base_delay: Duration::from_millis(parse_or(&get, "OPENAI_RETRY_BASE_DELAY_MS", 1_000)?),
        };

        let rate_limit = RateLimitConfig {
            max_tokens: parse_or(&get, "RATE_LIMIT_MAX_TOKENS", 10.0)?,
            refill_per_sec: parse_or(&get, "RATE_LIMIT_REFILL_PER_SEC", 1.0)?,
        };
        if !rate_limit.max_tokens.is_finite() || rate_limit.max_tokens < 1.0 {
            return Err(ConfigError::Invalid {
                var: "RATE_LIMIT_MAX_TOKENS",
                value: rate_limit.max_tokens.to_string(),
                reason: "must be a finite number of at least 1".to_string(),
            });
        }
        if !rate_limit.refill_per_sec.is_finite() || rate_limit.refill_per_sec < 0.0 {
            return Err(ConfigError::Invalid {
                var: "RATE_LIMIT_REFILL_PER_SEC",
                value: rate_limit.refill_per_sec.to_string(),
                reason: "must be a finite, non-negative rate".to_string(),
            });
        }

        Ok(Self {
            host: parse_or(&get, "HOST", IpAddr::from([127, 0, 0, 1]))?,
            port: parse_or(&get, "PORT", 3001)?,
            allowed_origins,
            static_dir: get("STATIC_DIR").map(PathBuf::from),
            upstream,
            retry,
            rate_limit,
        })
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn api_key_configured(&self) -> bool {
        self.upstream.api_key.is_some()
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw,
            reason: e.to_string(),
        }),
    }
}
