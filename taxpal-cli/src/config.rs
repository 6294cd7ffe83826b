use anyhow::{Context, Result};
use std::str::FromStr;
use std::time::Duration;

use crate::controller::ResendPolicy;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub gateway_url: String,
    pub chat_timeout: Duration,
    pub probe_timeout: Duration,
    pub probe_interval: Duration,
    pub resend: ResendPolicy,
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Ok(Self {
            gateway_url: get("TAXPAL_GATEWAY_URL")
                .unwrap_or_else(|| "http://127.0.0.1:3001".to_string())
                .trim_end_matches('/')
                .to_string(),
            chat_timeout: Duration::from_millis(parse_or(&get, "TAXPAL_CHAT_TIMEOUT_MS", 30_000)?),
            probe_timeout: Duration::from_millis(parse_or(&get, "TAXPAL_PROBE_TIMEOUT_MS", 10_000)?),
            probe_interval: Duration::from_secs(parse_or(&get, "TAXPAL_PROBE_INTERVAL_SECS", 30)?),
            resend: ResendPolicy {
                base: Duration::from_millis(parse_or(&get, "TAXPAL_RETRY_BASE_MS", 1_000)?),
                cap: Duration::from_millis(parse_or(&get, "TAXPAL_RETRY_CAP_MS", 10_000)?),
                ..ResendPolicy::default()
            },
        })
    }
}

fn parse_or<T, G>(get: &G, var: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value {raw:?} for {var}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_values() {
        let config = ClientConfig::from_lookup(|_| None).unwrap();

        assert_eq!(config.gateway_url, "http://127.0.0.1:3001");
        assert_eq!(config.chat_timeout, Duration::from_secs(30));
        assert_eq!(config.probe_timeout, Duration::from_secs(10));
        assert_eq!(config.probe_interval, Duration::from_secs(30));
        assert_eq!(config.resend, ResendPolicy::default());
    }

    #[test]
    fn overrides_and_errors() {
        let config = ClientConfig::from_lookup(|key| match key {
            "TAXPAL_GATEWAY_URL" => Some("http://tax.example/".to_string()),
            "TAXPAL_RETRY_BASE_MS" => Some("250".to_string()),
            _ => None,
        })
        .unwrap();
        assert_eq!(config.gateway_url, "http://tax.example");
        assert_eq!(config.resend.base, Duration::from_millis(250));

        let err = ClientConfig::from_lookup(|key| {
            (key == "TAXPAL_PROBE_INTERVAL_SECS").then(|| "soon".to_string())
        })
        .unwrap_err();
        assert!(err.to_string().contains("TAXPAL_PROBE_INTERVAL_SECS"));
    }
}
