// src/config.rs
use chrono::NaiveDate;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("invalid value for {var}: {reason}")]
pub struct ConfigError {
    pub var: &'static str,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Scylla,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "scylla" => Ok(StoreBackend::Scylla),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(format!("unknown store backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub store: StoreBackend,
    pub scylla_node: String,
    pub keyspace: String,
    pub market_data_url: String,
    pub exchange_suffix: String,
    pub index_tickers: Vec<String>,
    pub provider_timeout: Duration,
    pub provider_max_retries: u32,
    pub provider_retry_backoff: Duration,
    pub history_start: NaiveDate,
    pub cors_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |var: &'static str, default: &str| -> String {
            lookup(var)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .unwrap_or_else(|| default.to_string())
        };

        let keyspace = get("SCYLLA_KEYSPACE", "nse_portfolio");
        if !keyspace.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(ConfigError {
                var: "SCYLLA_KEYSPACE",
                reason: "only letters, digits and '_' are allowed".to_string(),
            });
        }

        let cors_origins = split_list(&get("CORS_ALLOWED_ORIGINS", ""));
        if let Some(bad) = cors_origins
            .iter()
            .find(|o| !(o.starts_with("http://") || o.starts_with("https://")) || o.ends_with('/'))
        {
            return Err(ConfigError {
                var: "CORS_ALLOWED_ORIGINS",
                reason: format!("'{}' is not a scheme://host[:port] origin", bad),
            });
        }

        Ok(Config {
            bind_addr: parse("BIND_ADDR", &get("BIND_ADDR", "127.0.0.1:5000"))?,
            store: parse("STORE_BACKEND", &get("STORE_BACKEND", "scylla"))?,
            scylla_node: get("SCYLLA_NODE", "127.0.0.1:9042"),
            keyspace,
            market_data_url: get(
                "MARKET_DATA_URL",
                "https://query1.finance.yahoo.com/v8/finance/chart/",
            ),
            exchange_suffix: get("EXCHANGE_SUFFIX", ".NS"),
            index_tickers: split_list(&get(
                "INDEX_TICKERS",
                "^NSEI,^NSEBANK,^CNX100,^NSEMDCP50",
            )),
            provider_timeout: Duration::from_secs(parse(
                "PROVIDER_TIMEOUT_SECS",
                &get("PROVIDER_TIMEOUT_SECS", "10"),
            )?),
            provider_max_retries: parse(
                "PROVIDER_MAX_RETRIES",
                &get("PROVIDER_MAX_RETRIES", "2"),
            )?,
            provider_retry_backoff: Duration::from_millis(parse(
                "PROVIDER_RETRY_BACKOFF_MS",
                &get("PROVIDER_RETRY_BACKOFF_MS", "250"),
            )?),
            history_start: parse("HISTORY_START", &get("HISTORY_START", "2020-01-01"))?,
            cors_origins,
        })
    }
}

fn parse<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse().map_err(|e: T::Err| ConfigError {
        var,
        reason: e.to_string(),
    })
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:5000".parse().unwrap());
        assert_eq!(config.store, StoreBackend::Scylla);
        assert_eq!(config.exchange_suffix, ".NS");
        assert_eq!(
            config.index_tickers,
            vec!["^NSEI", "^NSEBANK", "^CNX100", "^NSEMDCP50"]
        );
        assert_eq!(config.provider_timeout, Duration::from_secs(10));
        assert_eq!(
            config.history_start,
            NaiveDate::from_ymd_opt(2020, 1, 1).unwrap()
        );
        assert!(config.cors_origins.is_empty());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = config_from(&[
            ("STORE_BACKEND", "Memory"),
            ("PROVIDER_MAX_RETRIES", "5"),
            ("CORS_ALLOWED_ORIGINS", "http://localhost:3000, https://app.example"),
        ])
        .unwrap();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.provider_max_retries, 5);
        assert_eq!(
            config.cors_origins,
            vec!["http://localhost:3000", "https://app.example"]
        );
    }

    #[test]
    fn bad_values_name_the_variable() {
        let err = config_from(&[("PROVIDER_TIMEOUT_SECS", "soon")]).unwrap_err();
        assert_eq!(err.var, "PROVIDER_TIMEOUT_SECS");

        let err = config_from(&[("SCYLLA_KEYSPACE", "drop table;")]).unwrap_err();
        assert_eq!(err.var, "SCYLLA_KEYSPACE");

        let err = config_from(&[("CORS_ALLOWED_ORIGINS", "localhost:3000")]).unwrap_err();
        assert_eq!(err.var, "CORS_ALLOWED_ORIGINS");
    }
}
