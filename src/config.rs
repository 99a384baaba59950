// src/config.rs
use log::warn;
use std::env;
use std::net::SocketAddr;

/// Runtime settings, read once at startup. Every value has a default so the
/// server comes up with nothing but a local Scylla node.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub scylla_node: String,
    pub jwt_secret: String,
    pub coingecko_base: String,
    pub alphavantage_base: String,
    pub alphavantage_key: String,
    pub news_base: String,
    pub news_key: String,
    pub request_timeout_secs: u64,
}

fn var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Config {
    pub fn from_env() -> Self {
        let bind_raw = var_or("BIND_ADDR", "127.0.0.1:5000");
        let bind_addr = bind_raw.parse().unwrap_or_else(|_| {
            warn!("Invalid BIND_ADDR {}, using 127.0.0.1:5000", bind_raw);
            SocketAddr::from(([127, 0, 0, 1], 5000))
        });
        let timeout_raw = var_or("REQUEST_TIMEOUT_SECS", "10");
        let request_timeout_secs = timeout_raw.parse().unwrap_or_else(|_| {
            warn!("Invalid REQUEST_TIMEOUT_SECS {}, using 10", timeout_raw);
            10
        });

        Config {
            bind_addr,
            scylla_node: var_or("SCYLLA_NODE", "127.0.0.1:9042"),
            jwt_secret: var_or("JWT_SECRET", "your_jwt_secret"),
            coingecko_base: var_or("COINGECKO_BASE_URL", "https://api.coingecko.com/api/v3"),
            alphavantage_base: var_or("ALPHAVANTAGE_BASE_URL", "https://www.alphavantage.co"),
            alphavantage_key: var_or("ALPHAVANTAGE_API_KEY", "demo"),
            news_base: var_or("NEWS_BASE_URL", "https://newsapi.org/v2"),
            news_key: var_or("NEWS_API_KEY", ""),
            request_timeout_secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_usable() {
        let config = Config::from_env();
        assert_eq!(config.bind_addr.port(), 5000);
        assert_eq!(config.scylla_node, "127.0.0.1:9042");
        assert!(config.request_timeout_secs > 0);
    }
}
