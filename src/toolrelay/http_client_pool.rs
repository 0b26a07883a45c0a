//! HTTP client pool shared by the MCP transport and the inference clients.
//!
//! Each base URL gets its own configured `reqwest::Client`, so repeated handshakes and tool
//! calls against the same server reuse connections instead of paying DNS/TLS setup again.

use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::time::Duration;

/// Global cache of HTTP clients indexed by base URL and request timeout.
static CLIENT_POOL: Lazy<DashMap<(String, u64), reqwest::Client>> = Lazy::new(DashMap::new);

/// Creates or retrieves a shared HTTP client for the given base URL.
///
/// Clients built for the same URL but a different `timeout` are kept apart.
pub fn get_or_create_client(base_url: &str, timeout: Duration) -> reqwest::Client {
    CLIENT_POOL
        .entry((base_url.to_string(), timeout.as_secs()))
        .or_insert_with(|| create_pooled_client(timeout))
        .clone()
}

/// Number of distinct clients currently pooled for `base_url`.
pub fn pooled_clients_for(base_url: &str) -> usize {
    CLIENT_POOL
        .iter()
        .filter(|entry| entry.key().0 == base_url)
        .count()
}

fn create_pooled_client(timeout: Duration) -> reqwest::Client {
    reqwest::ClientBuilder::new()
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Some(Duration::from_secs(90)))
        .tcp_keepalive(Some(Duration::from_secs(60)))
        .connect_timeout(Duration::from_secs(30))
        .timeout(timeout)
        .build()
        .expect("Failed to build HTTP client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_url_reuses_client() {
        let _a = get_or_create_client("http://pool-test.local", Duration::from_secs(30));
        let _b = get_or_create_client("http://pool-test.local", Duration::from_secs(30));
        assert_eq!(pooled_clients_for("http://pool-test.local"), 1);
    }

    #[test]
    fn test_timeout_partitions_pool() {
        let _a = get_or_create_client("http://pool-timeout.local", Duration::from_secs(5));
        let _b = get_or_create_client("http://pool-timeout.local", Duration::from_secs(10));
        assert_eq!(pooled_clients_for("http://pool-timeout.local"), 2);
    }
}
