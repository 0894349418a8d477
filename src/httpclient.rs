//! Outbound HTTP client selection. Three flavors: direct (proxies
//! explicitly bypassed), system (the `proxy_url` setting, falling back to
//! environment proxies when unset), and per-channel proxy URLs. Clients are
//! built once and reused.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

use crate::{RelayError, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

pub struct ClientPool {
    direct: reqwest::Client,
    system: RwLock<(String, reqwest::Client)>,
    per_proxy: Mutex<HashMap<String, reqwest::Client>>,
}

fn base_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder().connect_timeout(CONNECT_TIMEOUT)
}

fn build_direct() -> Result<reqwest::Client> {
    Ok(base_builder().no_proxy().build()?)
}

fn build_with_proxy(url: &str) -> Result<reqwest::Client> {
    let proxy = reqwest::Proxy::all(url)
        .map_err(|err| RelayError::InvalidInput(format!("invalid proxy url {url}: {err}")))?;
    Ok(base_builder().proxy(proxy).build()?)
}

impl ClientPool {
    pub fn new() -> Result<Self> {
        Ok(Self {
            direct: build_direct()?,
            // Empty proxy URL: honor environment proxies (reqwest default).
            system: RwLock::new((String::new(), base_builder().build()?)),
            per_proxy: Mutex::new(HashMap::new()),
        })
    }

    /// Rebuilds the system client when the `proxy_url` setting changes.
    pub fn set_system_proxy(&self, url: &str) -> Result<()> {
        let mut system = self.system.write().expect("client pool poisoned");
        if system.0 == url {
            return Ok(());
        }
        let client = if url.is_empty() {
            base_builder().build()?
        } else {
            build_with_proxy(url)?
        };
        *system = (url.to_string(), client);
        Ok(())
    }

    /// Client for a channel: its own proxy URL wins, then the use-proxy
    /// flag selects between the system client and the direct client.
    pub fn client(&self, use_proxy: bool, channel_proxy: &str) -> Result<reqwest::Client> {
        if !channel_proxy.is_empty() {
            let mut cache = self.per_proxy.lock().expect("client pool poisoned");
            if let Some(client) = cache.get(channel_proxy) {
                return Ok(client.clone());
            }
            let client = build_with_proxy(channel_proxy)?;
            cache.insert(channel_proxy.to_string(), client.clone());
            return Ok(client);
        }
        if use_proxy {
            return Ok(self.system.read().expect("client pool poisoned").1.clone());
        }
        Ok(self.direct.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_proxy_overrides_flags() {
        let pool = ClientPool::new().expect("pool");
        assert!(pool.client(true, "http://127.0.0.1:7890").is_ok());
        assert!(pool.client(false, "socks5://127.0.0.1:1080").is_ok());
        assert!(pool.client(false, "not a proxy url").is_err());
    }

    #[test]
    fn system_proxy_swap_is_idempotent() {
        let pool = ClientPool::new().expect("pool");
        pool.set_system_proxy("http://127.0.0.1:7890").expect("set");
        pool.set_system_proxy("http://127.0.0.1:7890").expect("set again");
        pool.set_system_proxy("").expect("clear");
        assert!(pool.client(true, "").is_ok());
    }
}
