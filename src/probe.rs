//! Channel base-URL delay probe: a ranged GET (`Range: bytes=0-0`) against
//! each base URL with a 10 s deadline, using the same client selection as
//! the relay. Measured latencies are written back onto the channel's
//! base-url entries; a URL that fails the probe keeps its previous reading.

use std::time::{Duration, Instant};

use reqwest::header::RANGE;
use tracing::{debug, warn};

use crate::httpclient::ClientPool;
use crate::registry::Registry;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Round-trip time for one base URL. Any response counts as reachable; the
/// status code is irrelevant here.
pub async fn probe_base_url(client: &reqwest::Client, url: &str) -> Option<i64> {
    let start = Instant::now();
    let result = client
        .get(url)
        .header(RANGE, "bytes=0-0")
        .timeout(PROBE_TIMEOUT)
        .send()
        .await;
    match result {
        Ok(_) => Some(start.elapsed().as_millis() as i64),
        Err(err) => {
            debug!(%url, %err, "delay probe failed");
            None
        }
    }
}

/// One probe pass over every channel. Failures log and continue.
pub async fn probe_channels(registry: &Registry, clients: &ClientPool) {
    for channel in registry.channels() {
        if channel.base_urls.is_empty() {
            continue;
        }
        let client = match clients.client(channel.use_proxy, &channel.channel_proxy) {
            Ok(client) => client,
            Err(err) => {
                warn!(channel = %channel.name, %err, "delay probe skipped: no http client");
                continue;
            }
        };

        let mut base_urls = channel.base_urls.clone();
        let mut measured = false;
        for base_url in &mut base_urls {
            if base_url.url.is_empty() {
                continue;
            }
            if let Some(delay_ms) = probe_base_url(&client, &base_url.url).await {
                base_url.delay_ms = delay_ms;
                measured = true;
            }
        }

        if measured {
            if let Err(err) = registry.update_base_url_delays(channel.id, base_urls).await {
                warn!(channel = %channel.name, %err, "failed to record base url delays");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{AutoGroupPolicy, BaseUrl, Channel, Store};
    use httpmock::prelude::*;

    #[tokio::test]
    async fn probe_sends_ranged_get_and_measures() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(GET).path("/").header("range", "bytes=0-0");
                then.status(206).body("x");
            })
            .await;

        let delay = probe_base_url(&reqwest::Client::new(), &server.base_url())
            .await
            .expect("reachable");
        assert!(delay >= 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn unreachable_url_yields_none() {
        let client = reqwest::Client::new();
        assert!(probe_base_url(&client, "http://127.0.0.1:1").await.is_none());
    }

    #[tokio::test]
    async fn probe_pass_persists_delays_on_the_channel() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(GET).path("/");
                then.status(200).body("ok");
            })
            .await;

        let dir = tempfile::tempdir().expect("tempdir");
        let store = Store::new(dir.path().join("probe.db"));
        store.init().await.expect("init");
        let registry = Registry::new(store.clone());
        registry.load().await.expect("load");
        let created = registry
            .create_channel(Channel {
                id: 0,
                name: "probed".to_string(),
                dialect: Some(crate::dialect::OutboundDialect::OpenAiChat),
                enabled: true,
                base_urls: vec![
                    BaseUrl::new(server.base_url()),
                    // Unreachable: keeps its previous reading.
                    BaseUrl {
                        url: "http://127.0.0.1:1".to_string(),
                        delay_ms: 777,
                    },
                ],
                keys: Vec::new(),
                models: String::new(),
                custom_models: String::new(),
                use_proxy: false,
                auto_sync: false,
                auto_group: AutoGroupPolicy::None,
                channel_proxy: String::new(),
            })
            .await
            .expect("channel");

        let clients = ClientPool::new().expect("clients");
        probe_channels(&registry, &clients).await;

        let cached = registry.channel(created.id).expect("channel");
        assert!(cached.base_urls[0].delay_ms >= 0);
        assert_eq!(cached.base_urls[1].delay_ms, 777);

        let persisted = store.load_channel(created.id).await.expect("load");
        assert_eq!(persisted.base_urls, cached.base_urls);
    }
}
