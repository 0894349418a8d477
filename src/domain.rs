//! Root-domain extraction and the optional environment-sync side utility:
//! channels that bypass the proxy push their upstream root domains to an
//! external rule API so the surrounding network config can whitelist them.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::{RelayError, Result};

const API_URL_ENV: &str = "SWITCHYARD_ENV_SYNC_API_URL";
const PROXY_RULE_ENV: &str = "SWITCHYARD_ENV_SYNC_PROXY_RULE";
const DIRECT_RULE_ENV: &str = "SWITCHYARD_ENV_SYNC_DIRECT_RULE";
const DEFAULT_RULE: &str = "DIRECT";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Extracts the registrable domain from a URL or bare host, public-suffix
/// aware: `v1.api.example.com` → `example.com`, while `api.co.uk` stays
/// `api.co.uk` because `co.uk` is a public suffix. Empty input is not an
/// error and yields empty output.
pub fn extract_root_domain(input: &str) -> Result<String> {
    if input.is_empty() {
        return Ok(String::new());
    }

    let mut host = if input.contains("://") {
        let url = reqwest::Url::parse(input)
            .map_err(|err| RelayError::InvalidInput(format!("invalid url {input}: {err}")))?;
        url.host_str()
            .ok_or_else(|| RelayError::InvalidInput(format!("url {input} has no host")))?
            .to_string()
    } else {
        let mut host = input;
        if let Some(idx) = host.find('/') {
            host = &host[..idx];
        }
        host.to_string()
    };

    if let Some(idx) = host.find('@') {
        host = host[idx + 1..].to_string();
    }
    if let Some(idx) = host.find(':') {
        host.truncate(idx);
    }

    psl::domain_str(&host)
        .map(str::to_string)
        .ok_or_else(|| RelayError::InvalidInput(format!("no registrable domain in {input}")))
}

pub struct EnvSync {
    client: reqwest::Client,
    api_url: String,
    proxy_rule: String,
    direct_rule: String,
}

impl EnvSync {
    pub fn from_env() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_url: std::env::var(API_URL_ENV).unwrap_or_default(),
            proxy_rule: std::env::var(PROXY_RULE_ENV).unwrap_or_else(|_| DEFAULT_RULE.to_string()),
            direct_rule: std::env::var(DIRECT_RULE_ENV)
                .unwrap_or_else(|_| DEFAULT_RULE.to_string()),
        }
    }

    /// Pushes one domain rule. Unset API URL means the utility is disabled;
    /// delivery failures never affect the caller.
    pub async fn sync_domain(&self, domain: &str, use_proxy: bool) -> Result<()> {
        if self.api_url.is_empty() {
            debug!("{API_URL_ENV} is not set, skipping domain sync");
            return Ok(());
        }

        let root = extract_root_domain(domain)?;
        if root.is_empty() {
            warn!("extracted root domain is empty, skipping sync");
            return Ok(());
        }

        let rule = if use_proxy {
            &self.proxy_rule
        } else {
            &self.direct_rule
        };
        let payload = format!("DOMAIN-SUFFIX,{root},{rule}");

        match self
            .client
            .put(&self.api_url)
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(payload)
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => {
                info!(domain = %root, %rule, "synced domain rule");
            }
            Ok(response) => {
                warn!(domain = %root, status = %response.status(), "env sync API returned non-success");
            }
            Err(err) => {
                warn!(domain = %root, %err, "failed to sync domain");
            }
        }
        Ok(())
    }

    /// Fire-and-forget variant for mutation paths.
    pub fn sync_domain_detached(self: std::sync::Arc<Self>, domain: String, use_proxy: bool) {
        tokio::spawn(async move {
            if let Err(err) = self.sync_domain(&domain, use_proxy).await {
                warn!(%err, "async domain sync failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_root_from_full_url_with_port_and_path() {
        assert_eq!(
            extract_root_domain("https://v1.api.example.com:8080/x").expect("domain"),
            "example.com"
        );
    }

    #[test]
    fn bare_host_and_subdomain() {
        assert_eq!(extract_root_domain("example.com").expect("domain"), "example.com");
        assert_eq!(extract_root_domain("api.example.com").expect("domain"), "example.com");
    }

    #[test]
    fn public_suffix_is_respected() {
        assert_eq!(extract_root_domain("api.co.uk").expect("domain"), "api.co.uk");
    }

    #[test]
    fn empty_input_is_empty_not_an_error() {
        assert_eq!(extract_root_domain("").expect("empty"), "");
    }

    #[test]
    fn userinfo_is_stripped() {
        assert_eq!(
            extract_root_domain("user:pass@api.example.com/path").expect("domain"),
            "example.com"
        );
    }
}
