//! Channel model-list auto-sync: fetch the upstream's model listing with
//! dialect-appropriate auth and pagination, then rewrite the channel's model
//! list through the registry (which handles the diff and the auto-group
//! pass).

use serde::Deserialize;
use tracing::{info, warn};

use crate::dialect::{ANTHROPIC_VERSION, OutboundDialect};
use crate::httpclient::ClientPool;
use crate::registry::Registry;
use crate::store::Channel;
use crate::{RelayError, Result};

#[derive(Debug, Deserialize)]
struct OpenAiModelList {
    #[serde(default)]
    data: Vec<OpenAiModel>,
}

#[derive(Debug, Deserialize)]
struct OpenAiModel {
    id: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicModelList {
    #[serde(default)]
    data: Vec<OpenAiModel>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    last_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiModelList {
    #[serde(default)]
    models: Vec<GeminiModel>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GeminiModel {
    name: String,
}

async fn read_checked(response: reqwest::Response) -> Result<bytes::Bytes> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RelayError::Upstream {
            status: status.as_u16(),
            body,
        });
    }
    Ok(response.bytes().await?)
}

/// Ordered list of model names served by the channel's upstream.
pub async fn fetch_model_names(
    client: &reqwest::Client,
    channel: &Channel,
    key: &str,
) -> Result<Vec<String>> {
    let base = channel
        .primary_base_url()
        .ok_or_else(|| RelayError::InvalidInput("channel has no base url".to_string()))?
        .trim_end_matches('/')
        .to_string();

    match channel.dialect {
        Some(OutboundDialect::GeminiGenerateContent) => {
            let mut names = Vec::new();
            let mut page_token: Option<String> = None;
            loop {
                let mut request = client.get(format!("{base}/models")).query(&[("key", key)]);
                if let Some(token) = &page_token {
                    request = request.query(&[("pageToken", token.as_str())]);
                }
                let body = read_checked(request.send().await?).await?;
                let page: GeminiModelList = serde_json::from_slice(&body)?;
                for model in page.models {
                    let name = model.name.strip_prefix("models/").unwrap_or(&model.name);
                    names.push(name.to_string());
                }
                match page.next_page_token.filter(|token| !token.is_empty()) {
                    Some(token) => page_token = Some(token),
                    None => break,
                }
            }
            if names.is_empty() {
                return Err(RelayError::Upstream {
                    status: 200,
                    body: "gemini model listing is empty".to_string(),
                });
            }
            Ok(names)
        }
        Some(OutboundDialect::AnthropicMessages) => {
            let mut names = Vec::new();
            let mut after_id: Option<String> = None;
            loop {
                let mut request = client
                    .get(format!("{base}/v1/models"))
                    .header("x-api-key", key)
                    .header("anthropic-version", ANTHROPIC_VERSION);
                if let Some(after) = &after_id {
                    request = request.query(&[("after_id", after.as_str())]);
                }
                let body = read_checked(request.send().await?).await?;
                let page: AnthropicModelList = serde_json::from_slice(&body)?;
                for model in page.data {
                    names.push(model.id);
                }
                if page.has_more {
                    match page.last_id {
                        Some(last) => after_id = Some(last),
                        None => break,
                    }
                } else {
                    break;
                }
            }
            Ok(names)
        }
        // Unknown dialects fall back to the OpenAI listing shape.
        _ => {
            let body = read_checked(
                client
                    .get(format!("{base}/models"))
                    .bearer_auth(key)
                    .send()
                    .await?,
            )
            .await?;
            let list: OpenAiModelList = serde_json::from_slice(&body)?;
            Ok(list.data.into_iter().map(|model| model.id).collect())
        }
    }
}

/// One sync pass over every auto-sync channel. Failures log and continue.
pub async fn sync_channels(registry: &Registry, clients: &ClientPool) {
    for channel in registry.channels() {
        if !channel.auto_sync {
            continue;
        }
        let Some(key) = registry.next_key(&channel) else {
            warn!(channel = %channel.name, "auto-sync skipped: no enabled credential");
            continue;
        };
        let client = match clients.client(channel.use_proxy, &channel.channel_proxy) {
            Ok(client) => client,
            Err(err) => {
                warn!(channel = %channel.name, %err, "auto-sync skipped: no http client");
                continue;
            }
        };

        let names = match fetch_model_names(&client, &channel, &key).await {
            Ok(names) => names,
            Err(err) => {
                warn!(channel = %channel.name, %err, "failed to fetch models");
                continue;
            }
        };

        let joined = names.join(",");
        if joined == channel.models {
            continue;
        }
        match registry.update_channel_models(channel.id, joined).await {
            Ok(added) if !added.is_empty() => {
                info!(channel = %channel.name, added = added.len(), "model list synced");
            }
            Ok(_) => {}
            Err(err) => warn!(channel = %channel.name, %err, "failed to update model list"),
        }
    }
}
