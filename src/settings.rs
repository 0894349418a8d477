//! Keyed string settings with per-key validation. Values live in the
//! `setting` table; defaults are seeded at boot and never clobber existing
//! rows.

use crate::{RelayError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingKey {
    ProxyUrl,
    StatsSaveInterval,
    ModelInfoUpdateInterval,
    SyncLlmInterval,
    RelayLogKeepPeriod,
    SensitiveFilterEnabled,
}

impl SettingKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingKey::ProxyUrl => "proxy_url",
            SettingKey::StatsSaveInterval => "stats_save_interval",
            SettingKey::ModelInfoUpdateInterval => "model_info_update_interval",
            SettingKey::SyncLlmInterval => "sync_llm_interval",
            SettingKey::RelayLogKeepPeriod => "relay_log_keep_period",
            SettingKey::SensitiveFilterEnabled => "sensitive_filter_enabled",
        }
    }

    pub fn from_str(key: &str) -> Option<Self> {
        match key {
            "proxy_url" => Some(SettingKey::ProxyUrl),
            "stats_save_interval" => Some(SettingKey::StatsSaveInterval),
            "model_info_update_interval" => Some(SettingKey::ModelInfoUpdateInterval),
            "sync_llm_interval" => Some(SettingKey::SyncLlmInterval),
            "relay_log_keep_period" => Some(SettingKey::RelayLogKeepPeriod),
            "sensitive_filter_enabled" => Some(SettingKey::SensitiveFilterEnabled),
            _ => None,
        }
    }
}

pub fn defaults() -> Vec<(SettingKey, &'static str)> {
    vec![
        (SettingKey::ProxyUrl, ""),
        (SettingKey::StatsSaveInterval, "10"),
        (SettingKey::ModelInfoUpdateInterval, "24"),
        (SettingKey::SyncLlmInterval, "24"),
        (SettingKey::RelayLogKeepPeriod, "30"),
        (SettingKey::SensitiveFilterEnabled, "true"),
    ]
}

pub fn validate(key: SettingKey, value: &str) -> Result<()> {
    match key {
        SettingKey::ProxyUrl => {
            if value.is_empty() {
                return Ok(());
            }
            let url = reqwest::Url::parse(value)
                .map_err(|err| RelayError::InvalidInput(format!("proxy URL is invalid: {err}")))?;
            if !matches!(url.scheme(), "http" | "https" | "socks") {
                return Err(RelayError::InvalidInput(
                    "proxy URL scheme must be http, https, or socks".to_string(),
                ));
            }
            if url.host_str().is_none() {
                return Err(RelayError::InvalidInput(
                    "proxy URL must have a host".to_string(),
                ));
            }
            Ok(())
        }
        SettingKey::StatsSaveInterval
        | SettingKey::ModelInfoUpdateInterval
        | SettingKey::SyncLlmInterval => {
            let parsed: i64 = value.parse().map_err(|_| {
                RelayError::InvalidInput(format!("{} must be an integer", key.as_str()))
            })?;
            if parsed <= 0 {
                return Err(RelayError::InvalidInput(format!(
                    "{} must be positive",
                    key.as_str()
                )));
            }
            Ok(())
        }
        SettingKey::RelayLogKeepPeriod => {
            let parsed: i64 = value.parse().map_err(|_| {
                RelayError::InvalidInput("relay log keep period must be an integer".to_string())
            })?;
            if parsed < 0 {
                return Err(RelayError::InvalidInput(
                    "relay log keep period must not be negative".to_string(),
                ));
            }
            Ok(())
        }
        SettingKey::SensitiveFilterEnabled => match value {
            "true" | "false" => Ok(()),
            _ => Err(RelayError::InvalidInput(
                "sensitive filter enabled must be true or false".to_string(),
            )),
        },
    }
}
