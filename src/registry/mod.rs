//! In-memory view of channels and groups.
//!
//! All read paths hit the caches; mutations are write-through: the store
//! commits first, the cache follows only on success, so a reader after a
//! successful mutation always observes it. Cache locks are never held
//! across a store call.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use regex::Regex;

use crate::domain::EnvSync;
use crate::store::{AutoGroupPolicy, BaseUrl, Channel, Group, GroupItem, Store};
use crate::{RelayError, Result};

pub struct Registry {
    store: Store,
    channels: RwLock<HashMap<i64, Channel>>,
    groups: RwLock<HashMap<i64, Group>>,
    /// Round-robin credential cursors, one per channel.
    key_cursors: RwLock<HashMap<i64, Arc<AtomicUsize>>>,
    env_sync: Arc<EnvSync>,
}

impl Registry {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            channels: RwLock::new(HashMap::new()),
            groups: RwLock::new(HashMap::new()),
            key_cursors: RwLock::new(HashMap::new()),
            env_sync: Arc::new(EnvSync::from_env()),
        }
    }

    /// Boot-time load of every channel and group.
    pub async fn load(&self) -> Result<()> {
        let channels = self.store.load_channels().await?;
        let groups = self.store.load_groups().await?;
        {
            let mut cache = self.channels.write().expect("channel cache poisoned");
            cache.clear();
            for channel in channels {
                cache.insert(channel.id, channel);
            }
        }
        {
            let mut cache = self.groups.write().expect("group cache poisoned");
            cache.clear();
            for group in groups {
                cache.insert(group.id, group);
            }
        }
        Ok(())
    }

    // Channel reads

    pub fn channel(&self, id: i64) -> Option<Channel> {
        self.channels
            .read()
            .expect("channel cache poisoned")
            .get(&id)
            .cloned()
    }

    pub fn channels(&self) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .channels
            .read()
            .expect("channel cache poisoned")
            .values()
            .cloned()
            .collect();
        channels.sort_by_key(|channel| channel.id);
        channels
    }

    /// Next enabled credential under round-robin rotation. A channel with no
    /// enabled credential is unroutable.
    pub fn next_key(&self, channel: &Channel) -> Option<String> {
        let enabled = channel.enabled_keys();
        if enabled.is_empty() {
            return None;
        }
        let cursor = {
            let mut cursors = self.key_cursors.write().expect("cursor cache poisoned");
            cursors.entry(channel.id).or_default().clone()
        };
        let index = cursor.fetch_add(1, Ordering::Relaxed) % enabled.len();
        Some(enabled[index].key.clone())
    }

    // Group reads

    pub fn group(&self, id: i64) -> Option<Group> {
        self.groups
            .read()
            .expect("group cache poisoned")
            .get(&id)
            .cloned()
    }

    pub fn group_by_model(&self, model: &str) -> Option<Group> {
        self.groups
            .read()
            .expect("group cache poisoned")
            .values()
            .find(|group| group.name == model)
            .cloned()
    }

    pub fn groups(&self) -> Vec<Group> {
        let mut groups: Vec<Group> = self
            .groups
            .read()
            .expect("group cache poisoned")
            .values()
            .cloned()
            .collect();
        groups.sort_by_key(|group| group.id);
        groups
    }

    /// Logical model names exposed to callers.
    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .groups
            .read()
            .expect("group cache poisoned")
            .values()
            .map(|group| group.name.clone())
            .collect();
        names.sort();
        names
    }

    // Channel writes

    pub async fn create_channel(&self, channel: Channel) -> Result<Channel> {
        let created = self.store.insert_channel(channel).await?;
        self.channels
            .write()
            .expect("channel cache poisoned")
            .insert(created.id, created.clone());

        // Channels that bypass the proxy get their upstream root domains
        // pushed to the external rule API.
        if !created.use_proxy {
            for base_url in &created.base_urls {
                if !base_url.url.is_empty() {
                    self.env_sync
                        .clone()
                        .sync_domain_detached(base_url.url.clone(), created.use_proxy);
                }
            }
        }
        Ok(created)
    }

    /// Records probe results: the channel's base-url list with refreshed
    /// delays, store first, cache on success.
    pub async fn update_base_url_delays(&self, id: i64, base_urls: Vec<BaseUrl>) -> Result<()> {
        if self.channel(id).is_none() {
            return Err(RelayError::ModelNotFound(format!("channel {id}")));
        }
        self.store.set_channel_base_urls(id, base_urls.clone()).await?;
        if let Some(channel) = self
            .channels
            .write()
            .expect("channel cache poisoned")
            .get_mut(&id)
        {
            channel.base_urls = base_urls;
        }
        Ok(())
    }

    pub async fn set_channel_enabled(&self, id: i64, enabled: bool) -> Result<()> {
        if self.channel(id).is_none() {
            return Err(RelayError::ModelNotFound(format!("channel {id}")));
        }
        self.store.set_channel_enabled(id, enabled).await?;
        if let Some(channel) = self
            .channels
            .write()
            .expect("channel cache poisoned")
            .get_mut(&id)
        {
            channel.enabled = enabled;
        }
        Ok(())
    }

    pub async fn delete_channel(&self, id: i64) -> Result<()> {
        if self.channel(id).is_none() {
            return Err(RelayError::ModelNotFound(format!("channel {id}")));
        }
        let affected = self.store.delete_channel(id).await?;
        self.channels
            .write()
            .expect("channel cache poisoned")
            .remove(&id);
        self.key_cursors
            .write()
            .expect("cursor cache poisoned")
            .remove(&id);
        for group_id in affected {
            self.refresh_group(group_id).await?;
        }
        Ok(())
    }

    /// Rewrites the channel model list and runs the auto-group pass for the
    /// names that are new. Returns the added model names.
    pub async fn update_channel_models(&self, id: i64, models: String) -> Result<Vec<String>> {
        let old = self
            .channel(id)
            .ok_or_else(|| RelayError::ModelNotFound(format!("channel {id}")))?;

        self.store.set_channel_models(id, models.clone()).await?;

        let old_names: Vec<String> = split_models(&old.models);
        let new_names: Vec<String> = split_models(&models);
        let added: Vec<String> = new_names
            .iter()
            .filter(|name| !old_names.contains(name))
            .cloned()
            .collect();
        let removed: Vec<String> = old_names
            .iter()
            .filter(|name| !new_names.contains(name))
            .cloned()
            .collect();

        if let Some(channel) = self
            .channels
            .write()
            .expect("channel cache poisoned")
            .get_mut(&id)
        {
            channel.models = models;
        }

        if !removed.is_empty() {
            let affected = self
                .store
                .delete_group_items_for_models(id, removed)
                .await?;
            for group_id in affected {
                self.refresh_group(group_id).await?;
            }
        }

        if !added.is_empty() {
            self.auto_group(id, &added, old.auto_group).await?;
        }

        Ok(added)
    }

    /// For each group whose policy matches a model name, add an item
    /// pointing at (channel, model).
    pub async fn auto_group(
        &self,
        channel_id: i64,
        models: &[String],
        policy: AutoGroupPolicy,
    ) -> Result<()> {
        if policy == AutoGroupPolicy::None {
            return Ok(());
        }
        let groups = self.groups();
        for group in groups {
            let matcher = GroupMatcher::new(&group, policy);
            let mut touched = false;
            for model in models {
                if !matcher.matches(&group, model) {
                    continue;
                }
                let exists = group
                    .items
                    .iter()
                    .any(|item| item.channel_id == channel_id && item.model_name == *model);
                if exists {
                    continue;
                }
                self.store
                    .insert_group_item(GroupItem {
                        id: 0,
                        group_id: group.id,
                        channel_id,
                        model_name: model.clone(),
                        priority: 0,
                        weight: 1,
                    })
                    .await?;
                touched = true;
            }
            if touched {
                self.refresh_group(group.id).await?;
            }
        }
        Ok(())
    }

    // Group writes

    pub async fn create_group(&self, group: Group) -> Result<Group> {
        let created = self.store.insert_group(group).await?;
        self.groups
            .write()
            .expect("group cache poisoned")
            .insert(created.id, created.clone());
        Ok(created)
    }

    pub async fn delete_group(&self, id: i64) -> Result<()> {
        if self.group(id).is_none() {
            return Err(RelayError::ModelNotFound(format!("group {id}")));
        }
        self.store.delete_group(id).await?;
        self.groups.write().expect("group cache poisoned").remove(&id);
        Ok(())
    }

    pub async fn add_group_item(&self, item: GroupItem) -> Result<GroupItem> {
        if self.group(item.group_id).is_none() {
            return Err(RelayError::ModelNotFound(format!("group {}", item.group_id)));
        }
        let group_id = item.group_id;
        let created = self.store.insert_group_item(item).await?;
        self.refresh_group(group_id).await?;
        Ok(created)
    }

    pub async fn delete_group_item(&self, id: i64) -> Result<()> {
        let group_id = self.store.delete_group_item(id).await?;
        self.refresh_group(group_id).await?;
        Ok(())
    }

    async fn refresh_group(&self, id: i64) -> Result<()> {
        match self.store.load_group(id).await {
            Ok(group) => {
                self.groups
                    .write()
                    .expect("group cache poisoned")
                    .insert(group.id, group);
                Ok(())
            }
            Err(crate::store::StoreError::NotFound(_)) => {
                self.groups.write().expect("group cache poisoned").remove(&id);
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn split_models(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

struct GroupMatcher {
    regex: Option<Regex>,
    policy: AutoGroupPolicy,
}

impl GroupMatcher {
    fn new(group: &Group, policy: AutoGroupPolicy) -> Self {
        let regex = if policy == AutoGroupPolicy::Regex && !group.match_regex.is_empty() {
            Regex::new(&group.match_regex).ok()
        } else {
            None
        };
        Self { regex, policy }
    }

    fn matches(&self, group: &Group, model: &str) -> bool {
        match self.policy {
            AutoGroupPolicy::None => false,
            AutoGroupPolicy::Exact => group.name == model,
            AutoGroupPolicy::Fuzzy => model.contains(&group.name),
            AutoGroupPolicy::Regex => self
                .regex
                .as_ref()
                .map(|regex| regex.is_match(model))
                .unwrap_or(false),
        }
    }
}
