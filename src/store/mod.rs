//! SQLite-backed repository. Every call opens a connection on the blocking
//! pool; the schema is forward-only and applied idempotently at boot.
//! Multi-table mutations (cascade deletes, grouped item rewrites) run inside
//! a single transaction.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dialect::OutboundDialect;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found: {0}")]
    NotFound(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceMode {
    Priority,
    RoundRobin,
    Weighted,
    Random,
}

impl BalanceMode {
    pub fn from_tag(tag: i64) -> Self {
        match tag {
            1 => BalanceMode::RoundRobin,
            2 => BalanceMode::Weighted,
            3 => BalanceMode::Random,
            _ => BalanceMode::Priority,
        }
    }

    pub fn tag(&self) -> i64 {
        match self {
            BalanceMode::Priority => 0,
            BalanceMode::RoundRobin => 1,
            BalanceMode::Weighted => 2,
            BalanceMode::Random => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoGroupPolicy {
    None,
    Fuzzy,
    Exact,
    Regex,
}

impl AutoGroupPolicy {
    pub fn from_tag(tag: i64) -> Self {
        match tag {
            1 => AutoGroupPolicy::Fuzzy,
            2 => AutoGroupPolicy::Exact,
            3 => AutoGroupPolicy::Regex,
            _ => AutoGroupPolicy::None,
        }
    }

    pub fn tag(&self) -> i64 {
        match self {
            AutoGroupPolicy::None => 0,
            AutoGroupPolicy::Fuzzy => 1,
            AutoGroupPolicy::Exact => 2,
            AutoGroupPolicy::Regex => 3,
        }
    }
}

/// An upstream endpoint plus the latency last observed by the delay probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseUrl {
    pub url: String,
    #[serde(default)]
    pub delay_ms: i64,
}

impl BaseUrl {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub dialect: Option<OutboundDialect>,
    pub enabled: bool,
    pub base_urls: Vec<BaseUrl>,
    pub keys: Vec<ChannelKey>,
    /// Comma-separated model names the channel claims to serve.
    pub models: String,
    pub custom_models: String,
    pub use_proxy: bool,
    pub auto_sync: bool,
    pub auto_group: AutoGroupPolicy,
    /// Channel-specific proxy URL; empty means none.
    pub channel_proxy: String,
}

impl Channel {
    pub fn model_names(&self) -> Vec<String> {
        self.models
            .split(',')
            .chain(self.custom_models.split(','))
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn enabled_keys(&self) -> Vec<&ChannelKey> {
        self.keys.iter().filter(|key| key.enabled).collect()
    }

    pub fn primary_base_url(&self) -> Option<&str> {
        self.base_urls.first().map(|base| base.url.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ChannelKey {
    pub id: i64,
    pub channel_id: i64,
    pub key: String,
    pub enabled: bool,
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub mode: BalanceMode,
    /// Regex used by the auto-group pass; empty disables regex matching.
    pub match_regex: String,
    /// Sorted by (priority asc, insertion order).
    pub items: Vec<GroupItem>,
}

#[derive(Debug, Clone)]
pub struct GroupItem {
    pub id: i64,
    pub group_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    pub priority: i64,
    pub weight: i64,
}

#[derive(Debug, Clone)]
pub struct ApiKey {
    pub id: i64,
    pub name: String,
    pub key: String,
    pub enabled: bool,
    /// Comma-separated allowlist; empty means every model.
    pub supported_models: String,
}

#[derive(Debug, Clone)]
pub struct SensitiveRule {
    pub id: i64,
    pub name: String,
    pub pattern: String,
    pub replacement: String,
    pub enabled: bool,
    pub built_in: bool,
    pub priority: i64,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LlmPrice {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
}

/// Componentwise-additive usage counters shared by every stats window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct StatsMetrics {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub wait_time_ms: i64,
    pub request_success: i64,
    pub request_failed: i64,
}

impl StatsMetrics {
    pub fn add(&mut self, other: &StatsMetrics) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.input_cost += other.input_cost;
        self.output_cost += other.output_cost;
        self.wait_time_ms += other.wait_time_ms;
        self.request_success += other.request_success;
        self.request_failed += other.request_failed;
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelayLog {
    pub time: i64,
    pub request_model: String,
    pub channel_name: String,
    pub channel_id: i64,
    pub actual_model: String,
    pub use_time_ms: i64,
    /// Time to first translated stream event; 0 for non-streaming calls.
    pub first_token_ms: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: f64,
    pub request_content: String,
    pub response_content: String,
    pub error: String,
}

/// One flush pass: every dirty entry collected from the aggregator.
#[derive(Debug, Default)]
pub struct StatsFlush {
    pub total: Option<StatsMetrics>,
    pub daily: Option<(u32, StatsMetrics)>,
    pub hourly: Vec<(u8, u32, StatsMetrics)>,
    pub channels: Vec<(i64, StatsMetrics)>,
    pub models: Vec<(String, StatsMetrics)>,
    pub api_keys: Vec<(i64, StatsMetrics)>,
}

impl StatsFlush {
    pub fn is_empty(&self) -> bool {
        self.total.is_none()
            && self.daily.is_none()
            && self.hourly.is_empty()
            && self.channels.is_empty()
            && self.models.is_empty()
            && self.api_keys.is_empty()
    }
}

#[derive(Clone, Debug)]
pub struct Store {
    path: PathBuf,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS channel (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    dialect INTEGER NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    base_urls TEXT NOT NULL DEFAULT '[]',
    models TEXT NOT NULL DEFAULT '',
    custom_models TEXT NOT NULL DEFAULT '',
    use_proxy INTEGER NOT NULL DEFAULT 0,
    auto_sync INTEGER NOT NULL DEFAULT 0,
    auto_group INTEGER NOT NULL DEFAULT 0,
    channel_proxy TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS channel_key (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id INTEGER NOT NULL,
    key TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS channel_group (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    mode INTEGER NOT NULL DEFAULT 0,
    match_regex TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS group_item (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    group_id INTEGER NOT NULL,
    channel_id INTEGER NOT NULL,
    model_name TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    weight INTEGER NOT NULL DEFAULT 1
);
CREATE TABLE IF NOT EXISTS api_key (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    key TEXT NOT NULL UNIQUE,
    enabled INTEGER NOT NULL DEFAULT 1,
    supported_models TEXT NOT NULL DEFAULT ''
);
CREATE TABLE IF NOT EXISTS setting (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS sensitive_filter_rule (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    pattern TEXT NOT NULL,
    replacement TEXT NOT NULL,
    enabled INTEGER NOT NULL DEFAULT 1,
    built_in INTEGER NOT NULL DEFAULT 0,
    priority INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS llm_info (
    model TEXT PRIMARY KEY,
    input_price REAL NOT NULL DEFAULT 0,
    output_price REAL NOT NULL DEFAULT 0,
    cache_read_price REAL NOT NULL DEFAULT 0,
    cache_write_price REAL NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS stats_total (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    input_cost REAL NOT NULL DEFAULT 0,
    output_cost REAL NOT NULL DEFAULT 0,
    wait_time_ms INTEGER NOT NULL DEFAULT 0,
    request_success INTEGER NOT NULL DEFAULT 0,
    request_failed INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS stats_daily (
    date INTEGER PRIMARY KEY,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    input_cost REAL NOT NULL DEFAULT 0,
    output_cost REAL NOT NULL DEFAULT 0,
    wait_time_ms INTEGER NOT NULL DEFAULT 0,
    request_success INTEGER NOT NULL DEFAULT 0,
    request_failed INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS stats_hourly (
    hour INTEGER PRIMARY KEY,
    date INTEGER NOT NULL DEFAULT 0,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    input_cost REAL NOT NULL DEFAULT 0,
    output_cost REAL NOT NULL DEFAULT 0,
    wait_time_ms INTEGER NOT NULL DEFAULT 0,
    request_success INTEGER NOT NULL DEFAULT 0,
    request_failed INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS stats_channel (
    channel_id INTEGER PRIMARY KEY,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    input_cost REAL NOT NULL DEFAULT 0,
    output_cost REAL NOT NULL DEFAULT 0,
    wait_time_ms INTEGER NOT NULL DEFAULT 0,
    request_success INTEGER NOT NULL DEFAULT 0,
    request_failed INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS stats_model (
    model TEXT PRIMARY KEY,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    input_cost REAL NOT NULL DEFAULT 0,
    output_cost REAL NOT NULL DEFAULT 0,
    wait_time_ms INTEGER NOT NULL DEFAULT 0,
    request_success INTEGER NOT NULL DEFAULT 0,
    request_failed INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS stats_api_key (
    api_key_id INTEGER PRIMARY KEY,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    input_cost REAL NOT NULL DEFAULT 0,
    output_cost REAL NOT NULL DEFAULT 0,
    wait_time_ms INTEGER NOT NULL DEFAULT 0,
    request_success INTEGER NOT NULL DEFAULT 0,
    request_failed INTEGER NOT NULL DEFAULT 0
);
CREATE TABLE IF NOT EXISTS relay_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    time INTEGER NOT NULL,
    request_model TEXT NOT NULL DEFAULT '',
    channel_name TEXT NOT NULL DEFAULT '',
    channel_id INTEGER NOT NULL DEFAULT 0,
    actual_model TEXT NOT NULL DEFAULT '',
    use_time_ms INTEGER NOT NULL DEFAULT 0,
    first_token_ms INTEGER NOT NULL DEFAULT 0,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cost REAL NOT NULL DEFAULT 0,
    request_content TEXT NOT NULL DEFAULT '',
    response_content TEXT NOT NULL DEFAULT '',
    error TEXT NOT NULL DEFAULT ''
);
CREATE INDEX IF NOT EXISTS idx_group_item_group ON group_item (group_id);
CREATE INDEX IF NOT EXISTS idx_group_item_channel ON group_item (channel_id);
CREATE INDEX IF NOT EXISTS idx_relay_log_time ON relay_log (time);
";

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn read_metrics(row: &rusqlite::Row<'_>, offset: usize) -> rusqlite::Result<StatsMetrics> {
    Ok(StatsMetrics {
        input_tokens: row.get(offset)?,
        output_tokens: row.get(offset + 1)?,
        input_cost: row.get(offset + 2)?,
        output_cost: row.get(offset + 3)?,
        wait_time_ms: row.get(offset + 4)?,
        request_success: row.get(offset + 5)?,
        request_failed: row.get(offset + 6)?,
    })
}

fn read_channel(row: &rusqlite::Row<'_>) -> Result<Channel, StoreError> {
    let base_urls_raw: String = row.get(4)?;
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        dialect: OutboundDialect::from_tag(row.get(2)?),
        enabled: row.get(3)?,
        base_urls: serde_json::from_str(&base_urls_raw)?,
        keys: Vec::new(),
        models: row.get(5)?,
        custom_models: row.get(6)?,
        use_proxy: row.get(7)?,
        auto_sync: row.get(8)?,
        auto_group: AutoGroupPolicy::from_tag(row.get(9)?),
        channel_proxy: row.get(10)?,
    })
}

const CHANNEL_COLUMNS: &str = "id, name, dialect, enabled, base_urls, models, custom_models, \
                               use_proxy, auto_sync, auto_group, channel_proxy";

fn load_channel_keys(conn: &Connection, channel: &mut Channel) -> Result<(), StoreError> {
    let mut stmt =
        conn.prepare("SELECT id, channel_id, key, enabled FROM channel_key WHERE channel_id = ?1 ORDER BY id")?;
    let rows = stmt.query_map([channel.id], |row| {
        Ok(ChannelKey {
            id: row.get(0)?,
            channel_id: row.get(1)?,
            key: row.get(2)?,
            enabled: row.get(3)?,
        })
    })?;
    for key in rows {
        channel.keys.push(key?);
    }
    Ok(())
}

fn load_group_items(conn: &Connection, group: &mut Group) -> Result<(), StoreError> {
    let mut stmt = conn.prepare(
        "SELECT id, group_id, channel_id, model_name, priority, weight FROM group_item \
         WHERE group_id = ?1 ORDER BY priority ASC, id ASC",
    )?;
    let rows = stmt.query_map([group.id], |row| {
        Ok(GroupItem {
            id: row.get(0)?,
            group_id: row.get(1)?,
            channel_id: row.get(2)?,
            model_name: row.get(3)?,
            priority: row.get(4)?,
            weight: row.get(5)?,
        })
    })?;
    for item in rows {
        group.items.push(item?);
    }
    Ok(())
}

fn read_group_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Group> {
    Ok(Group {
        id: row.get(0)?,
        name: row.get(1)?,
        mode: BalanceMode::from_tag(row.get(2)?),
        match_regex: row.get(3)?,
        items: Vec::new(),
    })
}

fn upsert_metrics(
    tx: &Transaction<'_>,
    table: &str,
    key_column: &str,
    key: &dyn rusqlite::ToSql,
    metrics: &StatsMetrics,
) -> Result<(), StoreError> {
    let sql = format!(
        "INSERT INTO {table} ({key_column}, input_tokens, output_tokens, input_cost, output_cost, \
         wait_time_ms, request_success, request_failed) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT({key_column}) DO UPDATE SET \
         input_tokens = excluded.input_tokens, output_tokens = excluded.output_tokens, \
         input_cost = excluded.input_cost, output_cost = excluded.output_cost, \
         wait_time_ms = excluded.wait_time_ms, request_success = excluded.request_success, \
         request_failed = excluded.request_failed"
    );
    tx.execute(
        &sql,
        params![
            key,
            metrics.input_tokens,
            metrics.output_tokens,
            metrics.input_cost,
            metrics.output_cost,
            metrics.wait_time_ms,
            metrics.request_success,
            metrics.request_failed,
        ],
    )?;
    Ok(())
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn call<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = open_connection(&path)?;
            f(&mut conn)
        })
        .await?
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        self.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await
    }

    // Channels

    pub async fn load_channels(&self) -> Result<Vec<Channel>, StoreError> {
        self.call(|conn| {
            let mut channels = Vec::new();
            {
                let mut stmt =
                    conn.prepare(&format!("SELECT {CHANNEL_COLUMNS} FROM channel ORDER BY id"))?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    channels.push(read_channel(row)?);
                }
            }
            for channel in &mut channels {
                load_channel_keys(conn, channel)?;
            }
            Ok(channels)
        })
        .await
    }

    pub async fn load_channel(&self, id: i64) -> Result<Channel, StoreError> {
        self.call(move |conn| {
            let mut channel = conn
                .query_row(
                    &format!("SELECT {CHANNEL_COLUMNS} FROM channel WHERE id = ?1"),
                    [id],
                    |row| Ok(read_channel(row)),
                )
                .optional()?
                .ok_or(StoreError::NotFound("channel"))??;
            load_channel_keys(conn, &mut channel)?;
            Ok(channel)
        })
        .await
    }

    pub async fn insert_channel(&self, channel: Channel) -> Result<Channel, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO channel (name, dialect, enabled, base_urls, models, custom_models, \
                 use_proxy, auto_sync, auto_group, channel_proxy) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    channel.name,
                    channel.dialect.map(|d| d.tag()).unwrap_or(0),
                    channel.enabled,
                    serde_json::to_string(&channel.base_urls)?,
                    channel.models,
                    channel.custom_models,
                    channel.use_proxy,
                    channel.auto_sync,
                    channel.auto_group.tag(),
                    channel.channel_proxy,
                ],
            )?;
            let channel_id = tx.last_insert_rowid();
            let mut out = channel.clone();
            out.id = channel_id;
            for (idx, key) in channel.keys.iter().enumerate() {
                tx.execute(
                    "INSERT INTO channel_key (channel_id, key, enabled) VALUES (?1, ?2, ?3)",
                    params![channel_id, key.key, key.enabled],
                )?;
                out.keys[idx].id = tx.last_insert_rowid();
                out.keys[idx].channel_id = channel_id;
            }
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    pub async fn set_channel_enabled(&self, id: i64, enabled: bool) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE channel SET enabled = ?2 WHERE id = ?1",
                params![id, enabled],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_channel_models(&self, id: i64, models: String) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE channel SET models = ?2 WHERE id = ?1",
                params![id, models],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_channel_base_urls(
        &self,
        id: i64,
        base_urls: Vec<BaseUrl>,
    ) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE channel SET base_urls = ?2 WHERE id = ?1",
                params![id, serde_json::to_string(&base_urls)?],
            )?;
            Ok(())
        })
        .await
    }

    /// Deletes the channel, its keys, its group items, and its stats row in
    /// one transaction. Returns the ids of the groups that lost items so the
    /// caller can refresh their caches after commit.
    pub async fn delete_channel(&self, id: i64) -> Result<Vec<i64>, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut affected = Vec::new();
            {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT group_id FROM group_item WHERE channel_id = ?1",
                )?;
                let rows = stmt.query_map([id], |row| row.get::<_, i64>(0))?;
                for group_id in rows {
                    affected.push(group_id?);
                }
            }
            tx.execute("DELETE FROM group_item WHERE channel_id = ?1", [id])?;
            tx.execute("DELETE FROM channel_key WHERE channel_id = ?1", [id])?;
            tx.execute("DELETE FROM stats_channel WHERE channel_id = ?1", [id])?;
            tx.execute("DELETE FROM channel WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(affected)
        })
        .await
    }

    // Groups

    pub async fn load_groups(&self) -> Result<Vec<Group>, StoreError> {
        self.call(|conn| {
            let mut groups = Vec::new();
            {
                let mut stmt = conn
                    .prepare("SELECT id, name, mode, match_regex FROM channel_group ORDER BY id")?;
                let mut rows = stmt.query([])?;
                while let Some(row) = rows.next()? {
                    groups.push(Group {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        mode: BalanceMode::from_tag(row.get(2)?),
                        match_regex: row.get(3)?,
                        items: Vec::new(),
                    });
                }
            }
            for group in &mut groups {
                load_group_items(conn, group)?;
            }
            Ok(groups)
        })
        .await
    }

    pub async fn load_group(&self, id: i64) -> Result<Group, StoreError> {
        self.call(move |conn| {
            let mut group = conn
                .query_row(
                    "SELECT id, name, mode, match_regex FROM channel_group WHERE id = ?1",
                    [id],
                    read_group_row,
                )
                .optional()?
                .ok_or(StoreError::NotFound("group"))?;
            load_group_items(conn, &mut group)?;
            Ok(group)
        })
        .await
    }

    pub async fn insert_group(&self, group: Group) -> Result<Group, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "INSERT INTO channel_group (name, mode, match_regex) VALUES (?1, ?2, ?3)",
                params![group.name, group.mode.tag(), group.match_regex],
            )?;
            let group_id = tx.last_insert_rowid();
            let mut out = group.clone();
            out.id = group_id;
            for (idx, item) in group.items.iter().enumerate() {
                tx.execute(
                    "INSERT INTO group_item (group_id, channel_id, model_name, priority, weight) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![group_id, item.channel_id, item.model_name, item.priority, item.weight],
                )?;
                out.items[idx].id = tx.last_insert_rowid();
                out.items[idx].group_id = group_id;
            }
            tx.commit()?;
            Ok(out)
        })
        .await
    }

    pub async fn update_group(
        &self,
        id: i64,
        name: Option<String>,
        mode: Option<BalanceMode>,
        match_regex: Option<String>,
    ) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            if let Some(name) = name {
                tx.execute("UPDATE channel_group SET name = ?2 WHERE id = ?1", params![id, name])?;
            }
            if let Some(mode) = mode {
                tx.execute(
                    "UPDATE channel_group SET mode = ?2 WHERE id = ?1",
                    params![id, mode.tag()],
                )?;
            }
            if let Some(regex) = match_regex {
                tx.execute(
                    "UPDATE channel_group SET match_regex = ?2 WHERE id = ?1",
                    params![id, regex],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn delete_group(&self, id: i64) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            tx.execute("DELETE FROM group_item WHERE group_id = ?1", [id])?;
            tx.execute("DELETE FROM channel_group WHERE id = ?1", [id])?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    pub async fn insert_group_item(&self, item: GroupItem) -> Result<GroupItem, StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO group_item (group_id, channel_id, model_name, priority, weight) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![item.group_id, item.channel_id, item.model_name, item.priority, item.weight],
            )?;
            let mut out = item;
            out.id = conn.last_insert_rowid();
            Ok(out)
        })
        .await
    }

    pub async fn delete_group_item(&self, id: i64) -> Result<i64, StoreError> {
        self.call(move |conn| {
            let group_id: i64 = conn
                .query_row("SELECT group_id FROM group_item WHERE id = ?1", [id], |row| {
                    row.get(0)
                })
                .optional()?
                .ok_or(StoreError::NotFound("group item"))?;
            conn.execute("DELETE FROM group_item WHERE id = ?1", [id])?;
            Ok(group_id)
        })
        .await
    }

    /// Removes every item referencing (channel, model) pairs whose model has
    /// disappeared from the channel. Returns the affected group ids.
    pub async fn delete_group_items_for_models(
        &self,
        channel_id: i64,
        models: Vec<String>,
    ) -> Result<Vec<i64>, StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            let mut affected = std::collections::BTreeSet::new();
            for model in &models {
                let mut stmt = tx.prepare(
                    "SELECT DISTINCT group_id FROM group_item WHERE channel_id = ?1 AND model_name = ?2",
                )?;
                let rows = stmt.query_map(params![channel_id, model], |row| row.get::<_, i64>(0))?;
                for group_id in rows {
                    affected.insert(group_id?);
                }
                drop(stmt);
                tx.execute(
                    "DELETE FROM group_item WHERE channel_id = ?1 AND model_name = ?2",
                    params![channel_id, model],
                )?;
            }
            tx.commit()?;
            Ok(affected.into_iter().collect())
        })
        .await
    }

    // API keys

    pub async fn load_api_keys(&self) -> Result<Vec<ApiKey>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, key, enabled, supported_models FROM api_key ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(ApiKey {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    key: row.get(2)?,
                    enabled: row.get(3)?,
                    supported_models: row.get(4)?,
                })
            })?;
            let mut keys = Vec::new();
            for key in rows {
                keys.push(key?);
            }
            Ok(keys)
        })
        .await
    }

    pub async fn insert_api_key(&self, key: ApiKey) -> Result<ApiKey, StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO api_key (name, key, enabled, supported_models) VALUES (?1, ?2, ?3, ?4)",
                params![key.name, key.key, key.enabled, key.supported_models],
            )?;
            let mut out = key;
            out.id = conn.last_insert_rowid();
            Ok(out)
        })
        .await
    }

    // Settings

    pub async fn load_settings(&self) -> Result<Vec<(String, String)>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM setting")?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
            let mut settings = Vec::new();
            for row in rows {
                settings.push(row?);
            }
            Ok(settings)
        })
        .await
    }

    pub async fn get_setting(&self, key: String) -> Result<Option<String>, StoreError> {
        self.call(move |conn| {
            Ok(conn
                .query_row("SELECT value FROM setting WHERE key = ?1", [key], |row| row.get(0))
                .optional()?)
        })
        .await
    }

    pub async fn set_setting(&self, key: String, value: String) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO setting (key, value) VALUES (?1, ?2) \
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn seed_setting(&self, key: String, value: String) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO setting (key, value) VALUES (?1, ?2)",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    // Sensitive filter rules

    pub async fn load_rules(&self, enabled_only: bool) -> Result<Vec<SensitiveRule>, StoreError> {
        self.call(move |conn| {
            let sql = if enabled_only {
                "SELECT id, name, pattern, replacement, enabled, built_in, priority \
                 FROM sensitive_filter_rule WHERE enabled = 1 ORDER BY priority DESC, id ASC"
            } else {
                "SELECT id, name, pattern, replacement, enabled, built_in, priority \
                 FROM sensitive_filter_rule ORDER BY priority DESC, id ASC"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt.query_map([], |row| {
                Ok(SensitiveRule {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    pattern: row.get(2)?,
                    replacement: row.get(3)?,
                    enabled: row.get(4)?,
                    built_in: row.get(5)?,
                    priority: row.get(6)?,
                })
            })?;
            let mut rules = Vec::new();
            for rule in rows {
                rules.push(rule?);
            }
            Ok(rules)
        })
        .await
    }

    pub async fn count_rules(&self) -> Result<i64, StoreError> {
        self.call(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM sensitive_filter_rule", [], |row| row.get(0))?)
        })
        .await
    }

    pub async fn insert_rule(&self, rule: SensitiveRule) -> Result<SensitiveRule, StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO sensitive_filter_rule (name, pattern, replacement, enabled, built_in, priority) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![rule.name, rule.pattern, rule.replacement, rule.enabled, rule.built_in, rule.priority],
            )?;
            let mut out = rule;
            out.id = conn.last_insert_rowid();
            Ok(out)
        })
        .await
    }

    pub async fn get_rule(&self, id: i64) -> Result<SensitiveRule, StoreError> {
        self.call(move |conn| {
            conn.query_row(
                "SELECT id, name, pattern, replacement, enabled, built_in, priority \
                 FROM sensitive_filter_rule WHERE id = ?1",
                [id],
                |row| {
                    Ok(SensitiveRule {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        pattern: row.get(2)?,
                        replacement: row.get(3)?,
                        enabled: row.get(4)?,
                        built_in: row.get(5)?,
                        priority: row.get(6)?,
                    })
                },
            )
            .optional()?
            .ok_or(StoreError::NotFound("sensitive filter rule"))
        })
        .await
    }

    pub async fn update_rule(&self, rule: SensitiveRule) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE sensitive_filter_rule SET name = ?2, pattern = ?3, replacement = ?4, \
                 enabled = ?5, priority = ?6 WHERE id = ?1",
                params![rule.id, rule.name, rule.pattern, rule.replacement, rule.enabled, rule.priority],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn set_rule_enabled(&self, id: i64, enabled: bool) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "UPDATE sensitive_filter_rule SET enabled = ?2 WHERE id = ?1",
                params![id, enabled],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_rule(&self, id: i64) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute("DELETE FROM sensitive_filter_rule WHERE id = ?1", [id])?;
            Ok(())
        })
        .await
    }

    // Model price info

    pub async fn load_llm_prices(&self) -> Result<Vec<(String, LlmPrice)>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT model, input_price, output_price, cache_read_price, cache_write_price FROM llm_info",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    LlmPrice {
                        input: row.get(1)?,
                        output: row.get(2)?,
                        cache_read: row.get(3)?,
                        cache_write: row.get(4)?,
                    },
                ))
            })?;
            let mut prices = Vec::new();
            for row in rows {
                prices.push(row?);
            }
            Ok(prices)
        })
        .await
    }

    pub async fn upsert_llm_price(&self, model: String, price: LlmPrice) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO llm_info (model, input_price, output_price, cache_read_price, cache_write_price) \
                 VALUES (?1, ?2, ?3, ?4, ?5) \
                 ON CONFLICT(model) DO UPDATE SET input_price = excluded.input_price, \
                 output_price = excluded.output_price, cache_read_price = excluded.cache_read_price, \
                 cache_write_price = excluded.cache_write_price",
                params![model, price.input, price.output, price.cache_read, price.cache_write],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_llm_price(&self, model: String) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute("DELETE FROM llm_info WHERE model = ?1", [model])?;
            Ok(())
        })
        .await
    }

    // Stats

    pub async fn load_stats_total(&self) -> Result<Option<StatsMetrics>, StoreError> {
        self.call(|conn| {
            Ok(conn
                .query_row(
                    "SELECT input_tokens, output_tokens, input_cost, output_cost, wait_time_ms, \
                     request_success, request_failed FROM stats_total WHERE id = 1",
                    [],
                    |row| read_metrics(row, 0),
                )
                .optional()?)
        })
        .await
    }

    pub async fn load_stats_daily(&self, date: u32) -> Result<Option<StatsMetrics>, StoreError> {
        self.call(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT input_tokens, output_tokens, input_cost, output_cost, wait_time_ms, \
                     request_success, request_failed FROM stats_daily WHERE date = ?1",
                    [date],
                    |row| read_metrics(row, 0),
                )
                .optional()?)
        })
        .await
    }

    pub async fn load_stats_channels(&self) -> Result<Vec<(i64, StatsMetrics)>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn.prepare(
                "SELECT channel_id, input_tokens, output_tokens, input_cost, output_cost, \
                 wait_time_ms, request_success, request_failed FROM stats_channel",
            )?;
            let rows = stmt.query_map([], |row| Ok((row.get(0)?, read_metrics(row, 1)?)))?;
            let mut stats = Vec::new();
            for row in rows {
                stats.push(row?);
            }
            Ok(stats)
        })
        .await
    }

    /// One flush pass over every dirty entry.
    pub async fn flush_stats(&self, flush: StatsFlush) -> Result<(), StoreError> {
        self.call(move |conn| {
            let tx = conn.transaction()?;
            if let Some(total) = &flush.total {
                upsert_metrics(&tx, "stats_total", "id", &1i64, total)?;
            }
            if let Some((date, daily)) = &flush.daily {
                upsert_metrics(&tx, "stats_daily", "date", date, daily)?;
            }
            for (hour, date, metrics) in &flush.hourly {
                let sql = "INSERT INTO stats_hourly (hour, date, input_tokens, output_tokens, \
                           input_cost, output_cost, wait_time_ms, request_success, request_failed) \
                           VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9) \
                           ON CONFLICT(hour) DO UPDATE SET date = excluded.date, \
                           input_tokens = excluded.input_tokens, output_tokens = excluded.output_tokens, \
                           input_cost = excluded.input_cost, output_cost = excluded.output_cost, \
                           wait_time_ms = excluded.wait_time_ms, request_success = excluded.request_success, \
                           request_failed = excluded.request_failed";
                tx.execute(
                    sql,
                    params![
                        hour,
                        date,
                        metrics.input_tokens,
                        metrics.output_tokens,
                        metrics.input_cost,
                        metrics.output_cost,
                        metrics.wait_time_ms,
                        metrics.request_success,
                        metrics.request_failed,
                    ],
                )?;
            }
            for (channel_id, metrics) in &flush.channels {
                upsert_metrics(&tx, "stats_channel", "channel_id", channel_id, metrics)?;
            }
            for (model, metrics) in &flush.models {
                upsert_metrics(&tx, "stats_model", "model", model, metrics)?;
            }
            for (api_key_id, metrics) in &flush.api_keys {
                upsert_metrics(&tx, "stats_api_key", "api_key_id", api_key_id, metrics)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    // Relay log

    pub async fn insert_relay_log(&self, log: RelayLog) -> Result<(), StoreError> {
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO relay_log (time, request_model, channel_name, channel_id, actual_model, \
                 use_time_ms, first_token_ms, input_tokens, output_tokens, cost, request_content, \
                 response_content, error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    log.time,
                    log.request_model,
                    log.channel_name,
                    log.channel_id,
                    log.actual_model,
                    log.use_time_ms,
                    log.first_token_ms,
                    log.input_tokens,
                    log.output_tokens,
                    log.cost,
                    log.request_content,
                    log.response_content,
                    log.error,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn delete_relay_logs_before(&self, time: i64) -> Result<usize, StoreError> {
        self.call(move |conn| {
            Ok(conn.execute("DELETE FROM relay_log WHERE time < ?1", [time])?)
        })
        .await
    }

    pub async fn load_relay_logs(&self, limit: i64) -> Result<Vec<RelayLog>, StoreError> {
        self.call(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT time, request_model, channel_name, channel_id, actual_model, use_time_ms, \
                 first_token_ms, input_tokens, output_tokens, cost, request_content, \
                 response_content, error FROM relay_log ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([limit], |row| {
                Ok(RelayLog {
                    time: row.get(0)?,
                    request_model: row.get(1)?,
                    channel_name: row.get(2)?,
                    channel_id: row.get(3)?,
                    actual_model: row.get(4)?,
                    use_time_ms: row.get(5)?,
                    first_token_ms: row.get(6)?,
                    input_tokens: row.get(7)?,
                    output_tokens: row.get(8)?,
                    cost: row.get(9)?,
                    request_content: row.get(10)?,
                    response_content: row.get(11)?,
                    error: row.get(12)?,
                })
            })?;
            let mut logs = Vec::new();
            for log in rows {
                logs.push(log?);
            }
            Ok(logs)
        })
        .await
    }
}
