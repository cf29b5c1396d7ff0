//! Embedded-file backing engine for the [`super::Store`] trait, using
//! SQLite via `rusqlite`. Every method follows the same shape as the rest
//! of this process tree's SQLite-backed stores: a single connection guarded
//! by a mutex, touched only from inside `tokio::task::spawn_blocking`.

use super::{retry_on_conflict, ChannelFilter, MetricsBucketRow, RetryConfig, Store};
use crate::error::StoreError;
use crate::models::{
    ApiKeyRow, AuthToken, Channel, ChannelType, KeyStrategy, LogEntry, ModelEntry,
};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS channels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    url TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    channel_type TEXT NOT NULL DEFAULT 'anthropic',
    enabled INTEGER NOT NULL DEFAULT 1,
    cooldown_until INTEGER NOT NULL DEFAULT 0,
    cooldown_duration_ms INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_channels_type_enabled ON channels(channel_type, enabled);
CREATE INDEX IF NOT EXISTS idx_channels_priority ON channels(priority DESC);
CREATE INDEX IF NOT EXISTS idx_channels_cooldown ON channels(cooldown_until);

CREATE TABLE IF NOT EXISTS channel_models (
    channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    model TEXT NOT NULL,
    redirect_model TEXT,
    PRIMARY KEY (channel_id, model)
);
CREATE INDEX IF NOT EXISTS idx_channel_models_model ON channel_models(model);

CREATE TABLE IF NOT EXISTS api_keys (
    channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
    key_index INTEGER NOT NULL,
    api_key TEXT NOT NULL,
    key_strategy TEXT NOT NULL DEFAULT 'sequential',
    cooldown_until INTEGER NOT NULL DEFAULT 0,
    cooldown_duration_ms INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (channel_id, key_index)
);

CREATE TABLE IF NOT EXISTS auth_tokens (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_hash TEXT NOT NULL UNIQUE,
    description TEXT NOT NULL DEFAULT '',
    expires_at INTEGER,
    active INTEGER NOT NULL DEFAULT 1,
    allowed_models TEXT NOT NULL DEFAULT '',
    cost_cap_microusd INTEGER,
    cost_used_microusd INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    streaming_ttfb_avg_ms REAL NOT NULL DEFAULT 0,
    non_streaming_duration_avg_ms REAL NOT NULL DEFAULT 0,
    total_tokens INTEGER NOT NULL DEFAULT 0,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS admin_sessions (
    token_hash TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL,
    expires_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS system_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    time_ms INTEGER NOT NULL,
    model TEXT NOT NULL,
    channel_id INTEGER NOT NULL DEFAULT 0,
    status_code INTEGER NOT NULL,
    message TEXT NOT NULL DEFAULT '',
    duration_secs REAL NOT NULL DEFAULT 0,
    is_streaming INTEGER NOT NULL DEFAULT 0,
    first_byte_secs REAL,
    api_key_used TEXT,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    cache_read_tokens INTEGER NOT NULL DEFAULT 0,
    cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
    cost_microusd INTEGER NOT NULL DEFAULT 0,
    auth_token_id INTEGER,
    client_ip TEXT
);
CREATE INDEX IF NOT EXISTS idx_logs_time_model ON logs(time_ms, model);
CREATE INDEX IF NOT EXISTS idx_logs_time_channel_model ON logs(time_ms, channel_id, model);
CREATE INDEX IF NOT EXISTS idx_logs_minute_bucket ON logs((time_ms / 60000));
";

pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

fn now_epoch() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// How far `until_ms` may lag behind "now" and still count as a live
/// window for `rpm_peak_and_recent`'s recent-RPM figure (§4.9): a
/// historical query (e.g. yesterday's range) should report 0, not a
/// number computed against data that has nothing to do with "now".
const RECENT_WINDOW_TOLERANCE_MS: i64 = 5_000;

impl SqliteStore {
    pub async fn new(db_path: PathBuf) -> Result<Self, String> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("failed to create store directory: {e}"))?;
        }

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("failed to open sqlite database: {e}"))?;
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
                .map_err(|e| format!("failed to set pragmas: {e}"))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("failed to run schema: {e}"))?;
            Self::run_migrations(&conn)?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| format!("task join error: {e}"))??;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// `CREATE TABLE IF NOT EXISTS` does not add columns to existing
    /// tables, so schema growth across versions is handled here.
    fn run_migrations(conn: &Connection) -> Result<(), String> {
        let has_column = |table: &str, column: &str| -> Result<bool, String> {
            conn.prepare(&format!(
                "SELECT 1 FROM pragma_table_info('{table}') WHERE name = '{column}'"
            ))
            .map_err(|e| format!("failed to check {table}.{column}: {e}"))?
            .exists([])
            .map_err(|e| format!("failed to query table info: {e}"))
        };

        if !has_column("channels", "channel_type")? {
            conn.execute(
                "ALTER TABLE channels ADD COLUMN channel_type TEXT NOT NULL DEFAULT 'anthropic'",
                [],
            )
            .map_err(|e| format!("failed to add channel_type column: {e}"))?;
        }

        Ok(())
    }

    fn row_to_channel(row: &rusqlite::Row) -> rusqlite::Result<Channel> {
        let channel_type_str: String = row.get("channel_type")?;
        Ok(Channel {
            id: row.get("id")?,
            name: row.get("name")?,
            url: row.get("url")?,
            priority: row.get("priority")?,
            channel_type: ChannelType::from_str_loose(&channel_type_str),
            enabled: row.get::<_, i64>("enabled")? != 0,
            cooldown_until: row.get("cooldown_until")?,
            cooldown_duration_ms: row.get("cooldown_duration_ms")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    fn row_to_key(row: &rusqlite::Row) -> rusqlite::Result<ApiKeyRow> {
        let strategy_str: String = row.get("key_strategy")?;
        Ok(ApiKeyRow {
            channel_id: row.get("channel_id")?,
            key_index: row.get("key_index")?,
            api_key: row.get("api_key")?,
            key_strategy: KeyStrategy::from_str_loose(&strategy_str),
            cooldown_until: row.get("cooldown_until")?,
            cooldown_duration_ms: row.get("cooldown_duration_ms")?,
        })
    }

    fn row_to_log(row: &rusqlite::Row) -> rusqlite::Result<LogEntry> {
        Ok(LogEntry {
            id: row.get("id")?,
            time_ms: row.get("time_ms")?,
            model: row.get("model")?,
            channel_id: row.get("channel_id")?,
            status_code: row.get::<_, i64>("status_code")? as u16,
            message: row.get("message")?,
            duration_secs: row.get("duration_secs")?,
            is_streaming: row.get::<_, i64>("is_streaming")? != 0,
            first_byte_secs: row.get("first_byte_secs")?,
            api_key_used: row.get("api_key_used")?,
            input_tokens: row.get("input_tokens")?,
            output_tokens: row.get("output_tokens")?,
            cache_read_tokens: row.get("cache_read_tokens")?,
            cache_creation_tokens: row.get("cache_creation_tokens")?,
            cost_microusd: row.get("cost_microusd")?,
            auth_token_id: row.get("auth_token_id")?,
            client_ip: row.get("client_ip")?,
        })
    }

    fn row_to_auth_token(row: &rusqlite::Row) -> rusqlite::Result<AuthToken> {
        let allowed_models_raw: String = row.get("allowed_models")?;
        Ok(AuthToken {
            id: row.get("id")?,
            token_hash: row.get("token_hash")?,
            description: row.get("description")?,
            expires_at: row.get("expires_at")?,
            active: row.get::<_, i64>("active")? != 0,
            allowed_models: allowed_models_raw
                .split(',')
                .map(|s| s.to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            cost_cap_microusd: row.get("cost_cap_microusd")?,
            cost_used_microusd: row.get("cost_used_microusd")?,
            success_count: row.get("success_count")?,
            failure_count: row.get("failure_count")?,
            streaming_ttfb_avg_ms: row.get("streaming_ttfb_avg_ms")?,
            non_streaming_duration_avg_ms: row.get("non_streaming_duration_avg_ms")?,
            total_tokens: row.get("total_tokens")?,
            created_at: row.get("created_at")?,
        })
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn list_channels(&self) -> Result<Vec<Channel>, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT * FROM channels ORDER BY priority DESC, id ASC")?;
            let rows = stmt
                .query_map([], Self::row_to_channel)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn get_channel(&self, id: i64) -> Result<Channel, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row("SELECT * FROM channels WHERE id = ?1", params![id], Self::row_to_channel)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn get_channel_by_name(&self, name: &str) -> Result<Option<Channel>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let name = name.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT * FROM channels WHERE name = ?1",
                params![name],
                Self::row_to_channel,
            )
            .optional()
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn create_channel(&self, channel: Channel) -> Result<Channel, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            retry_on_conflict(RetryConfig::default(), None, || {
                let conn = conn.lock().unwrap();
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO channels (name, url, priority, channel_type, enabled, cooldown_until, cooldown_duration_ms, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 0, 0, ?6, ?6)",
                    params![
                        channel.name,
                        channel.url,
                        channel.priority,
                        channel.channel_type.as_str(),
                        channel.enabled as i64,
                        now,
                    ],
                )
                .map_err(StoreError::from)?;
                let id = conn.last_insert_rowid();
                conn.query_row("SELECT * FROM channels WHERE id = ?1", params![id], Self::row_to_channel)
                    .map_err(StoreError::from)
            })
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn update_channel(&self, channel: Channel) -> Result<Channel, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            retry_on_conflict(RetryConfig::default(), None, || {
                let conn = conn.lock().unwrap();
                let now = now_epoch();
                let updated = conn
                    .execute(
                        "UPDATE channels SET name=?1, url=?2, priority=?3, channel_type=?4, enabled=?5, updated_at=?6 WHERE id=?7",
                        params![
                            channel.name,
                            channel.url,
                            channel.priority,
                            channel.channel_type.as_str(),
                            channel.enabled as i64,
                            now,
                            channel.id,
                        ],
                    )
                    .map_err(StoreError::from)?;
                if updated == 0 {
                    return Err(StoreError::NotFound);
                }
                conn.query_row(
                    "SELECT * FROM channels WHERE id = ?1",
                    params![channel.id],
                    Self::row_to_channel,
                )
                .map_err(StoreError::from)
            })
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn delete_channel(&self, id: i64) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let deleted = conn
                .execute("DELETE FROM channels WHERE id = ?1", params![id])
                .map_err(StoreError::from)?;
            if deleted == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn candidate_channels(
        &self,
        model: &str,
        channel_type: Option<&str>,
        now_epoch_secs: i64,
    ) -> Result<Vec<Channel>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let model = model.to_string();
        let channel_type = channel_type.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let sql = "SELECT c.* FROM channels c
                 WHERE c.enabled = 1 AND c.cooldown_until <= ?1
                   AND (?2 = '' OR c.channel_type = ?2)
                   AND EXISTS (
                       SELECT 1 FROM channel_models m
                       WHERE m.channel_id = c.id AND (m.model = ?3 OR m.model = '*')
                   )
                 ORDER BY c.priority DESC, c.id ASC";
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(
                    params![now_epoch_secs, channel_type.unwrap_or_default(), model],
                    Self::row_to_channel,
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn list_models(&self, channel_id: i64) -> Result<Vec<ModelEntry>, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt =
                conn.prepare("SELECT channel_id, model, redirect_model FROM channel_models WHERE channel_id = ?1")?;
            let rows = stmt
                .query_map(params![channel_id], |row| {
                    Ok(ModelEntry {
                        channel_id: row.get(0)?,
                        model: row.get(1)?,
                        redirect_model: row.get(2)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn replace_models(
        &self,
        channel_id: i64,
        models: Vec<ModelEntry>,
    ) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction().map_err(StoreError::from)?;
            tx.execute(
                "DELETE FROM channel_models WHERE channel_id = ?1",
                params![channel_id],
            )
            .map_err(StoreError::from)?;
            for m in &models {
                tx.execute(
                    "INSERT INTO channel_models (channel_id, model, redirect_model) VALUES (?1, ?2, ?3)",
                    params![channel_id, m.model, m.redirect_model],
                )
                .map_err(StoreError::from)?;
            }
            tx.commit().map_err(StoreError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn list_keys(&self, channel_id: i64) -> Result<Vec<ApiKeyRow>, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT * FROM api_keys WHERE channel_id = ?1 ORDER BY key_index ASC",
            )?;
            let rows = stmt
                .query_map(params![channel_id], Self::row_to_key)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn add_key(
        &self,
        channel_id: i64,
        api_key: String,
        key_strategy: KeyStrategy,
    ) -> Result<ApiKeyRow, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let next_index: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(key_index), -1) + 1 FROM api_keys WHERE channel_id = ?1",
                    params![channel_id],
                    |r| r.get(0),
                )
                .map_err(StoreError::from)?;
            conn.execute(
                "INSERT INTO api_keys (channel_id, key_index, api_key, key_strategy, cooldown_until, cooldown_duration_ms)
                 VALUES (?1, ?2, ?3, ?4, 0, 0)",
                params![channel_id, next_index, api_key, key_strategy.as_str()],
            )
            .map_err(StoreError::from)?;
            Ok(ApiKeyRow {
                channel_id,
                key_index: next_index,
                api_key,
                key_strategy,
                cooldown_until: 0,
                cooldown_duration_ms: 0,
            })
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn delete_key(&self, channel_id: i64, key_index: i64) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction().map_err(StoreError::from)?;
            let deleted = tx
                .execute(
                    "DELETE FROM api_keys WHERE channel_id = ?1 AND key_index = ?2",
                    params![channel_id, key_index],
                )
                .map_err(StoreError::from)?;
            if deleted == 0 {
                return Err(StoreError::NotFound);
            }
            // Compaction: shift every higher index down by one so the
            // sequence stays dense 0..N-1.
            tx.execute(
                "UPDATE api_keys SET key_index = key_index - 1 WHERE channel_id = ?1 AND key_index > ?2",
                params![channel_id, key_index],
            )
            .map_err(StoreError::from)?;
            tx.commit().map_err(StoreError::from)?;
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn bump_channel_cooldown(
        &self,
        channel_id: i64,
        until: i64,
        duration_ms: i64,
    ) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            retry_on_conflict(RetryConfig::default(), None, || {
                let conn = conn.lock().unwrap();
                conn.execute(
                    "UPDATE channels SET cooldown_until = ?1, cooldown_duration_ms = ?2, updated_at = ?3 WHERE id = ?4",
                    params![until, duration_ms, now_epoch(), channel_id],
                )
                .map(|_| ())
                .map_err(StoreError::from)
            })
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn reset_channel_cooldown(&self, channel_id: i64) -> Result<(), StoreError> {
        self.bump_channel_cooldown(channel_id, 0, 0).await
    }

    async fn bump_key_cooldown(
        &self,
        channel_id: i64,
        key_index: i64,
        until: i64,
        duration_ms: i64,
    ) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            retry_on_conflict(RetryConfig::default(), None, || {
                let conn = conn.lock().unwrap();
                conn.execute(
                    "UPDATE api_keys SET cooldown_until = ?1, cooldown_duration_ms = ?2 WHERE channel_id = ?3 AND key_index = ?4",
                    params![until, duration_ms, channel_id, key_index],
                )
                .map(|_| ())
                .map_err(StoreError::from)
            })
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn reset_key_cooldown(&self, channel_id: i64, key_index: i64) -> Result<(), StoreError> {
        self.bump_key_cooldown(channel_id, key_index, 0, 0).await
    }

    async fn active_channel_cooldowns(&self) -> Result<HashMap<i64, i64>, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, cooldown_until FROM channels WHERE cooldown_until > ?1",
            )?;
            let map = stmt
                .query_map(params![now_epoch()], |r| Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?)))?
                .collect::<Result<HashMap<_, _>, _>>()?;
            Ok(map)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn active_key_cooldowns(&self) -> Result<HashMap<i64, HashMap<i64, i64>>, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT channel_id, key_index, cooldown_until FROM api_keys WHERE cooldown_until > ?1",
            )?;
            let mut out: HashMap<i64, HashMap<i64, i64>> = HashMap::new();
            let rows = stmt.query_map(params![now_epoch()], |r| {
                Ok((r.get::<_, i64>(0)?, r.get::<_, i64>(1)?, r.get::<_, i64>(2)?))
            })?;
            for row in rows {
                let (channel_id, key_index, until) = row?;
                out.entry(channel_id).or_default().insert(key_index, until);
            }
            Ok(out)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn create_auth_token(&self, token: AuthToken) -> Result<AuthToken, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let now = now_epoch();
            conn.execute(
                "INSERT INTO auth_tokens (token_hash, description, expires_at, active, allowed_models, cost_cap_microusd, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    token.token_hash,
                    token.description,
                    token.expires_at,
                    token.active as i64,
                    token.allowed_models.join(","),
                    token.cost_cap_microusd,
                    now,
                ],
            )
            .map_err(StoreError::from)?;
            let id = conn.last_insert_rowid();
            conn.query_row("SELECT * FROM auth_tokens WHERE id = ?1", params![id], Self::row_to_auth_token)
                .map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn list_auth_tokens(&self) -> Result<Vec<AuthToken>, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT * FROM auth_tokens ORDER BY id ASC")?;
            let rows = stmt
                .query_map([], Self::row_to_auth_token)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn get_auth_token_by_hash(
        &self,
        token_hash: &str,
    ) -> Result<Option<AuthToken>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let token_hash = token_hash.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT * FROM auth_tokens WHERE token_hash = ?1",
                params![token_hash],
                Self::row_to_auth_token,
            )
            .optional()
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn delete_auth_token(&self, id: i64) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let deleted = conn
                .execute("DELETE FROM auth_tokens WHERE id = ?1", params![id])
                .map_err(StoreError::from)?;
            if deleted == 0 {
                return Err(StoreError::NotFound);
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn record_auth_token_usage(
        &self,
        id: i64,
        success: bool,
        duration_ms: f64,
        is_streaming: bool,
        tokens: i64,
        cost_microusd: i64,
    ) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let avg_column = if is_streaming {
                "streaming_ttfb_avg_ms"
            } else {
                "non_streaming_duration_avg_ms"
            };
            // Simple rolling average: new_avg = old_avg + (sample - old_avg) / count
            let success_inc = if success { 1 } else { 0 };
            let failure_inc = if success { 0 } else { 1 };
            conn.execute(
                &format!(
                    "UPDATE auth_tokens SET
                        success_count = success_count + ?1,
                        failure_count = failure_count + ?2,
                        total_tokens = total_tokens + ?3,
                        cost_used_microusd = cost_used_microusd + ?4,
                        {avg_column} = {avg_column} + (?5 - {avg_column}) / (success_count + failure_count + 1)
                     WHERE id = ?6"
                ),
                params![success_inc, failure_inc, tokens, cost_microusd, duration_ms, id],
            )
            .map(|_| ())
            .map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn create_admin_session(
        &self,
        token_hash: &str,
        created_at: i64,
        expires_at: i64,
    ) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let token_hash = token_hash.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT OR REPLACE INTO admin_sessions (token_hash, created_at, expires_at) VALUES (?1, ?2, ?3)",
                params![token_hash, created_at, expires_at],
            )
            .map(|_| ())
            .map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn get_admin_session(&self, token_hash: &str) -> Result<Option<i64>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let token_hash = token_hash.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT expires_at FROM admin_sessions WHERE token_hash = ?1",
                params![token_hash],
                |r| r.get(0),
            )
            .optional()
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn delete_expired_admin_sessions(&self, now: i64) -> Result<u64, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let deleted = conn
                .execute("DELETE FROM admin_sessions WHERE expires_at <= ?1", params![now])
                .map_err(StoreError::from)?;
            Ok(deleted as u64)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn delete_admin_session(&self, token_hash: &str) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let token_hash = token_hash.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "DELETE FROM admin_sessions WHERE token_hash = ?1",
                params![token_hash],
            )
            .map(|_| ())
            .map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.query_row(
                "SELECT value FROM system_settings WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = Arc::clone(&self.conn);
        let key = key.to_string();
        let value = value.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            conn.execute(
                "INSERT INTO system_settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .map(|_| ())
            .map_err(StoreError::from)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn append_logs(&self, entries: Vec<LogEntry>) -> Result<usize, StoreError> {
        if entries.is_empty() {
            return Ok(0);
        }
        let conn = Arc::clone(&self.conn);
        let count = entries.len();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap();
            let tx = conn.transaction().map_err(StoreError::from)?;
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO logs (time_ms, model, channel_id, status_code, message, duration_secs, is_streaming,
                        first_byte_secs, api_key_used, input_tokens, output_tokens, cache_read_tokens,
                        cache_creation_tokens, cost_microusd, auth_token_id, client_ip)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
                )?;
                for e in &entries {
                    stmt.execute(params![
                        e.time_ms,
                        e.model,
                        e.channel_id,
                        e.status_code as i64,
                        e.message,
                        e.duration_secs,
                        e.is_streaming as i64,
                        e.first_byte_secs,
                        e.api_key_used,
                        e.input_tokens,
                        e.output_tokens,
                        e.cache_read_tokens,
                        e.cache_creation_tokens,
                        e.cost_microusd,
                        e.auth_token_id,
                        e.client_ip,
                    ])?;
                }
            }
            tx.commit().map_err(StoreError::from)?;
            Ok(count)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn recent_errors(&self, limit: i64) -> Result<Vec<LogEntry>, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT * FROM logs WHERE status_code < 200 OR status_code >= 300
                 ORDER BY time_ms DESC LIMIT ?1",
            )?;
            let rows = stmt
                .query_map(params![limit], Self::row_to_log)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn prune_logs_older_than(&self, cutoff_ms: i64, batch_size: u32) -> Result<u64, StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let mut total = 0u64;
            loop {
                let deleted = conn
                    .execute(
                        "DELETE FROM logs WHERE id IN (SELECT id FROM logs WHERE time_ms < ?1 LIMIT ?2)",
                        params![cutoff_ms, batch_size],
                    )
                    .map_err(StoreError::from)?;
                total += deleted as u64;
                if deleted == 0 || (deleted as u32) < batch_size {
                    break;
                }
            }
            Ok(total)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
    }

    async fn metrics_buckets(
        &self,
        since_ms: i64,
        until_ms: i64,
        bucket_secs: i64,
        filter: ChannelFilter,
    ) -> Result<Vec<MetricsBucketRow>, StoreError> {
        let conn = Arc::clone(&self.conn);
        let bucket_ms = bucket_secs.max(1) * 1000;
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();

            // Resolve channel filters to a set of ids in one query, per §4.9.
            let resolved_ids: Option<Vec<i64>> = if filter.channel_type.is_some() || filter.channel_name.is_some() {
                let mut sql = "SELECT id FROM channels WHERE 1=1".to_string();
                if filter.channel_type.is_some() {
                    sql.push_str(" AND channel_type = :ctype");
                }
                if filter.channel_name.is_some() {
                    sql.push_str(" AND name LIKE :cname");
                }
                let mut stmt = conn.prepare(&sql)?;
                let ctype = filter.channel_type.clone().unwrap_or_default();
                let cname = filter
                    .channel_name
                    .clone()
                    .map(|n| format!("%{n}%"))
                    .unwrap_or_default();
                let rows: Vec<i64> = stmt
                    .query_map(
                        rusqlite::named_params! { ":ctype": ctype, ":cname": cname },
                        |r| r.get(0),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                Some(rows)
            } else {
                None
            };

            if let Some(ids) = &resolved_ids {
                if ids.is_empty() {
                    return Ok(Vec::new());
                }
            }

            let mut sql = "SELECT
                    (time_ms / ?1) * ?1 AS bucket_start,
                    channel_id,
                    SUM(CASE WHEN status_code >= 200 AND status_code < 300 THEN 1 ELSE 0 END) AS success_count,
                    SUM(CASE WHEN status_code != 499 AND NOT (status_code >= 200 AND status_code < 300) THEN 1 ELSE 0 END) AS error_count,
                    COUNT(*) AS total_count
                 FROM logs
                 WHERE time_ms >= ?2 AND time_ms < ?3
                   AND (?4 = '' OR model = ?4)
                   AND (?5 = -1 OR auth_token_id = ?5)"
                .to_string();
            if resolved_ids.is_some() {
                sql.push_str(" AND channel_id IN (SELECT value FROM json_each(?6))");
            }
            sql.push_str(" GROUP BY bucket_start, channel_id ORDER BY bucket_start ASC");

            let ids_json = resolved_ids
                .map(|ids| serde_json::to_string(&ids).unwrap_or_else(|_| "[]".to_string()))
                .unwrap_or_else(|| "[]".to_string());
            let model_filter = filter.model.clone().unwrap_or_default();
            let auth_token_filter = filter.auth_token_id.unwrap_or(-1);

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(
                    params![bucket_ms, since_ms, until_ms, model_filter, auth_token_filter, ids_json],
                    |r| {
                        Ok(MetricsBucketRow {
                            bucket_start: r.get(0)?,
                            channel_id: r.get(1)?,
                            success_count: r.get(2)?,
                            error_count: r.get(3)?,
                            total_count: r.get(4)?,
                        })
                    },
                )?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }

    async fn rpm_peak_and_recent(&self, since_ms: i64, until_ms: i64) -> Result<(i64, i64), StoreError> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn.lock().unwrap();
            let peak: i64 = conn
                .query_row(
                    "SELECT COALESCE(MAX(c), 0) FROM (
                        SELECT COUNT(*) AS c FROM logs WHERE time_ms >= ?1 AND time_ms < ?2
                        GROUP BY (time_ms / 60000)
                     )",
                    params![since_ms, until_ms],
                    |r| r.get(0),
                )
                .map_err(StoreError::from)?;
            let recent: i64 = if until_ms >= now_ms() - RECENT_WINDOW_TOLERANCE_MS {
                conn.query_row(
                    "SELECT COUNT(*) FROM logs WHERE time_ms >= ?1 AND time_ms < ?2",
                    params![until_ms - 60_000, until_ms],
                    |r| r.get(0),
                )
                .map_err(StoreError::from)?
            } else {
                0
            };
            Ok((peak, recent))
        })
        .await
        .map_err(|e| StoreError::Fatal(e.to_string()))?
        .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ChannelType;

    async fn test_store() -> SqliteStore {
        let dir = tempfile::tempdir().unwrap();
        SqliteStore::new(dir.path().join("test.db")).await.unwrap()
    }

    #[tokio::test]
    async fn create_and_list_channel_roundtrips() {
        let store = test_store().await;
        let channel = Channel {
            id: 0,
            name: "primary".into(),
            url: "https://api.example.com".into(),
            priority: 10,
            channel_type: ChannelType::Anthropic,
            enabled: true,
            cooldown_until: 0,
            cooldown_duration_ms: 0,
            created_at: 0,
            updated_at: 0,
        };
        let created = store.create_channel(channel).await.unwrap();
        assert!(created.id > 0);
        let listed = store.list_channels().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name, "primary");
    }

    #[tokio::test]
    async fn deleting_a_key_compacts_indices() {
        let store = test_store().await;
        let channel = store
            .create_channel(Channel {
                id: 0,
                name: "c".into(),
                url: "https://x".into(),
                priority: 0,
                channel_type: ChannelType::Anthropic,
                enabled: true,
                cooldown_until: 0,
                cooldown_duration_ms: 0,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        for i in 0..4 {
            store
                .add_key(channel.id, format!("key{i}"), KeyStrategy::Sequential)
                .await
                .unwrap();
        }
        store.delete_key(channel.id, 1).await.unwrap();
        let keys = store.list_keys(channel.id).await.unwrap();
        let indices: Vec<i64> = keys.iter().map(|k| k.key_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(keys[1].api_key, "key2");
        assert_eq!(keys[2].api_key, "key3");
    }

    #[tokio::test]
    async fn candidate_channels_filters_disabled_and_cooling() {
        let store = test_store().await;
        let a = store
            .create_channel(Channel {
                id: 0,
                name: "a".into(),
                url: "https://a".into(),
                priority: 10,
                channel_type: ChannelType::Anthropic,
                enabled: true,
                cooldown_until: 0,
                cooldown_duration_ms: 0,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        let b = store
            .create_channel(Channel {
                id: 0,
                name: "b".into(),
                url: "https://b".into(),
                priority: 5,
                channel_type: ChannelType::Anthropic,
                enabled: false,
                cooldown_until: 0,
                cooldown_duration_ms: 0,
                created_at: 0,
                updated_at: 0,
            })
            .await
            .unwrap();
        store
            .replace_models(a.id, vec![ModelEntry { channel_id: a.id, model: "gpt-4".into(), redirect_model: None }])
            .await
            .unwrap();
        store
            .replace_models(b.id, vec![ModelEntry { channel_id: b.id, model: "gpt-4".into(), redirect_model: None }])
            .await
            .unwrap();
        let candidates = store.candidate_channels("gpt-4", None, now_epoch()).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].id, a.id);
    }
}
