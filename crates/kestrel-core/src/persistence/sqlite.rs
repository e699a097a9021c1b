// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{SqliteConnection, SqlitePool};

use super::{
    EventStore, ExecutionStore, MutableStateStore, Persistence, TimerStore, check_contiguous,
};
use crate::error::CoreError;
use crate::events::{EventSerializer, HistoryEvent};
use crate::hash;
use crate::state::{ExecutionKey, MutableState};
use crate::timer::{Timer, TimerKey, TimerStatus};

pub(crate) static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

const DEFAULT_NUM_SHARDS: u32 = 16;

#[derive(Debug, sqlx::FromRow)]
struct EventRow {
    event_id: i64,
    encoding: String,
    data: Vec<u8>,
}

#[derive(Debug, sqlx::FromRow)]
struct StateRow {
    db_version: i64,
    state: String,
}

#[derive(Debug, sqlx::FromRow)]
struct ExecutionKeyRow {
    namespace_id: String,
    workflow_id: String,
    run_id: String,
}

#[derive(Debug, sqlx::FromRow)]
struct TimerRow {
    namespace_id: String,
    workflow_id: String,
    run_id: String,
    timer_id: String,
    shard_id: i64,
    fire_time_ms: i64,
    status: String,
    version: i64,
    created_at_ms: i64,
    fired_at_ms: Option<i64>,
}

impl TryFrom<TimerRow> for Timer {
    type Error = CoreError;

    fn try_from(row: TimerRow) -> Result<Self, CoreError> {
        Ok(Timer {
            shard_id: u32::try_from(row.shard_id)
                .map_err(|_| CoreError::serialization(format!("bad shard_id {}", row.shard_id)))?,
            fire_time: from_millis(row.fire_time_ms)?,
            status: TimerStatus::parse(&row.status)?,
            version: row.version,
            created_at: from_millis(row.created_at_ms)?,
            fired_at: row.fired_at_ms.map(from_millis).transpose()?,
            namespace_id: row.namespace_id,
            workflow_id: row.workflow_id,
            run_id: row.run_id,
            timer_id: row.timer_id,
        })
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, CoreError> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| CoreError::serialization(format!("timestamp {} out of range", ms)))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
    serializer: EventSerializer,
    num_shards: u32,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing, migrated pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            serializer: EventSerializer::default(),
            num_shards: DEFAULT_NUM_SHARDS,
        }
    }

    /// Use `serializer` for event rows.
    ///
    /// Rows written in another encoding are refused on read.
    pub fn with_serializer(mut self, serializer: EventSerializer) -> Self {
        self.serializer = serializer;
        self
    }

    /// Shard count recorded on execution rows.
    pub fn with_num_shards(mut self, num_shards: u32) -> Self {
        self.num_shards = num_shards.max(1);
        self
    }

    /// Connect to a `sqlite:` URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        Self::migrate(&pool).await?;
        Ok(Self::new(pool))
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if they don't exist,
    /// then runs all migrations.
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/kestrel.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    async fn migrate(pool: &SqlitePool) -> Result<(), CoreError> {
        MIGRATOR
            .run(pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }

    async fn append_on(
        &self,
        conn: &mut SqliteConnection,
        key: &ExecutionKey,
        events: &[HistoryEvent],
        expected_last_event_id: i64,
    ) -> Result<(), CoreError> {
        let current: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT last_event_id FROM executions
            WHERE namespace_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(&key.namespace_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .fetch_optional(&mut *conn)
        .await?;

        let actual = current.unwrap_or(0);
        if actual != expected_last_event_id {
            return Err(CoreError::conflict(
                format!("history:{}", key),
                expected_last_event_id,
                actual,
            ));
        }
        check_contiguous(key, events, expected_last_event_id)?;
        let Some(last) = events.last() else {
            return Ok(());
        };

        let guard = if current.is_none() {
            sqlx::query(
                r#"
                INSERT INTO executions (namespace_id, workflow_id, run_id, shard_id, last_event_id, created_at_ms)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&key.namespace_id)
            .bind(&key.workflow_id)
            .bind(&key.run_id)
            .bind(hash::shard_for(&key.namespace_id, &key.workflow_id, self.num_shards) as i64)
            .bind(last.event_id)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *conn)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE executions SET last_event_id = ?
                WHERE namespace_id = ? AND workflow_id = ? AND run_id = ? AND last_event_id = ?
                "#,
            )
            .bind(last.event_id)
            .bind(&key.namespace_id)
            .bind(&key.workflow_id)
            .bind(&key.run_id)
            .bind(expected_last_event_id)
            .execute(&mut *conn)
            .await
        };

        let lost_race = match guard {
            Ok(result) => result.rows_affected() == 0,
            Err(e) if is_unique_violation(&e) => true,
            Err(e) => return Err(e.into()),
        };
        if lost_race {
            return Err(CoreError::conflict(
                format!("history:{}", key),
                expected_last_event_id,
                -1,
            ));
        }

        let encoding = self.serializer.encoding().as_str();
        for event in events {
            let data = self.serializer.serialize_versioned(event)?;
            sqlx::query(
                r#"
                INSERT INTO history_events (namespace_id, workflow_id, run_id, event_id, event_type, encoding, data)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&key.namespace_id)
            .bind(&key.workflow_id)
            .bind(&key.run_id)
            .bind(event.event_id)
            .bind(event.event_type.code())
            .bind(encoding)
            .bind(data)
            .execute(&mut *conn)
            .await?;
        }

        Ok(())
    }

    async fn update_state_on(
        &self,
        conn: &mut SqliteConnection,
        key: &ExecutionKey,
        state: &MutableState,
        expected_version: i64,
    ) -> Result<i64, CoreError> {
        let current: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT db_version FROM mutable_state
            WHERE namespace_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(&key.namespace_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .fetch_optional(&mut *conn)
        .await?;

        let actual = current.unwrap_or(0);
        if actual != expected_version {
            return Err(CoreError::conflict(
                format!("state:{}", key),
                expected_version,
                actual,
            ));
        }

        let new_version = expected_version + 1;
        let mut stored = state.clone();
        stored.db_version = new_version;
        let json = serde_json::to_string(&stored)?;
        let now_ms = Utc::now().timestamp_millis();

        let result = if current.is_none() {
            sqlx::query(
                r#"
                INSERT INTO mutable_state (namespace_id, workflow_id, run_id, db_version, status, next_event_id, state, updated_at_ms)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&key.namespace_id)
            .bind(&key.workflow_id)
            .bind(&key.run_id)
            .bind(new_version)
            .bind(stored.status().as_str())
            .bind(stored.next_event_id)
            .bind(&json)
            .bind(now_ms)
            .execute(&mut *conn)
            .await
        } else {
            sqlx::query(
                r#"
                UPDATE mutable_state
                SET db_version = ?, status = ?, next_event_id = ?, state = ?, updated_at_ms = ?
                WHERE namespace_id = ? AND workflow_id = ? AND run_id = ? AND db_version = ?
                "#,
            )
            .bind(new_version)
            .bind(stored.status().as_str())
            .bind(stored.next_event_id)
            .bind(&json)
            .bind(now_ms)
            .bind(&key.namespace_id)
            .bind(&key.workflow_id)
            .bind(&key.run_id)
            .bind(expected_version)
            .execute(&mut *conn)
            .await
        };

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(new_version),
            Ok(_) => Err(CoreError::conflict(format!("state:{}", key), expected_version, -1)),
            Err(e) if is_unique_violation(&e) => {
                Err(CoreError::conflict(format!("state:{}", key), expected_version, -1))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl EventStore for SqlitePersistence {
    async fn append_events(
        &self,
        key: &ExecutionKey,
        events: &[HistoryEvent],
        expected_last_event_id: i64,
    ) -> Result<(), CoreError> {
        let mut tx = self.pool.begin().await?;
        self.append_on(&mut tx, key, events, expected_last_event_id)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_events(
        &self,
        key: &ExecutionKey,
        first_event_id: i64,
        last_event_id: i64,
    ) -> Result<Vec<HistoryEvent>, CoreError> {
        let rows = sqlx::query_as::<_, EventRow>(
            r#"
            SELECT event_id, encoding, data
            FROM history_events
            WHERE namespace_id = ? AND workflow_id = ? AND run_id = ?
              AND event_id >= ? AND event_id <= ?
            ORDER BY event_id ASC
            "#,
        )
        .bind(&key.namespace_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .bind(first_event_id)
        .bind(last_event_id)
        .fetch_all(&self.pool)
        .await?;

        let expected_encoding = self.serializer.encoding().as_str();
        rows.into_iter()
            .map(|row| {
                if row.encoding != expected_encoding {
                    return Err(CoreError::serialization(format!(
                        "event {} of '{}' is encoded as '{}', store is configured for '{}'",
                        row.event_id, key, row.encoding, expected_encoding
                    )));
                }
                self.serializer.deserialize_versioned(&row.data)
            })
            .collect()
    }

    async fn get_event_count(&self, key: &ExecutionKey) -> Result<i64, CoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM history_events
            WHERE namespace_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(&key.namespace_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

#[async_trait]
impl MutableStateStore for SqlitePersistence {
    async fn get_mutable_state(&self, key: &ExecutionKey) -> Result<MutableState, CoreError> {
        let row = sqlx::query_as::<_, StateRow>(
            r#"
            SELECT db_version, state FROM mutable_state
            WHERE namespace_id = ? AND workflow_id = ? AND run_id = ?
            "#,
        )
        .bind(&key.namespace_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| CoreError::ExecutionNotFound {
            execution: key.to_string(),
        })?;

        let mut state: MutableState = serde_json::from_str(&row.state)?;
        state.db_version = row.db_version;
        Ok(state)
    }

    async fn update_mutable_state(
        &self,
        key: &ExecutionKey,
        state: &MutableState,
        expected_version: i64,
    ) -> Result<i64, CoreError> {
        let mut tx = self.pool.begin().await?;
        let version = self
            .update_state_on(&mut tx, key, state, expected_version)
            .await?;
        tx.commit().await?;
        Ok(version)
    }

    async fn list_running_executions(&self) -> Result<Vec<ExecutionKey>, CoreError> {
        let rows = sqlx::query_as::<_, ExecutionKeyRow>(
            r#"
            SELECT namespace_id, workflow_id, run_id FROM mutable_state
            WHERE status = 'running'
            ORDER BY namespace_id, workflow_id, run_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| ExecutionKey::new(r.namespace_id, r.workflow_id, r.run_id))
            .collect())
    }
}

#[async_trait]
impl ExecutionStore for SqlitePersistence {
    async fn commit_transition(
        &self,
        key: &ExecutionKey,
        events: &[HistoryEvent],
        expected_last_event_id: i64,
        state: &MutableState,
        expected_version: i64,
    ) -> Result<i64, CoreError> {
        let mut tx = self.pool.begin().await?;
        self.append_on(&mut tx, key, events, expected_last_event_id)
            .await?;
        let version = self
            .update_state_on(&mut tx, key, state, expected_version)
            .await?;
        tx.commit().await?;
        Ok(version)
    }
}

#[async_trait]
impl TimerStore for SqlitePersistence {
    async fn create_timer(&self, timer: &Timer) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO timers (namespace_id, workflow_id, run_id, timer_id, shard_id,
                                fire_time_ms, status, version, created_at_ms, fired_at_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&timer.namespace_id)
        .bind(&timer.workflow_id)
        .bind(&timer.run_id)
        .bind(&timer.timer_id)
        .bind(timer.shard_id as i64)
        .bind(timer.fire_time.timestamp_millis())
        .bind(timer.status.as_str())
        .bind(timer.version)
        .bind(timer.created_at.timestamp_millis())
        .bind(timer.fired_at.map(|t| t.timestamp_millis()))
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(CoreError::TimerAlreadyExists {
                execution: timer.execution().to_string(),
                timer_id: timer.timer_id.clone(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_timer(&self, key: &TimerKey) -> Result<Option<Timer>, CoreError> {
        let row = sqlx::query_as::<_, TimerRow>(
            r#"
            SELECT namespace_id, workflow_id, run_id, timer_id, shard_id,
                   fire_time_ms, status, version, created_at_ms, fired_at_ms
            FROM timers
            WHERE namespace_id = ? AND workflow_id = ? AND run_id = ? AND timer_id = ?
            "#,
        )
        .bind(&key.namespace_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .bind(&key.timer_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(Timer::try_from).transpose()
    }

    async fn update_timer(&self, timer: &Timer, expected_version: i64) -> Result<i64, CoreError> {
        let new_version = expected_version + 1;
        let result = sqlx::query(
            r#"
            UPDATE timers
            SET fire_time_ms = ?, status = ?, version = ?, fired_at_ms = ?
            WHERE namespace_id = ? AND workflow_id = ? AND run_id = ? AND timer_id = ?
              AND version = ?
            "#,
        )
        .bind(timer.fire_time.timestamp_millis())
        .bind(timer.status.as_str())
        .bind(new_version)
        .bind(timer.fired_at.map(|t| t.timestamp_millis()))
        .bind(&timer.namespace_id)
        .bind(&timer.workflow_id)
        .bind(&timer.run_id)
        .bind(&timer.timer_id)
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(new_version);
        }

        let key = timer.key();
        match self.get_timer(&key).await? {
            Some(current) => Err(CoreError::conflict(
                format!("timer:{}", key),
                expected_version,
                current.version,
            )),
            None => Err(CoreError::TimerNotFound {
                execution: key.execution().to_string(),
                timer_id: key.timer_id,
            }),
        }
    }

    async fn get_due_timers(
        &self,
        shard_id: u32,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Timer>, CoreError> {
        let rows = sqlx::query_as::<_, TimerRow>(
            r#"
            SELECT namespace_id, workflow_id, run_id, timer_id, shard_id,
                   fire_time_ms, status, version, created_at_ms, fired_at_ms
            FROM timers
            WHERE shard_id = ? AND status = 'pending' AND fire_time_ms <= ?
            ORDER BY fire_time_ms ASC, namespace_id, workflow_id, run_id, timer_id
            LIMIT ?
            "#,
        )
        .bind(shard_id as i64)
        .bind(now.timestamp_millis())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Timer::try_from).collect()
    }

    async fn list_timers_for_execution(
        &self,
        key: &ExecutionKey,
    ) -> Result<Vec<Timer>, CoreError> {
        let rows = sqlx::query_as::<_, TimerRow>(
            r#"
            SELECT namespace_id, workflow_id, run_id, timer_id, shard_id,
                   fire_time_ms, status, version, created_at_ms, fired_at_ms
            FROM timers
            WHERE namespace_id = ? AND workflow_id = ? AND run_id = ?
            ORDER BY timer_id
            "#,
        )
        .bind(&key.namespace_id)
        .bind(&key.workflow_id)
        .bind(&key.run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Timer::try_from).collect()
    }
}

#[async_trait]
impl Persistence for SqlitePersistence {
    async fn health_check(&self) -> Result<bool, CoreError> {
        let one: i64 = sqlx::query_scalar("SELECT 1").fetch_one(&self.pool).await?;
        Ok(one == 1)
    }
}
