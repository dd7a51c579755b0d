//! 异步 SQLite 存储（sqlx）
//!
//! 每类记录以 JSON 文本保存完整结构，另存 session_id / created_at / trigger 等列用于过滤与排序。
//! 需要启用 `async-sqlite` feature。

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::checkpoint::Checkpoint;
use crate::core::state::SessionRecord;
use crate::core::HiveError;
use crate::snapshot::{Snapshot, SnapshotFilter};
use crate::storage::Store;
use crate::todo::TodoList;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// 打开（或创建）数据库文件并初始化表
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self, HiveError> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.as_ref().display());

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&db_url)
            .await?;

        let store = Self { pool };
        store.init_tables().await?;
        Ok(store)
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn init_tables(&self) -> Result<(), HiveError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS todo_lists (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                body TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                status TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL,
                trigger TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_checkpoints_session ON checkpoints(session_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_snapshots_session ON snapshots(session_id, created_at)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn decode<T: serde::de::DeserializeOwned>(row: &sqlx::sqlite::SqliteRow) -> Result<T, HiveError> {
        let body: String = row.try_get("body")?;
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_session(&self, session: &SessionRecord) -> Result<(), HiveError> {
        let body = serde_json::to_string(session)?;
        sqlx::query(
            "INSERT OR REPLACE INTO sessions (id, status, body, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&session.id)
        .bind(session.status.to_string())
        .bind(&body)
        .bind(session.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_session(&self, session_id: &str) -> Result<Option<SessionRecord>, HiveError> {
        let row = sqlx::query("SELECT body FROM sessions WHERE id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn save_todo_list(&self, list: &TodoList) -> Result<(), HiveError> {
        let body = serde_json::to_string(list)?;
        sqlx::query(
            "INSERT OR REPLACE INTO todo_lists (id, session_id, body, updated_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&list.id)
        .bind(&list.session_id)
        .bind(&body)
        .bind(list.updated_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_todo_list(&self, todo_list_id: &str) -> Result<Option<TodoList>, HiveError> {
        let row = sqlx::query("SELECT body FROM todo_lists WHERE id = ?")
            .bind(todo_list_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn insert_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), HiveError> {
        let body = serde_json::to_string(checkpoint)?;
        sqlx::query(
            "INSERT INTO checkpoints (id, session_id, status, body, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint.id)
        .bind(&checkpoint.session_id)
        .bind(serde_json::to_string(&checkpoint.status)?)
        .bind(&body)
        .bind(checkpoint.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), HiveError> {
        let body = serde_json::to_string(checkpoint)?;
        let result = sqlx::query("UPDATE checkpoints SET status = ?, body = ? WHERE id = ?")
            .bind(serde_json::to_string(&checkpoint.status)?)
            .bind(&body)
            .bind(&checkpoint.id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(HiveError::not_found("checkpoint", &checkpoint.id));
        }
        Ok(())
    }

    async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<Checkpoint>, HiveError> {
        let row = sqlx::query("SELECT body FROM checkpoints WHERE id = ?")
            .bind(checkpoint_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn list_checkpoints(&self, session_id: &str) -> Result<Vec<Checkpoint>, HiveError> {
        let rows = sqlx::query(
            "SELECT body FROM checkpoints WHERE session_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn insert_snapshot(&self, snapshot: &Snapshot) -> Result<(), HiveError> {
        let body = serde_json::to_string(snapshot)?;
        sqlx::query(
            "INSERT INTO snapshots (id, session_id, trigger, body, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&snapshot.id)
        .bind(&snapshot.session_id)
        .bind(snapshot.trigger.to_string())
        .bind(&body)
        .bind(snapshot.created_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<Snapshot>, HiveError> {
        let row = sqlx::query("SELECT body FROM snapshots WHERE id = ?")
            .bind(snapshot_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::decode).transpose()
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> Result<bool, HiveError> {
        let result = sqlx::query("DELETE FROM snapshots WHERE id = ?")
            .bind(snapshot_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_snapshots(&self, filter: &SnapshotFilter) -> Result<Vec<Snapshot>, HiveError> {
        let mut sql = String::from("SELECT body FROM snapshots WHERE 1 = 1");
        if filter.session_id.is_some() {
            sql.push_str(" AND session_id = ?");
        }
        if filter.trigger.is_some() {
            sql.push_str(" AND trigger = ?");
        }
        if filter.since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        if filter.until.is_some() {
            sql.push_str(" AND created_at < ?");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(session_id) = &filter.session_id {
            query = query.bind(session_id);
        }
        if let Some(trigger) = filter.trigger {
            query = query.bind(trigger.to_string());
        }
        if let Some(since) = filter.since {
            query = query.bind(since.timestamp_millis());
        }
        if let Some(until) = filter.until {
            query = query.bind(until.timestamp_millis());
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::decode).collect()
    }

    async fn delete_snapshots_before(
        &self,
        session_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, HiveError> {
        let result = sqlx::query("DELETE FROM snapshots WHERE session_id = ? AND created_at < ?")
            .bind(session_id)
            .bind(cutoff.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::SessionConfig;
    use crate::plan::PlanItem;
    use crate::snapshot::{SnapshotState, SnapshotTrigger};

    #[tokio::test]
    async fn test_sqlite_round_trip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hive.db");

        let list = TodoList::from_plan("s1", "goal", "m1", vec![PlanItem::new("a", "x")], vec![]);
        let mut session = SessionRecord::new("s1", SessionConfig::default());
        session.todo_list_id = Some(list.id.clone());

        {
            let store = SqliteStore::new(&path).await.unwrap();
            store.save_session(&session).await.unwrap();
            store.save_todo_list(&list).await.unwrap();
            let snapshot = Snapshot {
                id: "snap_1".to_string(),
                session_id: "s1".to_string(),
                trigger: SnapshotTrigger::Manual,
                label: None,
                state: SnapshotState {
                    session: session.clone(),
                    todo_list: Some(list.clone()),
                },
                created_at: Utc::now(),
            };
            store.insert_snapshot(&snapshot).await.unwrap();
        }

        let store = SqliteStore::new(&path).await.unwrap();
        assert_eq!(store.load_session("s1").await.unwrap(), Some(session));
        assert_eq!(store.load_todo_list(&list.id).await.unwrap(), Some(list));
        let found = store
            .query_snapshots(&SnapshotFilter::for_session("s1"))
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(store.delete_snapshot("snap_1").await.unwrap());
        assert!(!store.delete_snapshot("snap_1").await.unwrap());
    }
}
