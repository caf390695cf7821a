use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};
use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use shared::domain::EntityKind;

#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

/// One cached entity as persisted: an opaque JSON body plus the keys needed
/// to find it again.
#[derive(Debug, Clone)]
pub struct StoredEntity {
    pub kind: EntityKind,
    pub key: String,
    /// Grouping key; for messages this is the owning conversation.
    pub scope: String,
    pub body: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let max_connections = if database_url.contains(":memory:") {
            1
        } else {
            5
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_schema().await?;
        Ok(storage)
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub async fn health_check(&self) -> Result<()> {
        let _: i64 = sqlx::query_scalar("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .context("sqlite ping failed")?;
        Ok(())
    }

    async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS mirror_entities (
                kind        TEXT NOT NULL,
                entity_key  TEXT NOT NULL,
                scope_key   TEXT NOT NULL DEFAULT '',
                body        TEXT NOT NULL,
                updated_at  TEXT NOT NULL,
                PRIMARY KEY (kind, entity_key)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure mirror_entities table exists")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS mirror_entities_scope ON mirror_entities (kind, scope_key)",
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure mirror_entities scope index exists")?;

        Ok(())
    }

    pub async fn upsert_entity(
        &self,
        kind: EntityKind,
        key: &str,
        scope: &str,
        body: &serde_json::Value,
    ) -> Result<()> {
        let encoded = serde_json::to_string(body)
            .with_context(|| format!("failed to encode {kind} '{key}'"))?;
        sqlx::query(
            "INSERT INTO mirror_entities (kind, entity_key, scope_key, body, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(kind, entity_key) DO UPDATE SET
                scope_key = excluded.scope_key,
                body = excluded.body,
                updated_at = excluded.updated_at",
        )
        .bind(kind.as_str())
        .bind(key)
        .bind(scope)
        .bind(encoded)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert {kind} '{key}'"))?;
        Ok(())
    }

    /// Returns whether a row was removed.
    pub async fn delete_entity(&self, kind: EntityKind, key: &str) -> Result<bool> {
        let result =
            sqlx::query("DELETE FROM mirror_entities WHERE kind = ?1 AND entity_key = ?2")
                .bind(kind.as_str())
                .bind(key)
                .execute(&self.pool)
                .await
                .with_context(|| format!("failed to delete {kind} '{key}'"))?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_scope(&self, kind: EntityKind, scope: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM mirror_entities WHERE kind = ?1 AND scope_key = ?2")
            .bind(kind.as_str())
            .bind(scope)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete {kind} rows in scope '{scope}'"))?;
        Ok(result.rows_affected())
    }

    pub async fn load_entity(&self, kind: EntityKind, key: &str) -> Result<Option<StoredEntity>> {
        let row = sqlx::query(
            "SELECT entity_key, scope_key, body, updated_at
             FROM mirror_entities WHERE kind = ?1 AND entity_key = ?2",
        )
        .bind(kind.as_str())
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| decode_row(kind, &row)).transpose()
    }

    pub async fn list_entities(&self, kind: EntityKind) -> Result<Vec<StoredEntity>> {
        let rows = sqlx::query(
            "SELECT entity_key, scope_key, body, updated_at
             FROM mirror_entities WHERE kind = ?1 ORDER BY rowid ASC",
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to list {kind} rows"))?;
        rows.iter().map(|row| decode_row(kind, row)).collect()
    }

    pub async fn list_scope(&self, kind: EntityKind, scope: &str) -> Result<Vec<StoredEntity>> {
        let rows = sqlx::query(
            "SELECT entity_key, scope_key, body, updated_at
             FROM mirror_entities WHERE kind = ?1 AND scope_key = ?2 ORDER BY rowid ASC",
        )
        .bind(kind.as_str())
        .bind(scope)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(|row| decode_row(kind, row)).collect()
    }

    pub async fn count_by_kind(&self) -> Result<Vec<(EntityKind, i64)>> {
        let mut counts = Vec::with_capacity(EntityKind::ALL.len());
        for kind in EntityKind::ALL {
            let count: i64 =
                sqlx::query_scalar("SELECT COUNT(*) FROM mirror_entities WHERE kind = ?1")
                    .bind(kind.as_str())
                    .fetch_one(&self.pool)
                    .await?;
            counts.push((kind, count));
        }
        Ok(counts)
    }
}

fn decode_row(kind: EntityKind, row: &sqlx::sqlite::SqliteRow) -> Result<StoredEntity> {
    let key: String = row.try_get("entity_key")?;
    let raw_body: String = row.try_get("body")?;
    let body = serde_json::from_str(&raw_body)
        .with_context(|| format!("corrupt body for {kind} '{key}'"))?;
    Ok(StoredEntity {
        kind,
        scope: row.try_get("scope_key")?,
        updated_at: row.try_get("updated_at")?,
        key,
        body,
    })
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    let Some(path) = sqlite_path(database_url) else {
        return Ok(());
    };

    let Some(parent) = path.parent() else {
        return Ok(());
    };

    fs::create_dir_all(parent).with_context(|| {
        format!(
            "failed to create parent directory '{}' for database url '{database_url}'",
            parent.display()
        )
    })?;

    Ok(())
}

fn sqlite_path(database_url: &str) -> Option<PathBuf> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return None;
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();

    if path.is_empty() {
        return None;
    }

    Some(Path::new(path).to_path_buf())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
