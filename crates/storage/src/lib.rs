use std::{fs, path::Path, str::FromStr};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    Pool, Row, Sqlite,
};

use shared::domain::{search_projection, Record, RecordId};

/// Authoritative store for the watched collection. Every query is answered
/// from the database; the event channel never feeds back into it.
#[derive(Clone)]
pub struct Storage {
    pool: Pool<Sqlite>,
}

impl Storage {
    pub async fn new(database_url: &str) -> Result<Self> {
        ensure_sqlite_parent_dir_exists(database_url)?;

        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(connect_options)
            .await?;
        let storage = Self { pool };
        storage.ensure_records_table().await?;
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

    async fn ensure_records_table(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS records (
                id          INTEGER PRIMARY KEY AUTOINCREMENT,
                fields      TEXT NOT NULL,
                search_text TEXT NOT NULL,
                updated_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure records table exists")?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_records_recency ON records (updated_at DESC, id DESC)",
        )
        .execute(&self.pool)
        .await
        .context("failed to ensure records recency index exists")?;

        Ok(())
    }

    pub async fn create_record(&self, fields: Map<String, Value>) -> Result<Record> {
        let updated_at = Utc::now();
        let encoded = serde_json::to_string(&fields).context("failed to encode record fields")?;
        let rec = sqlx::query(
            "INSERT INTO records (fields, search_text, updated_at) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(&encoded)
        .bind(search_projection(&fields))
        .bind(updated_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(Record {
            id: RecordId(rec.get::<i64, _>(0)),
            fields,
            updated_at,
        })
    }

    /// Replaces the field set wholesale and advances `updated_at`. Returns
    /// `None` when no record with that id exists.
    pub async fn update_record(
        &self,
        id: RecordId,
        fields: Map<String, Value>,
    ) -> Result<Option<Record>> {
        let updated_at = Utc::now();
        let encoded = serde_json::to_string(&fields).context("failed to encode record fields")?;
        let result = sqlx::query(
            "UPDATE records SET fields = ?, search_text = ?, updated_at = ? WHERE id = ?",
        )
        .bind(&encoded)
        .bind(search_projection(&fields))
        .bind(updated_at)
        .bind(id.0)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(None);
        }

        Ok(Some(Record {
            id,
            fields,
            updated_at,
        }))
    }

    pub async fn delete_record(&self, id: RecordId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM records WHERE id = ?")
            .bind(id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes every listed id in one transaction and reports the subset that
    /// actually existed. Ids that were already gone are silently skipped.
    pub async fn delete_records(&self, ids: &[RecordId]) -> Result<Vec<RecordId>> {
        let mut tx = self.pool.begin().await?;
        let mut deleted = Vec::new();
        for id in ids {
            let result = sqlx::query("DELETE FROM records WHERE id = ?")
                .bind(id.0)
                .execute(&mut *tx)
                .await?;
            if result.rows_affected() > 0 {
                deleted.push(*id);
            }
        }
        tx.commit().await?;
        Ok(deleted)
    }

    pub async fn get_record(&self, id: RecordId) -> Result<Option<Record>> {
        let row = sqlx::query("SELECT fields, updated_at FROM records WHERE id = ?")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| decode_record(id, &row)).transpose()
    }

    /// Answers `(page, limit, search)` with one page of records plus the
    /// total match count. `page` is 1-based. Ordering is newest first, ties
    /// broken by descending id, so freshly created records surface on page 1.
    pub async fn query_page(
        &self,
        page: u32,
        limit: u32,
        search: Option<&str>,
    ) -> Result<(Vec<Record>, u64)> {
        anyhow::ensure!(page >= 1, "page must be >= 1");
        anyhow::ensure!(limit >= 1, "limit must be >= 1");

        let needle = search
            .map(str::trim)
            .filter(|needle| !needle.is_empty())
            .map(|needle| escape_like(&needle.to_lowercase()));

        let total: i64 = match &needle {
            Some(needle) => {
                sqlx::query_scalar(
                    r"SELECT COUNT(*) FROM records WHERE search_text LIKE '%' || ? || '%' ESCAPE '\'",
                )
                .bind(needle)
                .fetch_one(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM records")
                    .fetch_one(&self.pool)
                    .await?
            }
        };

        let offset = i64::from(page - 1) * i64::from(limit);
        let rows = match &needle {
            Some(needle) => {
                sqlx::query(
                    r"SELECT id, fields, updated_at FROM records
                      WHERE search_text LIKE '%' || ? || '%' ESCAPE '\'
                      ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(needle)
                .bind(i64::from(limit))
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT id, fields, updated_at FROM records
                     ORDER BY updated_at DESC, id DESC LIMIT ? OFFSET ?",
                )
                .bind(i64::from(limit))
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let id = RecordId(row.get::<i64, _>("id"));
            items.push(decode_record(id, &row)?);
        }

        Ok((items, total.max(0) as u64))
    }
}

fn decode_record(id: RecordId, row: &sqlx::sqlite::SqliteRow) -> Result<Record> {
    let encoded: String = row.get("fields");
    let fields: Map<String, Value> = serde_json::from_str(&encoded)
        .with_context(|| format!("record {} holds malformed fields", id.0))?;
    let updated_at: DateTime<Utc> = row.get("updated_at");
    Ok(Record {
        id,
        fields,
        updated_at,
    })
}

fn escape_like(needle: &str) -> String {
    needle
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn ensure_sqlite_parent_dir_exists(database_url: &str) -> Result<()> {
    if database_url == "sqlite::memory:" || !database_url.starts_with("sqlite:") {
        return Ok(());
    }

    let path = database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if path.is_empty() {
        return Ok(());
    }

    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).with_context(|| {
                format!(
                    "failed to create parent directory '{}' for database url '{database_url}'",
                    parent.display()
                )
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
