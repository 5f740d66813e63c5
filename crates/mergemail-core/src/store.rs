use std::collections::HashSet;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions};

use crate::{HistoryEntry, RecoveryCheckpoint, Result, SendFlags, Template, normalize_address};

#[async_trait]
pub trait MergeStore: Send + Sync {
    async fn load_global_history(&self) -> Result<HashSet<String>>;
    /// Insert-if-absent; the first timestamp for an address wins.
    async fn record_sent(&self, address: &str) -> Result<()>;
    async fn load_checkpoint(&self) -> Result<Option<RecoveryCheckpoint>>;
    async fn save_checkpoint(&self, checkpoint: &RecoveryCheckpoint) -> Result<()>;
    async fn clear_checkpoint(&self) -> Result<()>;
    /// Newest first.
    async fn list_history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>>;
    async fn clear_all_history(&self) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteMergeStore {
    pool: SqlitePool,
}

impl SqliteMergeStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn history_len(&self) -> Result<i64> {
        let row = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM sent_emails")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn paths_to_json(paths: &[PathBuf]) -> Result<String> {
    let list: Vec<String> = paths
        .iter()
        .map(|p| p.to_string_lossy().to_string())
        .collect();
    Ok(serde_json::to_string(&list)?)
}

fn paths_from_json(raw: &str) -> Vec<PathBuf> {
    serde_json::from_str::<Vec<String>>(raw)
        .unwrap_or_default()
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

type CheckpointRow = (
    String,
    i64,
    String,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
);

#[async_trait]
impl MergeStore for SqliteMergeStore {
    async fn load_global_history(&self) -> Result<HashSet<String>> {
        let rows = sqlx::query_as::<_, (String,)>("SELECT email FROM sent_emails")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| normalize_address(&row.0))
            .collect())
    }

    async fn record_sent(&self, address: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO sent_emails (email, sent_at) VALUES (?, ?)
             ON CONFLICT(email) DO NOTHING",
        )
        .bind(normalize_address(address))
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn load_checkpoint(&self) -> Result<Option<RecoveryCheckpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>(
            "SELECT file_path, current_index, subject, body, inline_images, attachments,
                    skip_duplicates_in_file, respect_global_history, mark_status, use_row_content
             FROM recovery_state WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|row| RecoveryCheckpoint {
            source_path: PathBuf::from(row.0),
            next_row_index: row.1.max(0) as usize,
            template: Template {
                subject: row.2,
                body: row.3,
                use_row_content: row.9 != 0,
            },
            inline_images: paths_from_json(&row.4),
            attachments: paths_from_json(&row.5),
            flags: SendFlags {
                skip_duplicates_in_file: row.6 != 0,
                respect_global_history: row.7 != 0,
                mark_status: row.8 != 0,
            },
        }))
    }

    async fn save_checkpoint(&self, checkpoint: &RecoveryCheckpoint) -> Result<()> {
        let inline_images = paths_to_json(&checkpoint.inline_images)?;
        let attachments = paths_to_json(&checkpoint.attachments)?;
        sqlx::query(
            "INSERT INTO recovery_state (id, file_path, current_index, subject, body, inline_images, attachments,
                                         skip_duplicates_in_file, respect_global_history, mark_status, use_row_content, updated_at)
             VALUES (1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                file_path = excluded.file_path,
                current_index = excluded.current_index,
                subject = excluded.subject,
                body = excluded.body,
                inline_images = excluded.inline_images,
                attachments = excluded.attachments,
                skip_duplicates_in_file = excluded.skip_duplicates_in_file,
                respect_global_history = excluded.respect_global_history,
                mark_status = excluded.mark_status,
                use_row_content = excluded.use_row_content,
                updated_at = excluded.updated_at",
        )
        .bind(checkpoint.source_path.to_string_lossy().to_string())
        .bind(checkpoint.next_row_index as i64)
        .bind(&checkpoint.template.subject)
        .bind(&checkpoint.template.body)
        .bind(inline_images)
        .bind(attachments)
        .bind(if checkpoint.flags.skip_duplicates_in_file { 1 } else { 0 })
        .bind(if checkpoint.flags.respect_global_history { 1 } else { 0 })
        .bind(if checkpoint.flags.mark_status { 1 } else { 0 })
        .bind(if checkpoint.template.use_row_content { 1 } else { 0 })
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_checkpoint(&self) -> Result<()> {
        sqlx::query("DELETE FROM recovery_state WHERE id = 1")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_history(&self, limit: Option<usize>) -> Result<Vec<HistoryEntry>> {
        let limit = limit.map(|v| v as i64).unwrap_or(-1);
        let rows = sqlx::query_as::<_, (String, String)>(
            "SELECT email, sent_at FROM sent_emails ORDER BY sent_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| HistoryEntry {
                email: row.0,
                sent_at: row.1,
            })
            .collect())
    }

    async fn clear_all_history(&self) -> Result<()> {
        sqlx::query("DELETE FROM sent_emails")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
