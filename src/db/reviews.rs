//! Human review decisions over staged changes.

use super::{json_column, now_ms, Database};
use crate::types::{ReviewAction, ReviewRecord};
use anyhow::Result;
use rusqlite::{params, Row};

fn parse_review_row(row: &Row) -> rusqlite::Result<ReviewRecord> {
    let action: String = row.get("action")?;
    let files: Option<String> = row.get("files")?;
    let errors: Option<String> = row.get("errors")?;
    Ok(ReviewRecord {
        id: row.get("id")?,
        pipeline_id: row.get("pipeline_id")?,
        reviewer: row.get("reviewer")?,
        action: ReviewAction::from_str(&action).unwrap_or(ReviewAction::Approve),
        files: json_column(files),
        errors: json_column(errors),
        created_at: row.get("created_at")?,
    })
}

impl Database {
    pub fn record_review(
        &self,
        pipeline_id: i64,
        reviewer: &str,
        action: ReviewAction,
        files: &[String],
        errors: &[String],
    ) -> Result<ReviewRecord> {
        let now = now_ms();
        let files_json = serde_json::to_string(files)?;
        let errors_json = serde_json::to_string(errors)?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO reviews (pipeline_id, reviewer, action, files, errors, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![pipeline_id, reviewer, action.as_str(), files_json, errors_json, now],
            )?;
            Ok(ReviewRecord {
                id: conn.last_insert_rowid(),
                pipeline_id,
                reviewer: reviewer.to_string(),
                action,
                files: files.to_vec(),
                errors: errors.to_vec(),
                created_at: now,
            })
        })
    }

    pub fn list_reviews(&self, pipeline_id: i64) -> Result<Vec<ReviewRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM reviews WHERE pipeline_id = ?1 ORDER BY id")?;
            let rows = stmt
                .query_map(params![pipeline_id], parse_review_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
