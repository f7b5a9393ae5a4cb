//! Staged file changes awaiting review.

use super::{now_ms, Database};
use crate::types::{ProposedChange, StagedAction, StagedChange, StagedStatus};
use anyhow::{bail, Result};
use rusqlite::{params, Row};

fn parse_staged_row(row: &Row) -> rusqlite::Result<StagedChange> {
    let action: String = row.get("action")?;
    let status: String = row.get("status")?;
    Ok(StagedChange {
        id: row.get("id")?,
        pipeline_id: row.get("pipeline_id")?,
        file_path: row.get("file_path")?,
        action: StagedAction::from_str(&action).unwrap_or(StagedAction::Modify),
        original_content: row.get("original_content")?,
        content: row.get("content")?,
        status: StagedStatus::from_str(&status).unwrap_or(StagedStatus::Pending),
        applied_at: row.get("applied_at")?,
        apply_seq: row.get("apply_seq")?,
        rolled_back_at: row.get("rolled_back_at")?,
        created_at: row.get("created_at")?,
    })
}

impl Database {
    pub fn insert_staged_change(
        &self,
        pipeline_id: i64,
        change: &ProposedChange,
    ) -> Result<StagedChange> {
        let now = now_ms();
        let action = change.action;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO staged_changes (
                    pipeline_id, file_path, action, original_content, content, status, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6)",
                params![
                    pipeline_id,
                    change.file_path,
                    action.as_str(),
                    change.original_content,
                    change.content,
                    now
                ],
            )?;
            Ok(StagedChange {
                id: conn.last_insert_rowid(),
                pipeline_id,
                file_path: change.file_path.clone(),
                action,
                original_content: change.original_content.clone(),
                content: change.content.clone(),
                status: StagedStatus::Pending,
                applied_at: None,
                apply_seq: None,
                rolled_back_at: None,
                created_at: now,
            })
        })
    }

    /// Every staged row of a pipeline, in creation order.
    pub fn list_staged_changes(&self, pipeline_id: i64) -> Result<Vec<StagedChange>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM staged_changes WHERE pipeline_id = ?1 ORDER BY id")?;
            let rows = stmt
                .query_map(params![pipeline_id], parse_staged_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn pending_staged_changes(&self, pipeline_id: i64) -> Result<Vec<StagedChange>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM staged_changes
                 WHERE pipeline_id = ?1 AND status = 'pending'
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map(params![pipeline_id], parse_staged_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn count_pending_staged(&self, pipeline_id: i64) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM staged_changes WHERE pipeline_id = ?1 AND status = 'pending'",
                params![pipeline_id],
                |row| row.get(0),
            )?;
            Ok(count)
        })
    }

    /// Mark a pending row applied and give it the next apply sequence number
    /// within its pipeline.
    pub fn mark_staged_applied(&self, change_id: i64) -> Result<i64> {
        let now = now_ms();
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let seq: i64 = tx.query_row(
                "SELECT COALESCE(MAX(apply_seq), 0) + 1 FROM staged_changes
                 WHERE pipeline_id = (SELECT pipeline_id FROM staged_changes WHERE id = ?1)",
                params![change_id],
                |row| row.get(0),
            )?;
            let changed = tx.execute(
                "UPDATE staged_changes SET status = 'applied', applied_at = ?2, apply_seq = ?3
                 WHERE id = ?1 AND status = 'pending'",
                params![change_id, now, seq],
            )?;
            if changed == 0 {
                bail!("Staged change {} is not pending", change_id);
            }
            tx.commit()?;
            Ok(seq)
        })
    }

    /// Reject every pending row of a pipeline; returns the rejected rows.
    pub fn reject_pending_staged(&self, pipeline_id: i64) -> Result<Vec<StagedChange>> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            let pending = {
                let mut stmt = tx.prepare(
                    "SELECT * FROM staged_changes
                     WHERE pipeline_id = ?1 AND status = 'pending'
                     ORDER BY id",
                )?;
                stmt.query_map(params![pipeline_id], parse_staged_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };
            tx.execute(
                "UPDATE staged_changes SET status = 'rejected'
                 WHERE pipeline_id = ?1 AND status = 'pending'",
                params![pipeline_id],
            )?;
            tx.commit()?;
            Ok(pending
                .into_iter()
                .map(|mut row| {
                    row.status = StagedStatus::Rejected;
                    row
                })
                .collect())
        })
    }

    /// Applied rows not yet rolled back, most recently applied first.
    pub fn rollback_candidates(&self, pipeline_id: i64) -> Result<Vec<StagedChange>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM staged_changes
                 WHERE pipeline_id = ?1 AND status = 'applied' AND rolled_back_at IS NULL
                 ORDER BY apply_seq DESC, id DESC",
            )?;
            let rows = stmt
                .query_map(params![pipeline_id], parse_staged_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    pub fn mark_staged_rolled_back(&self, change_id: i64) -> Result<()> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE staged_changes SET rolled_back_at = ?2 WHERE id = ?1",
                params![change_id, now],
            )?;
            Ok(())
        })
    }
}
