//! Append-only governance audit trail.

use super::{now_ms, Database};
use crate::types::{AuditEntry, AuditRecord};
use anyhow::Result;
use rusqlite::{params, Row};

fn parse_audit_row(row: &Row) -> rusqlite::Result<AuditRecord> {
    let input: Option<String> = row.get("input")?;
    let output: Option<String> = row.get("output")?;
    Ok(AuditRecord {
        id: row.get("id")?,
        agent_name: row.get("agent_name")?,
        action: row.get("action")?,
        target: row.get("target")?,
        decision: row.get("decision")?,
        justification: row.get("justification")?,
        input: input.and_then(|s| serde_json::from_str(&s).ok()),
        output: output.and_then(|s| serde_json::from_str(&s).ok()),
        task_id: row.get("task_id")?,
        pipeline_id: row.get("pipeline_id")?,
        created_at: row.get("created_at")?,
    })
}

impl Database {
    pub fn record_audit(&self, entry: &AuditEntry) -> Result<i64> {
        let now = now_ms();
        let input = entry.input.as_ref().map(serde_json::to_string).transpose()?;
        let output = entry.output.as_ref().map(serde_json::to_string).transpose()?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO audit_records (
                    agent_name, action, target, decision, justification, input, output,
                    task_id, pipeline_id, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    entry.agent_name,
                    entry.action,
                    entry.target,
                    entry.decision,
                    entry.justification,
                    input,
                    output,
                    entry.task_id,
                    entry.pipeline_id,
                    now
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    pub fn list_audit_for_pipeline(&self, pipeline_id: i64) -> Result<Vec<AuditRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM audit_records WHERE pipeline_id = ?1 ORDER BY id")?;
            let rows = stmt
                .query_map(params![pipeline_id], parse_audit_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Audit rows for a given action (tool name), newest last.
    pub fn list_audit_for_action(&self, action: &str) -> Result<Vec<AuditRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM audit_records WHERE action = ?1 ORDER BY id")?;
            let rows = stmt
                .query_map(params![action], parse_audit_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
