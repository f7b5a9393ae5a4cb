//! Agent action log on the blackboard.

use super::{now_ms, Database};
use crate::types::ActionLog;
use anyhow::Result;
use rusqlite::{params, Row};

fn parse_action_row(row: &Row) -> rusqlite::Result<ActionLog> {
    Ok(ActionLog {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        agent_name: row.get("agent_name")?,
        action: row.get("action")?,
        thought: row.get("thought")?,
        observation: row.get("observation")?,
        created_at: row.get("created_at")?,
    })
}

impl Database {
    pub fn log_action(
        &self,
        task_id: i64,
        agent_name: &str,
        action: &str,
        thought: &str,
        observation: Option<&str>,
    ) -> Result<i64> {
        let now = now_ms();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO action_logs (task_id, agent_name, action, thought, observation, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![task_id, agent_name, action, thought, observation, now],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    /// Action logs for every task in a pipeline, in insertion order.
    pub fn get_actions_for_pipeline(&self, pipeline_id: i64) -> Result<Vec<ActionLog>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT l.* FROM action_logs l
                 JOIN tasks t ON t.id = l.task_id
                 WHERE t.pipeline_id = ?1
                 ORDER BY l.id",
            )?;
            let logs = stmt
                .query_map(params![pipeline_id], parse_action_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(logs)
        })
    }

    pub fn get_actions_for_task(&self, task_id: i64) -> Result<Vec<ActionLog>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM action_logs WHERE task_id = ?1 ORDER BY id")?;
            let logs = stmt
                .query_map(params![task_id], parse_action_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(logs)
        })
    }
}
