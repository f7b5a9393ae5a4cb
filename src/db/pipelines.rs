//! Pipeline records.

use super::{json_column, now_ms, Database};
use crate::types::{initial_phases, Budget, Phase, PhaseMap, Pipeline, PipelineMode, PipelineStatus};
use anyhow::{anyhow, Result};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::Value;

fn parse_pipeline_row(row: &Row) -> rusqlite::Result<Pipeline> {
    let mode: String = row.get("mode")?;
    let status: String = row.get("status")?;
    let current_phase: Option<String> = row.get("current_phase")?;
    let phases: Option<String> = row.get("phases")?;
    let budget: String = row.get("budget")?;
    let metadata: Option<String> = row.get("metadata")?;

    let budget: Budget = serde_json::from_str(&budget).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    Ok(Pipeline {
        id: row.get("id")?,
        prompt: row.get("prompt")?,
        mode: PipelineMode::from_str(&mode).unwrap_or_default(),
        status: PipelineStatus::from_str(&status).unwrap_or(PipelineStatus::Failed),
        current_phase: current_phase.as_deref().and_then(Phase::from_str),
        phases: json_column::<PhaseMap>(phases),
        budget,
        correlation_id: row.get("correlation_id")?,
        metadata: json_column::<Value>(metadata),
        requested_by: row.get("requested_by")?,
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        completed_at: row.get("completed_at")?,
    })
}

fn get_pipeline_internal(conn: &Connection, pipeline_id: i64) -> Result<Option<Pipeline>> {
    let pipeline = conn
        .query_row(
            "SELECT * FROM pipelines WHERE id = ?1",
            params![pipeline_id],
            parse_pipeline_row,
        )
        .optional()?;
    Ok(pipeline)
}

fn write_pipeline(conn: &Connection, pipeline: &Pipeline) -> Result<()> {
    conn.execute(
        "UPDATE pipelines
         SET mode = ?2, status = ?3, current_phase = ?4, phases = ?5, budget = ?6,
             metadata = ?7, error = ?8, updated_at = ?9, completed_at = ?10
         WHERE id = ?1",
        params![
            pipeline.id,
            pipeline.mode.as_str(),
            pipeline.status.as_str(),
            pipeline.current_phase.map(|p| p.as_str()),
            serde_json::to_string(&pipeline.phases)?,
            serde_json::to_string(&pipeline.budget)?,
            serde_json::to_string(&pipeline.metadata)?,
            pipeline.error,
            pipeline.updated_at,
            pipeline.completed_at,
        ],
    )?;
    Ok(())
}

impl Database {
    /// Insert a queued pipeline with every phase pending.
    pub fn insert_pipeline(
        &self,
        prompt: &str,
        mode: PipelineMode,
        budget: Budget,
        metadata: Value,
        requested_by: &str,
    ) -> Result<Pipeline> {
        let now = now_ms();
        let correlation_id = uuid::Uuid::new_v4().to_string();
        let phases = initial_phases();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO pipelines (
                    prompt, mode, status, phases, budget, correlation_id, metadata,
                    requested_by, created_at, updated_at
                 ) VALUES (?1, ?2, 'queued', ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    prompt,
                    mode.as_str(),
                    serde_json::to_string(&phases)?,
                    serde_json::to_string(&budget)?,
                    correlation_id,
                    serde_json::to_string(&metadata)?,
                    requested_by,
                    now
                ],
            )?;
            let id = conn.last_insert_rowid();
            get_pipeline_internal(conn, id)?
                .ok_or_else(|| anyhow!("Pipeline {} vanished after insert", id))
        })
    }

    pub fn get_pipeline(&self, pipeline_id: i64) -> Result<Option<Pipeline>> {
        self.with_conn(|conn| get_pipeline_internal(conn, pipeline_id))
    }

    /// Most recent pipelines first.
    pub fn list_pipelines(&self, limit: usize) -> Result<Vec<Pipeline>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT * FROM pipelines ORDER BY created_at DESC, id DESC LIMIT ?1")?;
            let pipelines = stmt
                .query_map(params![limit as i64], parse_pipeline_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(pipelines)
        })
    }

    /// Pipelines that have not reached a terminal status, oldest first.
    pub fn list_open_pipelines(&self) -> Result<Vec<Pipeline>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM pipelines WHERE status NOT IN ('completed', 'failed') ORDER BY id",
            )?;
            let pipelines = stmt
                .query_map([], parse_pipeline_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(pipelines)
        })
    }

    /// Read-modify-write a pipeline inside an immediate transaction.
    ///
    /// Returns `None` if the pipeline does not exist. The closure sees the
    /// current row; `updated_at` is refreshed after it runs.
    pub fn update_pipeline<F>(&self, pipeline_id: i64, f: F) -> Result<Option<Pipeline>>
    where
        F: FnOnce(&mut Pipeline) -> Result<()>,
    {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut pipeline = match get_pipeline_internal(&tx, pipeline_id)? {
                Some(p) => p,
                None => return Ok(None),
            };
            f(&mut pipeline)?;
            pipeline.updated_at = now_ms();
            write_pipeline(&tx, &pipeline)?;
            tx.commit()?;
            Ok(Some(pipeline))
        })
    }
}
