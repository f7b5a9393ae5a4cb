//! Append-only task artifacts.

use super::{json_column, now_ms, Database};
use crate::types::Artifact;
use anyhow::Result;
use rusqlite::{params, Row};
use serde_json::Value;

fn parse_artifact_row(row: &Row) -> rusqlite::Result<Artifact> {
    let metadata: Option<String> = row.get("metadata")?;
    Ok(Artifact {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        artifact_type: row.get("artifact_type")?,
        name: row.get("name")?,
        content: row.get("content")?,
        created_by: row.get("created_by")?,
        metadata: json_column::<Value>(metadata),
        created_at: row.get("created_at")?,
    })
}

impl Database {
    /// Attach a new artifact to a task. Artifacts are never updated in place.
    pub fn add_artifact(
        &self,
        task_id: i64,
        artifact_type: &str,
        name: &str,
        content: &str,
        created_by: &str,
        metadata: Option<Value>,
    ) -> Result<Artifact> {
        let now = now_ms();
        let metadata = metadata.unwrap_or_else(|| Value::Object(Default::default()));
        let metadata_json = serde_json::to_string(&metadata)?;

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO artifacts (task_id, artifact_type, name, content, created_by, metadata, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![task_id, artifact_type, name, content, created_by, metadata_json, now],
            )?;
            Ok(Artifact {
                id: conn.last_insert_rowid(),
                task_id,
                artifact_type: artifact_type.to_string(),
                name: name.to_string(),
                content: content.to_string(),
                created_by: created_by.to_string(),
                metadata,
                created_at: now,
            })
        })
    }

    pub fn get_artifacts_for_task(&self, task_id: i64) -> Result<Vec<Artifact>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM artifacts WHERE task_id = ?1 ORDER BY id",
            )?;
            let artifacts = stmt
                .query_map(params![task_id], parse_artifact_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(artifacts)
        })
    }

    /// All artifacts produced by tasks belonging to a pipeline, oldest first.
    pub fn get_artifacts_for_pipeline(&self, pipeline_id: i64) -> Result<Vec<Artifact>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT a.* FROM artifacts a
                 JOIN tasks t ON t.id = a.task_id
                 WHERE t.pipeline_id = ?1
                 ORDER BY a.id",
            )?;
            let artifacts = stmt
                .query_map(params![pipeline_id], parse_artifact_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(artifacts)
        })
    }

    /// Most recent artifact of a type within a pipeline.
    pub fn latest_pipeline_artifact(
        &self,
        pipeline_id: i64,
        artifact_type: &str,
    ) -> Result<Option<Artifact>> {
        Ok(self
            .get_artifacts_for_pipeline(pipeline_id)?
            .into_iter()
            .rev()
            .find(|a| a.artifact_type == artifact_type))
    }
}
