//! Persisted tool registry backing RBAC checks.

use super::Database;
use crate::types::ToolRegistryEntry;
use anyhow::Result;
use rusqlite::{params, OptionalExtension, Row};

fn parse_registry_row(row: &Row) -> rusqlite::Result<ToolRegistryEntry> {
    let allowed: Option<String> = row.get("allowed_agents")?;
    Ok(ToolRegistryEntry {
        name: row.get("name")?,
        category: row.get("category")?,
        read_only: row.get("read_only")?,
        description: row.get("description")?,
        allowed_agents: allowed.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

impl Database {
    /// Insert or refresh a tool's metadata. The allowed-agent list is left
    /// untouched for existing rows.
    pub fn upsert_tool(
        &self,
        name: &str,
        category: &str,
        read_only: bool,
        description: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_registry (name, category, read_only, description)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    category = excluded.category,
                    read_only = excluded.read_only,
                    description = excluded.description",
                params![name, category, read_only, description],
            )?;
            Ok(())
        })
    }

    /// Replace the allowed-agent list of a tool. `None` lifts the restriction.
    pub fn set_tool_allowed_agents(&self, name: &str, agents: Option<&[String]>) -> Result<()> {
        let json = agents.map(serde_json::to_string).transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO tool_registry (name, allowed_agents) VALUES (?1, ?2)
                 ON CONFLICT(name) DO UPDATE SET allowed_agents = excluded.allowed_agents",
                params![name, json],
            )?;
            Ok(())
        })
    }

    pub fn get_tool_entry(&self, name: &str) -> Result<Option<ToolRegistryEntry>> {
        self.with_conn(|conn| {
            let entry = conn
                .query_row(
                    "SELECT * FROM tool_registry WHERE name = ?1",
                    params![name],
                    parse_registry_row,
                )
                .optional()?;
            Ok(entry)
        })
    }

    pub fn list_tool_entries(&self) -> Result<Vec<ToolRegistryEntry>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tool_registry ORDER BY name")?;
            let rows = stmt
                .query_map([], parse_registry_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }
}
