//! Blackboard task operations: creation, atomic claim, completion, and the dependency DAG.

use super::{json_column, now_ms, Database};
use crate::types::{NewTask, Task, TaskContext, TaskStatus};
use anyhow::{anyhow, bail, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use std::collections::HashSet;

const TASK_COLUMNS: &str = "id, title, description, status, assigned_agent, context, pipeline_id,
     result, error, created_at, updated_at, claimed_at, completed_at";

/// Predicate true when every dependency of `tasks.id` is completed.
const DEPS_SATISFIED: &str = "NOT EXISTS (
        SELECT 1 FROM task_dependencies d
        JOIN tasks dep ON dep.id = d.depends_on_id
        WHERE d.task_id = tasks.id AND dep.status != 'completed'
    )";

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let context: Option<String> = row.get("context")?;
    let result: Option<String> = row.get("result")?;

    Ok(Task {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        status: TaskStatus::from_str(&status).unwrap_or(TaskStatus::Pending),
        assigned_agent: row.get("assigned_agent")?,
        context: json_column::<TaskContext>(context),
        depends_on: Vec::new(),
        pipeline_id: row.get("pipeline_id")?,
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        error: row.get("error")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
        claimed_at: row.get("claimed_at")?,
        completed_at: row.get("completed_at")?,
    })
}

fn load_dependencies(conn: &Connection, task_id: i64) -> Result<Vec<i64>> {
    let mut stmt = conn.prepare(
        "SELECT depends_on_id FROM task_dependencies WHERE task_id = ?1 ORDER BY depends_on_id",
    )?;
    let deps = stmt
        .query_map(params![task_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(deps)
}

/// Internal helper to get a task using an existing connection (avoids deadlock).
fn get_task_internal(conn: &Connection, task_id: i64) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
            params![task_id],
            parse_task_row,
        )
        .optional()?;

    match task {
        Some(mut task) => {
            task.depends_on = load_dependencies(conn, task.id)?;
            Ok(Some(task))
        }
        None => Ok(None),
    }
}

fn query_tasks(conn: &Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Task>> {
    let mut stmt = conn.prepare(sql)?;
    let mut tasks = stmt
        .query_map(args, parse_task_row)?
        .collect::<rusqlite::Result<Vec<Task>>>()?;
    for task in &mut tasks {
        task.depends_on = load_dependencies(conn, task.id)?;
    }
    Ok(tasks)
}

impl Database {
    /// Create a pending task, optionally depending on existing tasks.
    pub fn create_task(&self, input: NewTask) -> Result<Task> {
        let now = now_ms();
        let context_json = serde_json::to_string(&input.context)?;
        let pipeline_id = input.context.pipeline_id;

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            for dep in &input.depends_on {
                let exists: bool = tx.query_row(
                    "SELECT EXISTS(SELECT 1 FROM tasks WHERE id = ?1)",
                    params![dep],
                    |row| row.get(0),
                )?;
                if !exists {
                    bail!("Dependency task not found: {}", dep);
                }
            }

            tx.execute(
                "INSERT INTO tasks (
                    title, description, status, assigned_agent, context, pipeline_id,
                    created_at, updated_at
                ) VALUES (?1, ?2, 'pending', ?3, ?4, ?5, ?6, ?6)",
                params![
                    input.title,
                    input.description,
                    input.assigned_agent,
                    context_json,
                    pipeline_id,
                    now
                ],
            )?;
            let id = tx.last_insert_rowid();

            for dep in &input.depends_on {
                tx.execute(
                    "INSERT OR IGNORE INTO task_dependencies (task_id, depends_on_id) VALUES (?1, ?2)",
                    params![id, dep],
                )?;
            }

            let task = get_task_internal(&tx, id)?
                .ok_or_else(|| anyhow!("Task {} vanished after insert", id))?;
            tx.commit()?;
            Ok(task)
        })
    }

    pub fn get_task(&self, task_id: i64) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// Atomically move a task from pending to claimed by `agent`.
    ///
    /// This is a single conditional UPDATE: it succeeds only if the task is
    /// still pending, unassigned or assigned to this agent, and every
    /// dependency is completed. Returns false otherwise.
    pub fn claim_task(&self, task_id: i64, agent: &str) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| {
            let changed = conn.execute(
                &format!(
                    "UPDATE tasks
                     SET status = 'claimed', assigned_agent = ?2, claimed_at = ?3, updated_at = ?3
                     WHERE id = ?1
                       AND status = 'pending'
                       AND (assigned_agent IS NULL OR assigned_agent = ?2)
                       AND {DEPS_SATISFIED}"
                ),
                params![task_id, agent, now],
            )?;
            Ok(changed == 1)
        })
    }

    /// Mark a claimed task as running.
    pub fn start_task(&self, task_id: i64, agent: &str) -> Result<bool> {
        let now = now_ms();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks SET status = 'running', updated_at = ?3
                 WHERE id = ?1 AND assigned_agent = ?2 AND status = 'claimed'",
                params![task_id, agent, now],
            )?;
            Ok(changed == 1)
        })
    }

    /// Complete a task owned by `agent`.
    pub fn complete_task(&self, task_id: i64, agent: &str, result: Option<&Value>) -> Result<Task> {
        let now = now_ms();
        let result_json = result.map(serde_json::to_string).transpose()?;

        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks
                 SET status = 'completed', result = ?3, completed_at = ?4, updated_at = ?4
                 WHERE id = ?1 AND assigned_agent = ?2 AND status IN ('claimed', 'running')",
                params![task_id, agent, result_json, now],
            )?;
            if changed == 0 {
                bail!("Task {} is not owned by {}", task_id, agent);
            }
            get_task_internal(conn, task_id)?.ok_or_else(|| anyhow!("Task not found"))
        })
    }

    /// Fail a task owned by `agent`, recording the reason.
    pub fn fail_task(&self, task_id: i64, agent: &str, reason: &str) -> Result<Task> {
        let now = now_ms();
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE tasks
                 SET status = 'failed', error = ?3, completed_at = ?4, updated_at = ?4
                 WHERE id = ?1 AND assigned_agent = ?2 AND status IN ('claimed', 'running')",
                params![task_id, agent, reason, now],
            )?;
            if changed == 0 {
                bail!("Task {} is not owned by {}", task_id, agent);
            }
            get_task_internal(conn, task_id)?.ok_or_else(|| anyhow!("Task not found"))
        })
    }

    /// Pending tasks this agent could claim: unassigned or assigned to it,
    /// with every dependency completed. Oldest first.
    pub fn get_pending_tasks_for_agent(&self, agent: &str) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            query_tasks(
                conn,
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = 'pending'
                       AND (assigned_agent IS NULL OR assigned_agent = ?1)
                       AND {DEPS_SATISFIED}
                     ORDER BY id"
                ),
                params![agent],
            )
        })
    }

    /// Walk the dependency chain of `task_id` back to its root task.
    ///
    /// At each step the lowest-id dependency is followed.
    pub fn get_main_task(&self, task_id: i64) -> Result<Option<Task>> {
        self.with_conn(|conn| {
            let mut current = match get_task_internal(conn, task_id)? {
                Some(task) => task,
                None => return Ok(None),
            };
            let mut visited = HashSet::new();
            visited.insert(current.id);

            while let Some(&parent_id) = current.depends_on.first() {
                if !visited.insert(parent_id) {
                    break;
                }
                match get_task_internal(conn, parent_id)? {
                    Some(parent) => current = parent,
                    None => break,
                }
            }
            Ok(Some(current))
        })
    }

    pub fn list_tasks_for_pipeline(&self, pipeline_id: i64) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            query_tasks(
                conn,
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE pipeline_id = ?1 ORDER BY id"),
                params![pipeline_id],
            )
        })
    }

    /// Whether any task of the pipeline is still pending or held by an agent.
    pub fn pipeline_has_open_tasks(&self, pipeline_id: i64) -> Result<bool> {
        self.with_conn(|conn| {
            let open: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM tasks
                 WHERE pipeline_id = ?1 AND status IN ('pending', 'claimed', 'running'))",
                params![pipeline_id],
                |row| row.get(0),
            )?;
            Ok(open)
        })
    }
}
