use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use super::Database;
use crate::error::{Result, VdwError};
use crate::models::ProjectContext;

impl Database {
    /// Inserts or replaces the stored snapshot of a project.
    pub fn save_project(&self, ctx: &ProjectContext) -> Result<()> {
        let context = serde_json::to_string(ctx)?;
        self.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO projects (project_id, current_phase, initial_vibe, context, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(project_id) DO UPDATE SET
                    current_phase = excluded.current_phase,
                    context = excluded.context,
                    updated_at = excluded.updated_at",
                params![
                    ctx.project_id.to_string(),
                    ctx.current_phase.as_string(),
                    ctx.initial_vibe,
                    context,
                    ctx.created_at.to_rfc3339(),
                    ctx.updated_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_project(&self, project_id: Uuid) -> Result<Option<ProjectContext>> {
        let raw: Option<String> = self.with_connection(|conn| {
            Ok(conn
                .query_row(
                    "SELECT context FROM projects WHERE project_id = ?1",
                    [project_id.to_string()],
                    |row| row.get(0),
                )
                .optional()?)
        })?;
        raw.map(|raw| serde_json::from_str::<ProjectContext>(&raw).map_err(VdwError::from))
            .transpose()
    }

    /// All stored projects, oldest first.
    pub fn list_projects(&self) -> Result<Vec<ProjectContext>> {
        let raw: Vec<String> = self.with_connection(|conn| {
            let mut stmt = conn.prepare("SELECT context FROM projects ORDER BY created_at, project_id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
        })?;
        raw.iter()
            .map(|raw| serde_json::from_str::<ProjectContext>(raw).map_err(VdwError::from))
            .collect()
    }
}
