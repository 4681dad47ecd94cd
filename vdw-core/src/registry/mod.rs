//! The MCP Box: a persistent catalog of capability-providing tools.
//!
//! [`ToolRegistry`] is an explicit handle passed to whoever needs it. Every
//! mutating call runs in one database transaction and validates its input
//! (capability references, weight ranges, dependency targets, acyclicity of
//! `requires`) before the first write, so a rejected call leaves no trace.

mod graph;
mod ranking;
mod usage;
mod vulnerability;

use std::collections::BTreeSet;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;
use uuid::Uuid;

use crate::db::{self, Database};
use crate::error::{Result, VdwError};
use crate::metrics::VdwMetrics;
use crate::models::*;

pub use ranking::{GapReport, RankedTool, ToolQuery};

/// Tuning knobs shared by ranking and gap analysis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegistryPolicy {
    /// Tools with an open vulnerability at or above this severity are ineligible.
    pub vulnerability_threshold: Severity,
    /// Best eligible strength below this marks a capability as weak in gap reports.
    pub weak_strength: f64,
}

impl Default for RegistryPolicy {
    fn default() -> Self {
        Self {
            vulnerability_threshold: Severity::High,
            weak_strength: 0.7,
        }
    }
}

#[derive(Clone)]
pub struct ToolRegistry {
    db: Database,
    policy: RegistryPolicy,
    metrics: Option<VdwMetrics>,
}

pub(crate) const TOOL_COLUMNS: &str = "tool_id, name, description, version, location, input_schema, \
     output_schema, created_by, created_at, last_used, usage_count, success_rate, average_duration, \
     deprecated, deprecation_reason, replacement_tool_id, metadata";

impl ToolRegistry {
    pub fn new(db: Database) -> Self {
        Self::with_policy(db, RegistryPolicy::default())
    }

    pub fn with_policy(db: Database, policy: RegistryPolicy) -> Self {
        Self {
            db,
            policy,
            metrics: None,
        }
    }

    /// Counts tool outcomes from [`ToolRegistry::record_usage`] into `metrics`.
    pub fn with_metrics(mut self, metrics: VdwMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn policy(&self) -> RegistryPolicy {
        self.policy
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn create_capability(&self, input: CreateCapabilityInput) -> Result<Capability> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(VdwError::Validation("capability name must not be empty".into()));
        }

        let capability = Capability {
            capability_id: Uuid::new_v4().to_string(),
            name,
            description: input.description,
            category: input.category,
            created_at: Utc::now(),
        };

        self.db.with_transaction(|tx| {
            if find_capability(tx, &capability.name)?.is_some() {
                return Err(VdwError::Validation(format!(
                    "capability '{}' already exists",
                    capability.name
                )));
            }
            tx.execute(
                "INSERT INTO capabilities (capability_id, name, description, category, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    capability.capability_id,
                    capability.name,
                    capability.description,
                    capability.category,
                    capability.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        info!(capability = %capability.name, "created capability");
        Ok(capability)
    }

    /// Returns the named capability, creating it on first use.
    pub fn ensure_capability(&self, input: CreateCapabilityInput) -> Result<Capability> {
        if let Some(existing) = self.get_capability(input.name.trim())? {
            return Ok(existing);
        }
        self.create_capability(input)
    }

    pub fn get_capability(&self, name: &str) -> Result<Option<Capability>> {
        self.db.with_connection(|conn| find_capability(conn, name))
    }

    pub fn list_capabilities(&self) -> Result<Vec<Capability>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT capability_id, name, description, category, created_at FROM capabilities ORDER BY name",
            )?;
            let rows = stmt.query_map([], capability_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Registers a tool together with the capabilities it offers and its outgoing
    /// dependency edges. Either everything is written or nothing is.
    pub fn register(
        &self,
        input: CreateToolInput,
        capabilities: &[CapabilityEdgeInput],
        dependencies: &[DependencyEdgeInput],
    ) -> Result<Tool> {
        let tool_id = input
            .tool_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        validate_registration(&tool_id, &input, capabilities, dependencies)?;

        let now = Utc::now();
        let metadata = input.metadata.clone().unwrap_or_else(|| serde_json::json!({}));

        self.db.with_transaction(|tx| {
            if tool_exists(tx, &tool_id)? {
                return Err(VdwError::Validation(format!("tool {tool_id} is already registered")));
            }

            let mut capability_ids = Vec::with_capacity(capabilities.len());
            for edge in capabilities {
                let capability = find_capability(tx, &edge.capability)?
                    .ok_or_else(|| VdwError::not_found("capability", edge.capability.clone()))?;
                capability_ids.push(capability.capability_id);
            }

            for edge in dependencies {
                if !tool_exists(tx, &edge.tool_id)? {
                    return Err(VdwError::not_found("tool", edge.tool_id.clone()));
                }
            }

            tx.execute(
                &format!("INSERT INTO tools ({TOOL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, 0, 1.0, 0.0, 0, NULL, NULL, ?10)"),
                params![
                    tool_id,
                    input.name,
                    input.description,
                    input.version,
                    input.location,
                    input.input_schema.as_ref().map(|v| v.to_string()),
                    input.output_schema.as_ref().map(|v| v.to_string()),
                    input.created_by,
                    now.to_rfc3339(),
                    metadata.to_string(),
                ],
            )?;

            for (edge, capability_id) in capabilities.iter().zip(&capability_ids) {
                tx.execute(
                    "INSERT INTO tool_capabilities (tool_id, capability_id, strength, confidence, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![tool_id, capability_id, edge.strength, edge.confidence, now.to_rfc3339()],
                )?;
            }

            for edge in dependencies {
                graph::insert_edge(tx, &tool_id, &edge.tool_id, edge.kind)?;
            }

            Ok(())
        })?;

        info!(
            tool_id = %tool_id,
            name = %input.name,
            capabilities = capabilities.len(),
            dependencies = dependencies.len(),
            "registered tool"
        );
        self.get_tool(&tool_id)?
            .ok_or_else(|| VdwError::not_found("tool", tool_id))
    }

    pub fn get_tool(&self, tool_id: &str) -> Result<Option<Tool>> {
        self.db.with_connection(|conn| load_tool(conn, tool_id))
    }

    pub fn require_tool(&self, tool_id: &str) -> Result<Tool> {
        self.get_tool(tool_id)?
            .ok_or_else(|| VdwError::not_found("tool", tool_id))
    }

    pub fn list_tools(&self, filter: &ToolFilter) -> Result<Vec<Tool>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TOOL_COLUMNS} FROM tools
                 WHERE (?1 OR deprecated = 0) AND (?2 IS NULL OR created_by = ?2)
                 ORDER BY created_at DESC, tool_id"
            ))?;
            let rows = stmt.query_map(
                params![filter.include_deprecated, filter.created_by],
                tool_from_row,
            )?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Capability edges of one tool, ordered by capability name.
    pub fn capabilities_of(&self, tool_id: &str) -> Result<Vec<ToolCapability>> {
        self.db.with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT tc.tool_id, tc.capability_id, c.name, tc.strength, tc.confidence
                 FROM tool_capabilities tc
                 JOIN capabilities c ON c.capability_id = tc.capability_id
                 WHERE tc.tool_id = ?1
                 ORDER BY c.name",
            )?;
            let rows = stmt.query_map([tool_id], |row| {
                Ok(ToolCapability {
                    tool_id: row.get(0)?,
                    capability_id: row.get(1)?,
                    capability_name: row.get(2)?,
                    strength: row.get(3)?,
                    confidence: row.get(4)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

fn validate_registration(
    tool_id: &str,
    input: &CreateToolInput,
    capabilities: &[CapabilityEdgeInput],
    dependencies: &[DependencyEdgeInput],
) -> Result<()> {
    if tool_id.trim().is_empty() {
        return Err(VdwError::Validation("tool id must not be empty".into()));
    }
    if input.name.trim().is_empty() {
        return Err(VdwError::Validation("tool name must not be empty".into()));
    }

    let mut seen = BTreeSet::new();
    for edge in capabilities {
        check_weight("strength", &edge.capability, edge.strength)?;
        check_weight("confidence", &edge.capability, edge.confidence)?;
        if !seen.insert(edge.capability.as_str()) {
            return Err(VdwError::Validation(format!(
                "capability '{}' listed twice",
                edge.capability
            )));
        }
    }

    let mut targets = BTreeSet::new();
    for edge in dependencies {
        if edge.tool_id == tool_id {
            return Err(VdwError::Cycle(format!("tool {tool_id} cannot depend on itself")));
        }
        if !targets.insert(edge.tool_id.as_str()) {
            return Err(VdwError::Validation(format!(
                "dependency on {} listed twice",
                edge.tool_id
            )));
        }
    }
    Ok(())
}

fn check_weight(field: &str, capability: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(VdwError::Validation(format!(
            "{field} {value} for capability '{capability}' is outside [0, 1]"
        )))
    }
}

pub(crate) fn tool_exists(conn: &Connection, tool_id: &str) -> Result<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM tools WHERE tool_id = ?1", [tool_id], |_| Ok(()))
        .optional()?
        .is_some())
}

pub(crate) fn edge_exists(conn: &Connection, from: &str, to: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM dependencies WHERE dependent_tool_id = ?1 AND dependency_tool_id = ?2",
            [from, to],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

pub(crate) fn load_tool(conn: &Connection, tool_id: &str) -> Result<Option<Tool>> {
    Ok(conn
        .query_row(
            &format!("SELECT {TOOL_COLUMNS} FROM tools WHERE tool_id = ?1"),
            [tool_id],
            tool_from_row,
        )
        .optional()?)
}

fn find_capability(conn: &Connection, name: &str) -> Result<Option<Capability>> {
    Ok(conn
        .query_row(
            "SELECT capability_id, name, description, category, created_at FROM capabilities WHERE name = ?1",
            [name],
            capability_from_row,
        )
        .optional()?)
}

fn capability_from_row(row: &Row<'_>) -> rusqlite::Result<Capability> {
    Ok(Capability {
        capability_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        category: row.get(3)?,
        created_at: db::timestamp(row, 4)?,
    })
}

/// Maps a row selected with [`TOOL_COLUMNS`], starting at column 0.
pub(crate) fn tool_from_row(row: &Row<'_>) -> rusqlite::Result<Tool> {
    let usage_count: i64 = row.get(10)?;
    Ok(Tool {
        tool_id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        version: row.get(3)?,
        location: row.get(4)?,
        input_schema: db::json_column(row, 5)?,
        output_schema: db::json_column(row, 6)?,
        created_by: row.get(7)?,
        created_at: db::timestamp(row, 8)?,
        last_used: db::optional_timestamp(row, 9)?,
        usage_count: usage_count.max(0) as u64,
        success_rate: row.get(11)?,
        average_duration: row.get(12)?,
        deprecated: row.get(13)?,
        deprecation_reason: row.get(14)?,
        replacement_tool_id: row.get(15)?,
        metadata: db::json_column(row, 16)?.unwrap_or_else(|| serde_json::json!({})),
    })
}
