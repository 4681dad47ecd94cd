use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{info, warn};
use uuid::Uuid;

use super::{tool_exists, ToolRegistry};
use crate::db;
use crate::error::{Result, VdwError};
use crate::models::{PatchVulnerabilityInput, ReportVulnerabilityInput, Severity, Vulnerability};

const VULNERABILITY_COLUMNS: &str =
    "vulnerability_id, tool_id, severity, description, cve_id, discovered_at, patched_at, patched_in_version";

impl ToolRegistry {
    pub fn report_vulnerability(&self, input: ReportVulnerabilityInput) -> Result<Vulnerability> {
        if input.description.trim().is_empty() {
            return Err(VdwError::Validation("vulnerability description must not be empty".into()));
        }

        let vulnerability = Vulnerability {
            vulnerability_id: Uuid::new_v4().to_string(),
            tool_id: input.tool_id,
            severity: input.severity,
            description: input.description,
            cve_id: input.cve_id,
            discovered_at: Utc::now(),
            patched_at: None,
            patched_in_version: None,
        };

        self.database().with_transaction(|tx| {
            if !tool_exists(tx, &vulnerability.tool_id)? {
                return Err(VdwError::not_found("tool", vulnerability.tool_id.clone()));
            }
            tx.execute(
                &format!("INSERT INTO vulnerabilities ({VULNERABILITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, NULL)"),
                params![
                    vulnerability.vulnerability_id,
                    vulnerability.tool_id,
                    vulnerability.severity.as_str(),
                    vulnerability.description,
                    vulnerability.cve_id,
                    vulnerability.discovered_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })?;

        warn!(
            tool_id = %vulnerability.tool_id,
            severity = vulnerability.severity.as_str(),
            cve = ?vulnerability.cve_id,
            "vulnerability reported"
        );
        Ok(vulnerability)
    }

    pub fn patch_vulnerability(&self, input: PatchVulnerabilityInput) -> Result<Vulnerability> {
        let patched = self.database().with_transaction(|tx| {
            let existing = load_vulnerability(tx, &input.vulnerability_id)?
                .ok_or_else(|| VdwError::not_found("vulnerability", input.vulnerability_id.clone()))?;
            if !existing.is_open() {
                return Err(VdwError::Validation(format!(
                    "vulnerability {} is already patched",
                    existing.vulnerability_id
                )));
            }
            tx.execute(
                "UPDATE vulnerabilities SET patched_at = ?2, patched_in_version = ?3 WHERE vulnerability_id = ?1",
                params![
                    input.vulnerability_id,
                    Utc::now().to_rfc3339(),
                    input.patched_in_version,
                ],
            )?;
            load_vulnerability(tx, &input.vulnerability_id)?
                .ok_or_else(|| VdwError::not_found("vulnerability", input.vulnerability_id.clone()))
        })?;

        info!(
            tool_id = %patched.tool_id,
            vulnerability_id = %patched.vulnerability_id,
            "vulnerability patched"
        );
        Ok(patched)
    }

    /// Every vulnerability ever reported against a tool, newest first.
    pub fn list_vulnerabilities(&self, tool_id: &str) -> Result<Vec<Vulnerability>> {
        self.database().with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {VULNERABILITY_COLUMNS} FROM vulnerabilities WHERE tool_id = ?1
                 ORDER BY discovered_at DESC, vulnerability_id"
            ))?;
            let rows = stmt.query_map([tool_id], vulnerability_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }
}

fn load_vulnerability(conn: &Connection, vulnerability_id: &str) -> Result<Option<Vulnerability>> {
    Ok(conn
        .query_row(
            &format!("SELECT {VULNERABILITY_COLUMNS} FROM vulnerabilities WHERE vulnerability_id = ?1"),
            [vulnerability_id],
            vulnerability_from_row,
        )
        .optional()?)
}

fn vulnerability_from_row(row: &Row<'_>) -> rusqlite::Result<Vulnerability> {
    let raw: String = row.get(2)?;
    let severity = Severity::from_str(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            2,
            rusqlite::types::Type::Text,
            format!("unknown severity '{raw}'").into(),
        )
    })?;
    Ok(Vulnerability {
        vulnerability_id: row.get(0)?,
        tool_id: row.get(1)?,
        severity,
        description: row.get(3)?,
        cve_id: row.get(4)?,
        discovered_at: db::timestamp(row, 5)?,
        patched_at: db::optional_timestamp(row, 6)?,
        patched_in_version: row.get(7)?,
    })
}
