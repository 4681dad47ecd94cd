//! Best-provider selection and capability gap analysis.
//!
//! # Ranking
//!
//! Eligible providers are scored as
//!
//! ```text
//! score = 0.35 * strength
//!       + 0.20 * confidence
//!       + 0.25 * success_rate
//!       + 0.10 * speed      speed   = 1 / (1 + average_duration_ms / 1000)
//!       + 0.10 * recency    recency = 1 / (1 + hours_behind_newest / 24), 0 if never used
//! ```
//!
//! `hours_behind_newest` is measured against the most recent `last_used` among
//! the candidates rather than the wall clock, so the same registry state always
//! produces the same ranking. Equal scores are ordered by ascending `tool_id`.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{tool_from_row, ToolRegistry, TOOL_COLUMNS};
use crate::error::{Result, VdwError};
use crate::models::{Severity, Tool};

const W_STRENGTH: f64 = 0.35;
const W_CONFIDENCE: f64 = 0.20;
const W_SUCCESS: f64 = 0.25;
const W_SPEED: f64 = 0.10;
const W_RECENCY: f64 = 0.10;

/// Filters applied before ranking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolQuery {
    pub capability: String,
    #[serde(default = "default_true")]
    pub exclude_deprecated: bool,
    /// `None` disables the vulnerability filter.
    #[serde(default)]
    pub exclude_vulnerable_at_or_above: Option<Severity>,
}

fn default_true() -> bool {
    true
}

impl ToolQuery {
    pub fn new(capability: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            exclude_deprecated: true,
            exclude_vulnerable_at_or_above: Some(Severity::High),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedTool {
    pub tool: Tool,
    pub strength: f64,
    pub confidence: f64,
    pub score: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GapReport {
    /// Requested capabilities with no eligible provider.
    pub missing: Vec<String>,
    /// Covered capabilities whose best eligible strength is below the weak threshold.
    pub weak: Vec<String>,
    /// Fraction of requested capabilities with at least one eligible provider.
    pub coverage_score: f64,
}

impl GapReport {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }
}

struct Candidate {
    tool: Tool,
    strength: f64,
    confidence: f64,
    worst_open: Option<Severity>,
}

impl ToolRegistry {
    /// Best eligible provider of `capability` under the registry policy.
    pub fn find_best_tool(&self, capability: &str) -> Result<Tool> {
        let query = ToolQuery {
            exclude_vulnerable_at_or_above: Some(self.policy().vulnerability_threshold),
            ..ToolQuery::new(capability)
        };
        self.find_best_tool_with(&query)
    }

    pub fn find_best_tool_with(&self, query: &ToolQuery) -> Result<Tool> {
        let best = self
            .rank_tools(query)?
            .into_iter()
            .next()
            .ok_or_else(|| VdwError::Gap(query.capability.clone()))?;
        debug!(
            capability = %query.capability,
            tool_id = %best.tool.tool_id,
            score = best.score,
            "selected provider"
        );
        Ok(best.tool)
    }

    /// All eligible providers, best first.
    pub fn rank_tools(&self, query: &ToolQuery) -> Result<Vec<RankedTool>> {
        let candidates = self
            .database()
            .with_connection(|conn| load_candidates(conn, &query.capability))?;
        Ok(rank(candidates, query))
    }

    /// Non-deprecated providers with at least `min_strength`, strongest and most used first.
    pub fn find_tools_by_capability(&self, capability: &str, min_strength: f64) -> Result<Vec<Tool>> {
        let mut candidates: Vec<Candidate> = self
            .database()
            .with_connection(|conn| load_candidates(conn, capability))?
            .into_iter()
            .filter(|c| !c.tool.deprecated && c.strength >= min_strength)
            .collect();
        candidates.sort_by(|a, b| {
            b.strength
                .total_cmp(&a.strength)
                .then_with(|| b.tool.usage_count.cmp(&a.tool.usage_count))
                .then_with(|| a.tool.tool_id.cmp(&b.tool.tool_id))
        });
        Ok(candidates.into_iter().map(|c| c.tool).collect())
    }

    /// Which of `required` lack an eligible provider. Duplicates are reported once.
    pub fn gap_analysis(&self, required: &[String]) -> Result<GapReport> {
        let policy = self.policy();
        let mut report = GapReport::default();
        let mut seen = BTreeSet::new();
        let mut covered = 0usize;

        for capability in required {
            if !seen.insert(capability.as_str()) {
                continue;
            }
            let query = ToolQuery {
                exclude_vulnerable_at_or_above: Some(policy.vulnerability_threshold),
                ..ToolQuery::new(capability.as_str())
            };
            let ranked = self.rank_tools(&query)?;
            match ranked.iter().map(|r| r.strength).reduce(f64::max) {
                None => report.missing.push(capability.clone()),
                Some(strength) => {
                    covered += 1;
                    if strength < policy.weak_strength {
                        report.weak.push(capability.clone());
                    }
                }
            }
        }

        report.coverage_score = if seen.is_empty() {
            1.0
        } else {
            covered as f64 / seen.len() as f64
        };
        if !report.missing.is_empty() {
            debug!(missing = ?report.missing, "capability gaps found");
        }
        Ok(report)
    }
}

fn load_candidates(conn: &Connection, capability: &str) -> Result<Vec<Candidate>> {
    let columns = TOOL_COLUMNS
        .split(", ")
        .map(|c| format!("t.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT {columns}, tc.strength, tc.confidence
         FROM tools t
         JOIN tool_capabilities tc ON tc.tool_id = t.tool_id
         JOIN capabilities c ON c.capability_id = tc.capability_id
         WHERE c.name = ?1
         ORDER BY t.tool_id"
    ))?;
    let rows = stmt.query_map(params![capability], |row| {
        Ok((tool_from_row(row)?, row.get::<_, f64>(17)?, row.get::<_, f64>(18)?))
    })?;

    let mut candidates = Vec::new();
    for row in rows {
        let (tool, strength, confidence) = row?;
        let worst_open = worst_open_severity(conn, &tool.tool_id)?;
        candidates.push(Candidate {
            tool,
            strength,
            confidence,
            worst_open,
        });
    }
    Ok(candidates)
}

pub(super) fn worst_open_severity(conn: &Connection, tool_id: &str) -> Result<Option<Severity>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT severity FROM vulnerabilities WHERE tool_id = ?1 AND patched_at IS NULL",
    )?;
    let rows = stmt.query_map([tool_id], |row| row.get::<_, String>(0))?;
    let mut worst = None;
    for row in rows {
        let raw = row?;
        let severity = Severity::from_str(&raw)
            .ok_or_else(|| VdwError::Corrupt(format!("severity '{raw}'")))?;
        worst = worst.max(Some(severity));
    }
    Ok(worst)
}

fn rank(candidates: Vec<Candidate>, query: &ToolQuery) -> Vec<RankedTool> {
    let eligible: Vec<Candidate> = candidates
        .into_iter()
        .filter(|c| !(query.exclude_deprecated && c.tool.deprecated))
        .filter(|c| match (query.exclude_vulnerable_at_or_above, c.worst_open) {
            (Some(threshold), Some(worst)) => worst < threshold,
            _ => true,
        })
        .collect();

    let newest = eligible.iter().filter_map(|c| c.tool.last_used).max();

    let mut ranked: Vec<RankedTool> = eligible
        .into_iter()
        .map(|c| {
            let score = score(&c, newest);
            RankedTool {
                tool: c.tool,
                strength: c.strength,
                confidence: c.confidence,
                score,
            }
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.tool.tool_id.cmp(&b.tool.tool_id))
    });
    ranked
}

fn score(candidate: &Candidate, newest: Option<DateTime<Utc>>) -> f64 {
    let tool = &candidate.tool;
    let speed = 1.0 / (1.0 + tool.average_duration.max(0.0) / 1000.0);
    let recency = match (tool.last_used, newest) {
        (Some(last), Some(newest)) => {
            let hours = (newest - last).num_seconds().max(0) as f64 / 3600.0;
            1.0 / (1.0 + hours / 24.0)
        }
        _ => 0.0,
    };

    W_STRENGTH * candidate.strength
        + W_CONFIDENCE * candidate.confidence
        + W_SUCCESS * tool.success_rate.clamp(0.0, 1.0)
        + W_SPEED * speed
        + W_RECENCY * recency
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::models::{DeprecateToolInput, RecordUsageInput, ReportVulnerabilityInput};

    #[test]
    fn stronger_provider_wins() {
        let registry = registry();
        tool(&registry, "T1", &[("web-scraping", 0.9)]);
        tool(&registry, "T2", &[("web-scraping", 0.5)]);
        assert_eq!(registry.find_best_tool("web-scraping").unwrap().tool_id, "T1");
    }

    #[test]
    fn ties_break_on_tool_id() {
        let registry = registry();
        tool(&registry, "zeta", &[("search", 0.6)]);
        tool(&registry, "alpha", &[("search", 0.6)]);
        assert_eq!(registry.find_best_tool("search").unwrap().tool_id, "alpha");
    }

    #[test]
    fn ranking_is_stable_across_calls() {
        let registry = registry();
        tool(&registry, "T1", &[("ocr", 0.7)]);
        tool(&registry, "T2", &[("ocr", 0.7)]);
        registry
            .record_usage("T2", RecordUsageInput::outcome(true, 120.0))
            .unwrap();
        registry
            .record_usage("T1", RecordUsageInput::outcome(false, 40.0))
            .unwrap();

        let first = registry.rank_tools(&ToolQuery::new("ocr")).unwrap();
        for _ in 0..5 {
            assert_eq!(registry.rank_tools(&ToolQuery::new("ocr")).unwrap(), first);
        }
    }

    #[test]
    fn unknown_capability_is_a_gap() {
        let registry = registry();
        assert!(matches!(
            registry.find_best_tool("teleportation"),
            Err(VdwError::Gap(name)) if name == "teleportation"
        ));
    }

    #[test]
    fn deprecated_and_vulnerable_tools_are_skipped() {
        let registry = registry();
        tool(&registry, "T1", &[("pdf", 0.9)]);
        tool(&registry, "T2", &[("pdf", 0.8)]);
        tool(&registry, "T3", &[("pdf", 0.1)]);

        registry
            .deprecate(
                "T1",
                DeprecateToolInput {
                    reason: "old".into(),
                    replacement_tool_id: None,
                },
            )
            .unwrap();
        assert_eq!(registry.find_best_tool("pdf").unwrap().tool_id, "T2");

        let vuln = registry
            .report_vulnerability(ReportVulnerabilityInput {
                tool_id: "T2".into(),
                severity: Severity::Critical,
                description: "rce".into(),
                cve_id: None,
            })
            .unwrap();
        assert_eq!(registry.find_best_tool("pdf").unwrap().tool_id, "T3");

        let mut lenient = ToolQuery::new("pdf");
        lenient.exclude_vulnerable_at_or_above = None;
        lenient.exclude_deprecated = false;
        assert_eq!(registry.find_best_tool_with(&lenient).unwrap().tool_id, "T1");

        registry
            .patch_vulnerability(crate::models::PatchVulnerabilityInput {
                vulnerability_id: vuln.vulnerability_id,
                patched_in_version: Some("1.0.1".into()),
            })
            .unwrap();
        assert_eq!(registry.find_best_tool("pdf").unwrap().tool_id, "T2");
    }

    #[test]
    fn low_severity_does_not_block() {
        let registry = registry();
        tool(&registry, "T1", &[("pdf", 0.9)]);
        registry
            .report_vulnerability(ReportVulnerabilityInput {
                tool_id: "T1".into(),
                severity: Severity::Medium,
                description: "info leak".into(),
                cve_id: Some("CVE-2024-0001".into()),
            })
            .unwrap();
        assert_eq!(registry.find_best_tool("pdf").unwrap().tool_id, "T1");
    }

    #[test]
    fn gap_analysis_lists_missing_and_weak() {
        let registry = registry();
        tool(&registry, "T1", &[("search", 0.9), ("summarize", 0.3)]);
        capability(&registry, "translate");

        let report = registry
            .gap_analysis(&[
                "search".to_string(),
                "summarize".to_string(),
                "translate".to_string(),
                "search".to_string(),
            ])
            .unwrap();
        assert_eq!(report.missing, vec!["translate".to_string()]);
        assert_eq!(report.weak, vec!["summarize".to_string()]);
        assert!((report.coverage_score - 2.0 / 3.0).abs() < 1e-9);

        let empty = registry.gap_analysis(&[]).unwrap();
        assert!(empty.is_complete());
        assert_eq!(empty.coverage_score, 1.0);
    }

    #[test]
    fn find_tools_by_capability_respects_min_strength() {
        let registry = registry();
        tool(&registry, "T1", &[("search", 0.9)]);
        tool(&registry, "T2", &[("search", 0.4)]);
        let ids: Vec<_> = registry
            .find_tools_by_capability("search", 0.5)
            .unwrap()
            .into_iter()
            .map(|t| t.tool_id)
            .collect();
        assert_eq!(ids, vec!["T1"]);
    }
}
