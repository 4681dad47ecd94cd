use chrono::{Duration, Utc};
use rusqlite::{params, Connection, Row};
use tracing::debug;
use uuid::Uuid;

use super::{load_tool, tool_exists, ToolRegistry};
use crate::db;
use crate::error::{Result, VdwError};
use crate::models::{AnalyticsFilter, PerformanceAnalytics, PerformanceLog, RecordUsageInput, Tool, ToolStat};

const TOP_N: i64 = 10;

impl ToolRegistry {
    /// Appends a performance log and refreshes the tool's aggregate stats from
    /// the full log history, in one transaction.
    pub fn record_usage(&self, tool_id: &str, input: RecordUsageInput) -> Result<Tool> {
        if !input.duration_ms.is_finite() || input.duration_ms < 0.0 {
            return Err(VdwError::Validation(format!(
                "duration_ms must be a non-negative number, got {}",
                input.duration_ms
            )));
        }

        let end = Utc::now();
        let start = Duration::try_milliseconds(input.duration_ms as i64)
            .and_then(|elapsed| end.checked_sub_signed(elapsed))
            .ok_or_else(|| {
                VdwError::Validation(format!(
                    "duration_ms {} reaches before the earliest representable time",
                    input.duration_ms
                ))
            })?;
        let metadata = input
            .metadata
            .clone()
            .unwrap_or_else(|| serde_json::json!({}));

        let tool = self.database().with_transaction(|tx| {
            if !tool_exists(tx, tool_id)? {
                return Err(VdwError::not_found("tool", tool_id));
            }

            tx.execute(
                "INSERT INTO performance_logs (
                    log_id, tool_id, project_id, execution_start, execution_end, duration_ms, success,
                    error_message, input_size_bytes, output_size_bytes, memory_usage_mb, cpu_usage_percent, metadata
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    Uuid::new_v4().to_string(),
                    tool_id,
                    input.project_id.map(|id| id.to_string()),
                    start.to_rfc3339(),
                    end.to_rfc3339(),
                    input.duration_ms,
                    input.success,
                    input.error_message,
                    input.input_size_bytes,
                    input.output_size_bytes,
                    input.memory_usage_mb,
                    input.cpu_usage_percent,
                    metadata.to_string(),
                ],
            )?;

            tx.execute(
                "UPDATE tools SET
                    usage_count = usage_count + 1,
                    last_used = ?2,
                    success_rate = (SELECT AVG(CAST(success AS REAL)) FROM performance_logs WHERE tool_id = ?1),
                    average_duration = (SELECT AVG(duration_ms) FROM performance_logs WHERE tool_id = ?1)
                 WHERE tool_id = ?1",
                params![tool_id, end.to_rfc3339()],
            )?;

            load_tool(tx, tool_id)?.ok_or_else(|| VdwError::not_found("tool", tool_id))
        })?;

        if let Some(metrics) = &self.metrics {
            metrics.tool_outcome(tool_id, input.success);
        }
        debug!(
            tool_id,
            success = input.success,
            duration_ms = input.duration_ms,
            usage_count = tool.usage_count,
            "recorded tool usage"
        );
        Ok(tool)
    }

    /// Logs for one tool, newest first.
    pub fn performance_logs(&self, tool_id: &str) -> Result<Vec<PerformanceLog>> {
        self.database().with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT log_id, tool_id, project_id, execution_start, execution_end, duration_ms, success,
                        error_message, input_size_bytes, output_size_bytes, memory_usage_mb, cpu_usage_percent, metadata
                 FROM performance_logs WHERE tool_id = ?1
                 ORDER BY execution_end DESC, log_id",
            )?;
            let rows = stmt.query_map([tool_id], log_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Aggregates over the last `filter.days` days of logs.
    pub fn performance_analytics(&self, filter: &AnalyticsFilter) -> Result<PerformanceAnalytics> {
        // A window reaching past the earliest representable time has no cutoff.
        let cutoff = Duration::try_days(i64::from(filter.days))
            .and_then(|window| Utc::now().checked_sub_signed(window))
            .map(|since| since.to_rfc3339());
        let project = filter.project_id.map(|id| id.to_string());

        self.database().with_connection(|conn| {
            let (total, successes, average): (i64, Option<f64>, Option<f64>) = conn.query_row(
                "SELECT COUNT(*), SUM(success), AVG(duration_ms) FROM performance_logs
                 WHERE (?1 IS NULL OR execution_start >= ?1)
                   AND (?2 IS NULL OR tool_id = ?2)
                   AND (?3 IS NULL OR project_id = ?3)",
                params![cutoff, filter.tool_id, project],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )?;

            let success_rate = if total > 0 {
                successes.unwrap_or(0.0) / total as f64
            } else {
                0.0
            };

            Ok(PerformanceAnalytics {
                total_executions: total.max(0) as u64,
                success_rate,
                average_duration_ms: average.unwrap_or(0.0),
                slowest_tools: tool_stats(conn, cutoff.as_deref(), filter, project.as_deref(), "avg_duration DESC")?,
                most_used_tools: tool_stats(conn, cutoff.as_deref(), filter, project.as_deref(), "executions DESC")?,
            })
        })
    }
}

fn tool_stats(
    conn: &Connection,
    cutoff: Option<&str>,
    filter: &AnalyticsFilter,
    project: Option<&str>,
    order: &str,
) -> Result<Vec<ToolStat>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT t.tool_id, t.name, COUNT(*) AS executions, AVG(p.duration_ms) AS avg_duration
         FROM performance_logs p
         JOIN tools t ON t.tool_id = p.tool_id
         WHERE (?1 IS NULL OR p.execution_start >= ?1)
           AND (?2 IS NULL OR p.tool_id = ?2)
           AND (?3 IS NULL OR p.project_id = ?3)
         GROUP BY t.tool_id, t.name
         ORDER BY {order}, t.tool_id
         LIMIT ?4"
    ))?;
    let rows = stmt.query_map(params![cutoff, filter.tool_id, project, TOP_N], |row| {
        let executions: i64 = row.get(2)?;
        Ok(ToolStat {
            tool_id: row.get(0)?,
            name: row.get(1)?,
            executions: executions.max(0) as u64,
            average_duration_ms: row.get(3)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<PerformanceLog> {
    let project_id: Option<String> = row.get(2)?;
    Ok(PerformanceLog {
        log_id: row.get(0)?,
        tool_id: row.get(1)?,
        project_id: project_id.and_then(|raw| Uuid::parse_str(&raw).ok()),
        execution_start: db::timestamp(row, 3)?,
        execution_end: db::timestamp(row, 4)?,
        duration_ms: row.get(5)?,
        success: row.get(6)?,
        error_message: row.get(7)?,
        input_size_bytes: row.get(8)?,
        output_size_bytes: row.get(9)?,
        memory_usage_mb: row.get(10)?,
        cpu_usage_percent: row.get(11)?,
        metadata: db::json_column(row, 12)?.unwrap_or_else(|| serde_json::json!({})),
    })
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn usage_updates_counters_from_history() {
        let registry = registry();
        tool(&registry, "T1", &[("search", 0.8)]);

        let after_first = registry
            .record_usage("T1", RecordUsageInput::outcome(true, 100.0))
            .unwrap();
        assert_eq!(after_first.usage_count, 1);
        assert_eq!(after_first.success_rate, 1.0);
        assert!(after_first.last_used.is_some());

        let after_second = registry
            .record_usage("T1", RecordUsageInput::outcome(false, 300.0))
            .unwrap();
        assert_eq!(after_second.usage_count, 2);
        assert!((after_second.success_rate - 0.5).abs() < 1e-9);
        assert!((after_second.average_duration - 200.0).abs() < 1e-9);
        assert_eq!(registry.performance_logs("T1").unwrap().len(), 2);
    }

    #[test]
    fn invalid_duration_writes_nothing() {
        let registry = registry();
        tool(&registry, "T1", &[]);
        for bad in [-1.0, f64::NAN, f64::INFINITY] {
            let err = registry
                .record_usage("T1", RecordUsageInput::outcome(true, bad))
                .unwrap_err();
            assert!(matches!(err, VdwError::Validation(_)));
        }
        assert_eq!(registry.require_tool("T1").unwrap().usage_count, 0);
        assert!(registry.performance_logs("T1").unwrap().is_empty());
    }

    #[test]
    fn usage_of_unknown_tool_is_not_found() {
        let registry = registry();
        let err = registry
            .record_usage("ghost", RecordUsageInput::outcome(true, 1.0))
            .unwrap_err();
        assert!(matches!(err, VdwError::NotFound { kind: "tool", .. }));
    }

    #[test]
    fn analytics_summarize_window() {
        let registry = registry();
        tool(&registry, "fast", &[]);
        tool(&registry, "slow", &[]);
        let project = Uuid::new_v4();

        for _ in 0..3 {
            registry
                .record_usage(
                    "fast",
                    RecordUsageInput {
                        project_id: Some(project),
                        ..RecordUsageInput::outcome(true, 10.0)
                    },
                )
                .unwrap();
        }
        registry
            .record_usage("slow", RecordUsageInput::outcome(false, 900.0))
            .unwrap();

        let all = registry.performance_analytics(&AnalyticsFilter::default()).unwrap();
        assert_eq!(all.total_executions, 4);
        assert!((all.success_rate - 0.75).abs() < 1e-9);
        assert_eq!(all.slowest_tools[0].tool_id, "slow");
        assert_eq!(all.most_used_tools[0].tool_id, "fast");
        assert_eq!(all.most_used_tools[0].executions, 3);

        let scoped = registry
            .performance_analytics(&AnalyticsFilter {
                project_id: Some(project),
                ..AnalyticsFilter::default()
            })
            .unwrap();
        assert_eq!(scoped.total_executions, 3);
        assert_eq!(scoped.success_rate, 1.0);
    }

    #[test]
    fn duration_beyond_the_calendar_is_rejected() {
        let registry = registry();
        tool(&registry, "T1", &[]);
        let err = registry
            .record_usage("T1", RecordUsageInput::outcome(true, 1.0e16))
            .unwrap_err();
        assert!(matches!(err, VdwError::Validation(_)));
        assert_eq!(registry.require_tool("T1").unwrap().usage_count, 0);
        assert!(registry.performance_logs("T1").unwrap().is_empty());
    }

    #[test]
    fn oversized_window_covers_all_history() {
        let registry = registry();
        tool(&registry, "T1", &[]);
        registry
            .record_usage("T1", RecordUsageInput::outcome(true, 5.0))
            .unwrap();

        let analytics = registry
            .performance_analytics(&AnalyticsFilter {
                days: u32::MAX,
                ..AnalyticsFilter::default()
            })
            .unwrap();
        assert_eq!(analytics.total_executions, 1);
        assert_eq!(analytics.most_used_tools[0].tool_id, "T1");
    }

    #[test]
    fn outcomes_feed_the_tool_counters() {
        let metrics = crate::metrics::MetricsRegistry::new().unwrap();
        let registry = registry().with_metrics(metrics.metrics().clone());
        tool(&registry, "T1", &[]);
        registry
            .record_usage("T1", RecordUsageInput::outcome(true, 5.0))
            .unwrap();
        registry
            .record_usage("T1", RecordUsageInput::outcome(false, 5.0))
            .unwrap();
        registry
            .record_usage("T1", RecordUsageInput::outcome(true, 1.0e16))
            .unwrap_err();

        assert_eq!(metrics.metrics().tool_outcomes("T1"), (1.0, 1.0));
    }
}
