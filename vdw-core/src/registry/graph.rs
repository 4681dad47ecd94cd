use std::collections::{BTreeMap, BTreeSet};

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{info, warn};

use super::{edge_exists, load_tool, tool_exists, ToolRegistry};
use crate::error::{Result, VdwError};
use crate::models::{Dependency, DependencyKind, DeprecateToolInput, Tool};

type Adjacency = BTreeMap<String, BTreeSet<String>>;

impl ToolRegistry {
    /// Adds one dependency edge between two registered tools.
    pub fn add_dependency(&self, dependent: &str, dependency: &str, kind: DependencyKind) -> Result<()> {
        if dependent == dependency {
            return Err(VdwError::Cycle(format!("tool {dependent} cannot depend on itself")));
        }

        self.database().with_transaction(|tx| {
            for id in [dependent, dependency] {
                if !tool_exists(tx, id)? {
                    return Err(VdwError::not_found("tool", id));
                }
            }
            if edge_exists(tx, dependent, dependency)? {
                return Err(VdwError::Validation(format!(
                    "{dependent} already has a dependency edge to {dependency}"
                )));
            }
            if kind == DependencyKind::Conflicts && edge_exists(tx, dependency, dependent)? {
                return Err(VdwError::Validation(format!(
                    "{dependency} already has a dependency edge to {dependent}"
                )));
            }
            if kind == DependencyKind::Requires {
                let requires = load_adjacency(tx, DependencyKind::Requires)?;
                if let Some(path) = find_path(&requires, dependency, dependent) {
                    return Err(VdwError::Cycle(format!(
                        "requires({dependent}, {dependency}) closes the loop {dependent} -> {}",
                        path.join(" -> ")
                    )));
                }
            }
            insert_edge(tx, dependent, dependency, kind)
        })?;

        info!(%dependent, %dependency, kind = kind.as_str(), "added dependency");
        Ok(())
    }

    /// Every stored edge, sorted. Conflicts appear once per direction.
    pub fn list_dependencies(&self) -> Result<Vec<Dependency>> {
        self.database().with_connection(|conn| {
            let mut stmt = conn.prepare(
                "SELECT dependent_tool_id, dependency_tool_id, dependency_type FROM dependencies
                 ORDER BY dependent_tool_id, dependency_tool_id",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?;

            let mut edges = Vec::new();
            for row in rows {
                let (dependent_tool_id, dependency_tool_id, kind) = row?;
                let kind = DependencyKind::from_str(&kind)
                    .ok_or_else(|| VdwError::Corrupt(format!("dependency type '{kind}'")))?;
                edges.push(Dependency {
                    dependent_tool_id,
                    dependency_tool_id,
                    kind,
                });
            }
            Ok(edges)
        })
    }

    /// Topological order of the `requires` closure rooted at `tool_id`,
    /// dependencies first and the root last.
    pub fn resolve_dependencies(&self, tool_id: &str) -> Result<Vec<Tool>> {
        self.database().with_connection(|conn| {
            if !tool_exists(conn, tool_id)? {
                return Err(VdwError::not_found("tool", tool_id));
            }

            let requires = load_adjacency(conn, DependencyKind::Requires)?;
            let conflicts = load_adjacency(conn, DependencyKind::Conflicts)?;

            let mut order = Vec::new();
            let mut done = BTreeSet::new();
            let mut visiting = Vec::new();
            visit(&requires, tool_id, &mut visiting, &mut done, &mut order)?;

            let members: BTreeSet<&str> = order.iter().map(String::as_str).collect();
            for member in &members {
                if let Some(blocked) = conflicts.get(*member) {
                    if let Some(other) = blocked.iter().find(|other| members.contains(other.as_str())) {
                        return Err(VdwError::conflict(*member, other.as_str()));
                    }
                }
            }

            order
                .iter()
                .map(|id| load_tool(conn, id)?.ok_or_else(|| VdwError::not_found("tool", id.as_str())))
                .collect()
        })
    }

    /// Marks a tool deprecated, optionally naming its replacement.
    ///
    /// The replacement must exist, must not be deprecated, and following
    /// replacement links from it must never lead back to `tool_id`.
    pub fn deprecate(&self, tool_id: &str, input: DeprecateToolInput) -> Result<Tool> {
        let replacement = input.replacement_tool_id.as_deref();

        self.database().with_transaction(|tx| {
            if !tool_exists(tx, tool_id)? {
                return Err(VdwError::not_found("tool", tool_id));
            }

            if let Some(replacement) = replacement {
                if replacement == tool_id {
                    return Err(VdwError::Cycle(format!("tool {tool_id} cannot replace itself")));
                }
                let target = load_tool(tx, replacement)?
                    .ok_or_else(|| VdwError::not_found("tool", replacement))?;
                check_replacement_chain(tx, tool_id, replacement)?;
                if target.deprecated {
                    return Err(VdwError::Validation(format!(
                        "replacement {replacement} is itself deprecated"
                    )));
                }
            }

            tx.execute(
                "UPDATE tools SET deprecated = 1, deprecation_reason = ?1, replacement_tool_id = ?2
                 WHERE tool_id = ?3",
                params![input.reason, replacement, tool_id],
            )?;
            Ok(())
        })?;

        warn!(%tool_id, reason = %input.reason, replacement = ?replacement, "deprecated tool");
        self.require_tool(tool_id)
    }
}

pub(super) fn insert_edge(conn: &Connection, dependent: &str, dependency: &str, kind: DependencyKind) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO dependencies (dependent_tool_id, dependency_tool_id, dependency_type, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![dependent, dependency, kind.as_str(), now],
    )?;
    if kind == DependencyKind::Conflicts {
        conn.execute(
            "INSERT INTO dependencies (dependent_tool_id, dependency_tool_id, dependency_type, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![dependency, dependent, kind.as_str(), now],
        )?;
    }
    Ok(())
}

fn load_adjacency(conn: &Connection, kind: DependencyKind) -> Result<Adjacency> {
    let mut stmt = conn.prepare(
        "SELECT dependent_tool_id, dependency_tool_id FROM dependencies WHERE dependency_type = ?1",
    )?;
    let rows = stmt.query_map([kind.as_str()], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut adjacency = Adjacency::new();
    for row in rows {
        let (from, to) = row?;
        adjacency.entry(from).or_default().insert(to);
    }
    Ok(adjacency)
}

/// Depth-first path from `from` to `to`, visiting neighbours in lexical order.
fn find_path(adjacency: &Adjacency, from: &str, to: &str) -> Option<Vec<String>> {
    let mut stack = vec![vec![from.to_string()]];
    let mut seen = BTreeSet::new();

    while let Some(path) = stack.pop() {
        let node = path.last()?.clone();
        if node == to {
            return Some(path);
        }
        if !seen.insert(node.clone()) {
            continue;
        }
        if let Some(next) = adjacency.get(&node) {
            for neighbour in next.iter().rev() {
                let mut extended = path.clone();
                extended.push(neighbour.clone());
                stack.push(extended);
            }
        }
    }
    None
}

/// Post-order walk producing dependencies before dependents.
fn visit(
    adjacency: &Adjacency,
    node: &str,
    visiting: &mut Vec<String>,
    done: &mut BTreeSet<String>,
    order: &mut Vec<String>,
) -> Result<()> {
    if done.contains(node) {
        return Ok(());
    }
    if let Some(pos) = visiting.iter().position(|n| n == node) {
        let mut cycle = visiting[pos..].to_vec();
        cycle.push(node.to_string());
        return Err(VdwError::Cycle(format!("requires loop {}", cycle.join(" -> "))));
    }

    visiting.push(node.to_string());
    if let Some(next) = adjacency.get(node) {
        for neighbour in next {
            visit(adjacency, neighbour, visiting, done, order)?;
        }
    }
    visiting.pop();

    done.insert(node.to_string());
    order.push(node.to_string());
    Ok(())
}

fn check_replacement_chain(conn: &Connection, tool_id: &str, replacement: &str) -> Result<()> {
    let mut chain = vec![tool_id.to_string(), replacement.to_string()];
    let mut current = replacement.to_string();

    loop {
        let next: Option<String> = conn.query_row(
            "SELECT replacement_tool_id FROM tools WHERE tool_id = ?1",
            [&current],
            |row| row.get(0),
        )?;
        let Some(next) = next else {
            return Ok(());
        };
        chain.push(next.clone());
        if next == tool_id {
            return Err(VdwError::Cycle(format!("replacement chain {}", chain.join(" -> "))));
        }
        if chain[1..chain.len() - 1].contains(&next) {
            // A loop that does not pass through tool_id predates this call.
            return Ok(());
        }
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::models::DependencyEdgeInput;

    fn deprecate(registry: &ToolRegistry, id: &str, replacement: Option<&str>) -> Result<Tool> {
        registry.deprecate(
            id,
            DeprecateToolInput {
                reason: "superseded".into(),
                replacement_tool_id: replacement.map(str::to_string),
            },
        )
    }

    #[test]
    fn reverse_requires_edge_is_a_cycle_and_changes_nothing() {
        let registry = registry();
        tool(&registry, "A", &[]);
        tool(&registry, "B", &[]);
        registry.add_dependency("A", "B", DependencyKind::Requires).unwrap();
        let before = registry.list_dependencies().unwrap();

        let err = registry
            .add_dependency("B", "A", DependencyKind::Requires)
            .unwrap_err();
        assert!(matches!(err, VdwError::Cycle(_)));
        assert_eq!(registry.list_dependencies().unwrap(), before);
    }

    #[test]
    fn longer_cycles_are_detected() {
        let registry = registry();
        for id in ["A", "B", "C"] {
            tool(&registry, id, &[]);
        }
        registry.add_dependency("A", "B", DependencyKind::Requires).unwrap();
        registry.add_dependency("B", "C", DependencyKind::Requires).unwrap();
        let err = registry
            .add_dependency("C", "A", DependencyKind::Requires)
            .unwrap_err();
        match err {
            VdwError::Cycle(msg) => assert!(msg.contains("C -> A -> B -> C"), "{msg}"),
            other => panic!("unexpected error: {other}"),
        }
        // optional edges never count towards cycles
        registry.add_dependency("C", "A", DependencyKind::Optional).unwrap();
    }

    #[test]
    fn conflicts_are_stored_symmetrically() {
        let registry = registry();
        tool(&registry, "A", &[]);
        tool(&registry, "B", &[]);
        registry.add_dependency("A", "B", DependencyKind::Conflicts).unwrap();

        let edges = registry.list_dependencies().unwrap();
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().all(|e| e.kind == DependencyKind::Conflicts));
        assert!(edges
            .iter()
            .any(|e| e.dependent_tool_id == "B" && e.dependency_tool_id == "A"));
    }

    #[test]
    fn resolve_orders_dependencies_first() {
        let registry = registry();
        tool(&registry, "db", &[]);
        tool(&registry, "http", &[]);
        registry
            .register(
                crate::models::CreateToolInput::new("api", "api", "p"),
                &[],
                &[DependencyEdgeInput::requires("db"), DependencyEdgeInput::requires("http")],
            )
            .unwrap();
        registry.add_dependency("http", "db", DependencyKind::Requires).unwrap();

        let order: Vec<String> = registry
            .resolve_dependencies("api")
            .unwrap()
            .into_iter()
            .map(|t| t.tool_id)
            .collect();
        assert_eq!(order, vec!["db", "http", "api"]);
    }

    #[test]
    fn resolve_reports_conflicting_pair() {
        let registry = registry();
        tool(&registry, "A", &[]);
        tool(&registry, "B", &[]);
        registry.add_dependency("A", "B", DependencyKind::Conflicts).unwrap();
        registry
            .register(
                crate::models::CreateToolInput::new("C", "C", "p"),
                &[],
                &[DependencyEdgeInput::requires("A"), DependencyEdgeInput::requires("B")],
            )
            .unwrap();

        match registry.resolve_dependencies("C").unwrap_err() {
            VdwError::Conflict { first, second } => {
                assert_eq!((first.as_str(), second.as_str()), ("A", "B"));
            }
            other => panic!("unexpected error: {other}"),
        }
        // each side alone still resolves
        assert_eq!(registry.resolve_dependencies("A").unwrap().len(), 1);
    }

    #[test]
    fn replacement_cycle_is_rejected() {
        let registry = registry();
        tool(&registry, "A", &[]);
        tool(&registry, "B", &[]);

        let a = deprecate(&registry, "A", Some("B")).unwrap();
        assert!(a.deprecated);
        assert_eq!(a.replacement_tool_id.as_deref(), Some("B"));

        let err = deprecate(&registry, "B", Some("A")).unwrap_err();
        assert!(matches!(err, VdwError::Cycle(_)));
        assert!(!registry.require_tool("B").unwrap().deprecated);
    }

    #[test]
    fn deprecated_replacement_is_rejected() {
        let registry = registry();
        for id in ["A", "B", "C"] {
            tool(&registry, id, &[]);
        }
        deprecate(&registry, "B", None).unwrap();
        let err = deprecate(&registry, "A", Some("B")).unwrap_err();
        assert!(matches!(err, VdwError::Validation(_)));

        deprecate(&registry, "A", Some("C")).unwrap();
    }
}
