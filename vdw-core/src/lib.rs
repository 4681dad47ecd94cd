//! Core library for the VDW orchestrator.
//!
//! This crate provides the domain models, the SQLite store and the MCP Box
//! tool registry, independent of the async workflow and transport layers.
//!
//! # Usage
//!
//! ```no_run
//! use vdw_core::db::Database;
//! use vdw_core::registry::ToolRegistry;
//!
//! let db = Database::open_default()?;
//! db.migrate()?;
//!
//! let registry = ToolRegistry::new(db);
//! let best = registry.find_best_tool("web-scraping");
//! # Ok::<(), anyhow::Error>(())
//! ```

pub mod db;
pub mod error;
pub mod metrics;
pub mod models;
pub mod registry;

// Re-export commonly used types at crate root
pub use db::Database;
pub use error::{Result, VdwError};
pub use metrics::{MetricsRegistry, VdwMetrics};
pub use registry::ToolRegistry;
