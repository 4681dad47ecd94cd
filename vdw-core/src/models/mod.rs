//! Domain models for the VDW orchestrator.
//!
//! # Workflow
//!
//! - [`PhaseState`]: the thirteen states of a project's waterfall, with the
//!   fixed transition table in [`PhaseState::next`].
//! - [`ProjectContext`]: one submitted vibe moving through the five [`Stage`]s.
//!
//! # MCP Box
//!
//! - [`Tool`]: a registered unit offering capabilities, carrying its reputation.
//!   Tools are never deleted, only deprecated.
//! - [`Capability`] and [`ToolCapability`]: the weighted tool/capability graph.
//! - [`Dependency`]: `requires` / `optional` / `conflicts` edges between tools.
//! - [`Vulnerability`]: open until patched; open ones can make a tool ineligible.
//! - [`PerformanceLog`]: append-only invocation records feeding tool reputation.

mod capability;
mod dependency;
mod performance;
mod phase;
mod project;
mod tool;
mod vulnerability;

pub use capability::*;
pub use dependency::*;
pub use performance::*;
pub use phase::*;
pub use project::*;
pub use tool::*;
pub use vulnerability::*;
