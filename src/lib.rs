//! VDW orchestrator: drives projects through five human-gated phases and
//! keeps the MCP Box tool registry that the phase agents draw on.

pub mod config;
pub mod event_bus;
pub mod mcp;
pub mod oracle;
pub mod orchestrator;
pub mod state_machine;

pub use vdw_core::{db, error, metrics, models, registry};
