use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vdw_orchestrator::config::{parse_severity, OrchestratorConfig, DEFAULT_MAX_REJECTIONS};
use vdw_orchestrator::event_bus::EventBus;
use vdw_orchestrator::metrics::MetricsRegistry;
use vdw_orchestrator::models::{Severity, ToolFilter};
use vdw_orchestrator::oracle::{HttpOracle, ReasoningOracle};
use vdw_orchestrator::orchestrator::Orchestrator;
use vdw_orchestrator::{db, mcp};

#[derive(Parser)]
#[command(name = "vdw")]
#[command(about = "Phase-gated project orchestrator with a persistent tool registry")]
struct Cli {
    #[command(flatten)]
    options: Options,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct Options {
    /// SQLite database file (defaults to the platform data directory)
    #[arg(long, global = true, env = "VDW_DB_PATH")]
    db: Option<PathBuf>,

    /// Reasoning oracle endpoint; transitions are only checked locally when unset
    #[arg(long, global = true, env = "VDW_ORACLE_URL")]
    oracle_url: Option<String>,

    /// Upper bound on a single oracle query
    #[arg(long, global = true, env = "VDW_ORACLE_TIMEOUT_MS", default_value = "2000")]
    oracle_timeout_ms: u64,

    /// Rejections allowed per phase before the project fails
    #[arg(long, global = true, env = "VDW_MAX_REJECTIONS", default_value_t = DEFAULT_MAX_REJECTIONS)]
    max_rejections: u32,

    /// Fail projects that wait longer than this for a human decision
    #[arg(long, global = true, env = "VDW_VALIDATION_TIMEOUT_SECS")]
    validation_timeout_secs: Option<u64>,

    /// Tools with an open vulnerability at or above this severity are never selected
    #[arg(long, global = true, env = "VDW_VULN_THRESHOLD", default_value = "high", value_parser = parse_severity)]
    vuln_threshold: Severity,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore projects and expire stale validations until interrupted.
    /// Agents and reviewers reach the orchestrator through `mcp`.
    Serve,
    /// Start MCP server via stdio (default)
    Mcp,
    /// Show schema version, projects per phase and registry size
    Status,
    /// Apply pending database migrations
    Migrate,
}

impl Options {
    fn config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            max_rejections_per_phase: self.max_rejections,
            validation_timeout: self.validation_timeout_secs.map(Duration::from_secs),
            oracle_timeout: Duration::from_millis(self.oracle_timeout_ms),
            ..OrchestratorConfig::default()
        }
        .with_vulnerability_threshold(self.vuln_threshold)
    }

    fn open_database(&self) -> anyhow::Result<db::Database> {
        let db = match &self.db {
            Some(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent)?;
                }
                db::Database::open(path)?
            }
            None => db::Database::open_default()?,
        };
        db.migrate()?;
        Ok(db)
    }

    fn oracle(&self) -> anyhow::Result<Option<Arc<dyn ReasoningOracle>>> {
        let Some(url) = &self.oracle_url else {
            return Ok(None);
        };
        tracing::info!("Using reasoning oracle at {}", url);
        let oracle: Arc<dyn ReasoningOracle> =
            Arc::new(HttpOracle::new(url.clone(), Duration::from_millis(self.oracle_timeout_ms))?);
        Ok(Some(oracle))
    }

    async fn orchestrator(&self) -> anyhow::Result<Arc<Orchestrator>> {
        let db = self.open_database()?;
        let orchestrator = Arc::new(
            Orchestrator::new(db, EventBus::new(), self.oracle()?, self.config())
                .with_metrics(MetricsRegistry::new()?),
        );
        orchestrator.restore().await?;
        Ok(orchestrator)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "vdw_orchestrator=debug,vdw_core=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let options = cli.options;

    match cli.command.unwrap_or(Commands::Mcp) {
        Commands::Serve => {
            let orchestrator = options.orchestrator().await?;
            let event_loop = orchestrator.start();
            tracing::info!("VDW orchestrator expiring stale validations, press Ctrl-C to stop");

            tokio::signal::ctrl_c().await?;
            event_loop.abort();
            tracing::info!("VDW orchestrator stopped");
        }
        Commands::Mcp => {
            let orchestrator = options.orchestrator().await?;
            let event_loop = orchestrator.start();

            mcp::run_stdio_server(orchestrator).await?;
            event_loop.abort();
        }
        Commands::Status => {
            let db = options.open_database()?;
            let mut per_phase: BTreeMap<String, usize> = BTreeMap::new();
            for ctx in db.list_projects()? {
                *per_phase.entry(ctx.current_phase.to_string()).or_default() += 1;
            }
            let registry = vdw_orchestrator::registry::ToolRegistry::new(db.clone());
            let tools = registry.list_tools(&ToolFilter {
                include_deprecated: true,
                created_by: None,
            })?;

            println!("schema version: {}", db.schema_version()?);
            println!("tools registered: {}", tools.len());
            if per_phase.is_empty() {
                println!("no projects");
            }
            for (phase, count) in per_phase {
                println!("{phase:<24} {count}");
            }
        }
        Commands::Migrate => {
            let db = options.open_database()?;
            for (version, description) in db.applied_migrations()? {
                println!("{version:>3}  {description}");
            }
        }
    }

    Ok(())
}
