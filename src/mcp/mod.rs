use std::sync::Arc;

use rmcp::{
    handler::server::{tool::ToolRouter, wrapper::Parameters},
    model::{CallToolResult, Content, ServerInfo},
    tool, tool_handler, tool_router,
    schemars::JsonSchema,
    ErrorData as McpError, ServerHandler, ServiceExt,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::parse_severity;
use crate::error::VdwError;
use crate::models::*;
use crate::orchestrator::Orchestrator;
use crate::registry::ToolQuery;

#[derive(Clone)]
pub struct McpServer {
    orchestrator: Arc<Orchestrator>,
    tool_router: ToolRouter<Self>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SubmitProjectRequest {
    #[schemars(description = "Free-text description of the project idea")]
    pub vibe: String,
    #[schemars(description = "Capability names the project will need")]
    #[serde(default)]
    pub required_capabilities: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ProjectRequest {
    #[schemars(description = "The project ID")]
    pub project_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CompletePhaseRequest {
    #[schemars(description = "The project ID")]
    pub project_id: String,
    #[schemars(description = "Phase number, 1 to 5")]
    pub phase: u8,
    #[schemars(description = "The phase agent's output")]
    pub output: serde_json::Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ApprovePhaseRequest {
    #[schemars(description = "The project ID")]
    pub project_id: String,
    #[schemars(description = "Phase number, 1 to 5")]
    pub phase: u8,
    #[schemars(description = "Optional notes kept with the phase")]
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RejectPhaseRequest {
    #[schemars(description = "The project ID")]
    pub project_id: String,
    #[schemars(description = "Phase number, 1 to 5")]
    pub phase: u8,
    #[schemars(description = "What the phase agent should change")]
    pub feedback: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FailProjectRequest {
    #[schemars(description = "The project ID")]
    pub project_id: String,
    #[schemars(description = "Why the project is being stopped")]
    pub reason: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AttachToolRequest {
    #[schemars(description = "The project ID")]
    pub project_id: String,
    #[schemars(description = "ID of a registered tool created for this project")]
    pub tool_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CreateCapabilityRequest {
    #[schemars(description = "Unique capability name")]
    pub name: String,
    #[schemars(description = "What the capability covers")]
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct CapabilityEdgeRequest {
    pub capability: String,
    #[schemars(description = "How well the tool provides the capability, 0 to 1")]
    pub strength: f64,
    #[schemars(description = "How sure we are about the strength, 0 to 1")]
    pub confidence: f64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DependencyEdgeRequest {
    pub tool_id: String,
    #[schemars(description = "requires, optional or conflicts")]
    pub kind: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RegisterToolRequest {
    #[schemars(description = "Tool ID; generated when omitted")]
    #[serde(default)]
    pub tool_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub version: Option<String>,
    #[schemars(description = "Where the tool's code lives")]
    #[serde(default)]
    pub location: Option<String>,
    #[schemars(description = "Project ID or system name that created the tool")]
    pub created_by: String,
    #[serde(default)]
    pub capabilities: Vec<CapabilityEdgeRequest>,
    #[serde(default)]
    pub dependencies: Vec<DependencyEdgeRequest>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ToolIdRequest {
    pub tool_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FindBestToolRequest {
    pub capability: String,
    #[serde(default)]
    pub include_deprecated: bool,
    #[schemars(description = "Skip tools with an open vulnerability at or above this severity")]
    #[serde(default)]
    pub vulnerability_threshold: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct FindToolsRequest {
    pub capability: String,
    #[serde(default)]
    pub min_strength: f64,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ListToolsRequest {
    #[serde(default)]
    pub include_deprecated: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AddDependencyRequest {
    pub dependent_tool_id: String,
    pub dependency_tool_id: String,
    #[schemars(description = "requires, optional or conflicts")]
    pub kind: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RecordUsageRequest {
    pub tool_id: String,
    pub success: bool,
    pub duration_ms: f64,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct DeprecateToolRequest {
    pub tool_id: String,
    pub reason: String,
    #[serde(default)]
    pub replacement_tool_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ReportVulnerabilityRequest {
    pub tool_id: String,
    #[schemars(description = "low, medium, high or critical")]
    pub severity: String,
    pub description: String,
    #[serde(default)]
    pub cve_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PatchVulnerabilityRequest {
    pub vulnerability_id: String,
    #[serde(default)]
    pub patched_in_version: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct GapAnalysisRequest {
    pub capabilities: Vec<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AnalyticsRequest {
    #[serde(default)]
    pub tool_id: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
    #[schemars(description = "Window size in days, 30 when omitted")]
    #[serde(default)]
    pub days: Option<u32>,
}

#[derive(Debug, Serialize)]
struct PhaseResult {
    project_id: Uuid,
    current_phase: PhaseState,
}

impl McpServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            tool_router: Self::tool_router(),
        }
    }

    fn parse_uuid(s: &str) -> Result<Uuid, McpError> {
        Uuid::parse_str(s)
            .map_err(|e| McpError::invalid_params(format!("Invalid UUID: {}", e), None))
    }

    fn parse_stage(phase: u8) -> Result<Stage, McpError> {
        Stage::from_number(phase)
            .ok_or_else(|| McpError::invalid_params(format!("Phase must be 1 to 5, got {}", phase), None))
    }

    fn parse_kind(kind: &str) -> Result<DependencyKind, McpError> {
        DependencyKind::from_str(kind)
            .ok_or_else(|| McpError::invalid_params(format!("Unknown dependency kind: {}", kind), None))
    }

    fn parse_severity(raw: &str) -> Result<Severity, McpError> {
        parse_severity(raw).map_err(|e| McpError::invalid_params(e, None))
    }

    fn json<T: Serialize>(value: &T) -> Result<CallToolResult, McpError> {
        let json = serde_json::to_string_pretty(value)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(json)]))
    }

    fn phase_result(project_id: Uuid, state: PhaseState) -> Result<CallToolResult, McpError> {
        Self::json(&PhaseResult {
            project_id,
            current_phase: state,
        })
    }
}

/// Rule violations are the caller's problem; everything else is ours.
fn to_mcp(err: VdwError) -> McpError {
    match err {
        e if e.is_rejection() => McpError::invalid_params(e.to_string(), None),
        e @ VdwError::NotFound { .. } => McpError::invalid_params(e.to_string(), None),
        e => McpError::internal_error(e.to_string(), None),
    }
}

#[tool_router]
impl McpServer {
    #[tool(description = "Submit a new project idea and start phase 1")]
    async fn submit_project(
        &self,
        params: Parameters<SubmitProjectRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let project_id = self
            .orchestrator
            .submit(CreateProjectInput {
                vibe: req.vibe,
                required_capabilities: req.required_capabilities,
            })
            .await
            .map_err(to_mcp)?;

        Self::phase_result(project_id, PhaseState::Work(Stage::Mood))
    }

    #[tool(description = "Report that a phase agent finished its work; moves the phase to human validation")]
    async fn complete_phase(
        &self,
        params: Parameters<CompletePhaseRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let project_id = Self::parse_uuid(&req.project_id)?;
        let stage = Self::parse_stage(req.phase)?;

        let state = self
            .orchestrator
            .agent_completed(project_id, stage, req.output)
            .await
            .map_err(to_mcp)?;
        Self::phase_result(project_id, state)
    }

    #[tool(description = "Approve a phase that is waiting for validation")]
    async fn approve_phase(
        &self,
        params: Parameters<ApprovePhaseRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let project_id = Self::parse_uuid(&req.project_id)?;
        let stage = Self::parse_stage(req.phase)?;

        let state = self
            .orchestrator
            .approve(project_id, stage, req.feedback)
            .await
            .map_err(to_mcp)?;
        Self::phase_result(project_id, state)
    }

    #[tool(description = "Reject a phase that is waiting for validation and send it back with feedback")]
    async fn reject_phase(
        &self,
        params: Parameters<RejectPhaseRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let project_id = Self::parse_uuid(&req.project_id)?;
        let stage = Self::parse_stage(req.phase)?;

        let state = self
            .orchestrator
            .reject(project_id, stage, &req.feedback)
            .await
            .map_err(to_mcp)?;
        Self::phase_result(project_id, state)
    }

    #[tool(description = "Stop a project and mark it failed")]
    async fn fail_project(
        &self,
        params: Parameters<FailProjectRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let project_id = Self::parse_uuid(&req.project_id)?;

        let state = self
            .orchestrator
            .fail(project_id, &req.reason)
            .await
            .map_err(to_mcp)?;
        Self::phase_result(project_id, state)
    }

    #[tool(description = "Get the full context of a project, including feedback and outputs")]
    async fn get_project_context(
        &self,
        params: Parameters<ProjectRequest>,
    ) -> Result<CallToolResult, McpError> {
        let project_id = Self::parse_uuid(&params.0.project_id)?;
        let ctx = self.orchestrator.get_context(project_id).await.map_err(to_mcp)?;
        Self::json(&ctx)
    }

    #[tool(description = "Get the outputs produced so far for a project")]
    async fn get_project_artifacts(
        &self,
        params: Parameters<ProjectRequest>,
    ) -> Result<CallToolResult, McpError> {
        let project_id = Self::parse_uuid(&params.0.project_id)?;
        let artifacts = self
            .orchestrator
            .get_artifacts(project_id)
            .await
            .map_err(to_mcp)?;
        Self::json(&artifacts)
    }

    #[tool(description = "List all projects with their current phase")]
    async fn list_projects(&self) -> Result<CallToolResult, McpError> {
        let summaries: Vec<PhaseResult> = self
            .orchestrator
            .list_projects()
            .await
            .into_iter()
            .map(|ctx| PhaseResult {
                project_id: ctx.project_id,
                current_phase: ctx.current_phase,
            })
            .collect();
        Self::json(&summaries)
    }

    #[tool(description = "Record that a registered tool was created for a project")]
    async fn attach_tool(
        &self,
        params: Parameters<AttachToolRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let project_id = Self::parse_uuid(&req.project_id)?;
        let ctx = self
            .orchestrator
            .attach_tool(project_id, &req.tool_id)
            .await
            .map_err(to_mcp)?;
        Self::json(&ctx.tools_created)
    }

    #[tool(description = "Create a capability in the registry")]
    async fn create_capability(
        &self,
        params: Parameters<CreateCapabilityRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let capability = self
            .orchestrator
            .registry()
            .create_capability(CreateCapabilityInput {
                name: req.name,
                description: req.description,
                category: req.category,
            })
            .map_err(to_mcp)?;
        Self::json(&capability)
    }

    #[tool(description = "Register a tool with its capabilities and dependencies")]
    async fn register_tool(
        &self,
        params: Parameters<RegisterToolRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let capabilities: Vec<CapabilityEdgeInput> = req
            .capabilities
            .into_iter()
            .map(|c| CapabilityEdgeInput::new(c.capability, c.strength, c.confidence))
            .collect();
        let dependencies = req
            .dependencies
            .into_iter()
            .map(|d| {
                Ok(DependencyEdgeInput {
                    kind: Self::parse_kind(&d.kind)?,
                    tool_id: d.tool_id,
                })
            })
            .collect::<Result<Vec<_>, McpError>>()?;

        let mut input = CreateToolInput::new(String::new(), req.name, req.created_by);
        input.tool_id = req.tool_id;
        input.description = req.description;
        input.location = req.location;
        if let Some(version) = req.version {
            input.version = version;
        }

        let tool = self
            .orchestrator
            .registry()
            .register(input, &capabilities, &dependencies)
            .map_err(to_mcp)?;
        Self::json(&tool)
    }

    #[tool(description = "Get a tool by ID")]
    async fn get_tool(
        &self,
        params: Parameters<ToolIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let tool = self
            .orchestrator
            .registry()
            .require_tool(&params.0.tool_id)
            .map_err(to_mcp)?;
        Self::json(&tool)
    }

    #[tool(description = "List registered tools")]
    async fn list_registered_tools(
        &self,
        params: Parameters<ListToolsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let tools = self
            .orchestrator
            .registry()
            .list_tools(&ToolFilter {
                include_deprecated: req.include_deprecated,
                created_by: req.created_by,
            })
            .map_err(to_mcp)?;
        Self::json(&tools)
    }

    #[tool(description = "Find the best eligible tool for a capability")]
    async fn find_best_tool(
        &self,
        params: Parameters<FindBestToolRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let registry = self.orchestrator.registry();
        let threshold = match req.vulnerability_threshold.as_deref() {
            Some(raw) => Self::parse_severity(raw)?,
            None => registry.policy().vulnerability_threshold,
        };
        let query = ToolQuery {
            exclude_deprecated: !req.include_deprecated,
            exclude_vulnerable_at_or_above: Some(threshold),
            ..ToolQuery::new(req.capability)
        };
        let tool = registry.find_best_tool_with(&query).map_err(to_mcp)?;
        Self::json(&tool)
    }

    #[tool(description = "List non-deprecated tools providing a capability at a minimum strength")]
    async fn find_tools_by_capability(
        &self,
        params: Parameters<FindToolsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let tools = self
            .orchestrator
            .registry()
            .find_tools_by_capability(&req.capability, req.min_strength)
            .map_err(to_mcp)?;
        Self::json(&tools)
    }

    #[tool(description = "Resolve a tool's required dependencies, dependencies first")]
    async fn resolve_dependencies(
        &self,
        params: Parameters<ToolIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let tools = self
            .orchestrator
            .registry()
            .resolve_dependencies(&params.0.tool_id)
            .map_err(to_mcp)?;
        let ids: Vec<String> = tools.into_iter().map(|t| t.tool_id).collect();
        Self::json(&ids)
    }

    #[tool(description = "Add a dependency edge between two registered tools")]
    async fn add_dependency(
        &self,
        params: Parameters<AddDependencyRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let kind = Self::parse_kind(&req.kind)?;
        self.orchestrator
            .registry()
            .add_dependency(&req.dependent_tool_id, &req.dependency_tool_id, kind)
            .map_err(to_mcp)?;

        Ok(CallToolResult::success(vec![Content::text(format!(
            "{} now {} {}",
            req.dependent_tool_id,
            kind.as_str(),
            req.dependency_tool_id
        ))]))
    }

    #[tool(description = "Record one execution of a tool")]
    async fn record_tool_usage(
        &self,
        params: Parameters<RecordUsageRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let project_id = req.project_id.as_deref().map(Self::parse_uuid).transpose()?;

        let tool = self
            .orchestrator
            .registry()
            .record_usage(
                &req.tool_id,
                RecordUsageInput {
                    project_id,
                    error_message: req.error_message,
                    ..RecordUsageInput::outcome(req.success, req.duration_ms)
                },
            )
            .map_err(to_mcp)?;
        Self::json(&tool)
    }

    #[tool(description = "Deprecate a tool, optionally naming its replacement")]
    async fn deprecate_tool(
        &self,
        params: Parameters<DeprecateToolRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let tool = self
            .orchestrator
            .registry()
            .deprecate(
                &req.tool_id,
                DeprecateToolInput {
                    reason: req.reason,
                    replacement_tool_id: req.replacement_tool_id,
                },
            )
            .map_err(to_mcp)?;
        Self::json(&tool)
    }

    #[tool(description = "Report a vulnerability against a tool")]
    async fn report_vulnerability(
        &self,
        params: Parameters<ReportVulnerabilityRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let vulnerability = self
            .orchestrator
            .registry()
            .report_vulnerability(ReportVulnerabilityInput {
                tool_id: req.tool_id,
                severity: Self::parse_severity(&req.severity)?,
                description: req.description,
                cve_id: req.cve_id,
            })
            .map_err(to_mcp)?;
        Self::json(&vulnerability)
    }

    #[tool(description = "Mark a vulnerability as patched")]
    async fn patch_vulnerability(
        &self,
        params: Parameters<PatchVulnerabilityRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let vulnerability = self
            .orchestrator
            .registry()
            .patch_vulnerability(PatchVulnerabilityInput {
                vulnerability_id: req.vulnerability_id,
                patched_in_version: req.patched_in_version,
            })
            .map_err(to_mcp)?;
        Self::json(&vulnerability)
    }

    #[tool(description = "List every vulnerability reported against a tool")]
    async fn list_vulnerabilities(
        &self,
        params: Parameters<ToolIdRequest>,
    ) -> Result<CallToolResult, McpError> {
        let vulnerabilities = self
            .orchestrator
            .registry()
            .list_vulnerabilities(&params.0.tool_id)
            .map_err(to_mcp)?;
        Self::json(&vulnerabilities)
    }

    #[tool(description = "Check which capabilities lack an eligible tool")]
    async fn analyze_capability_gaps(
        &self,
        params: Parameters<GapAnalysisRequest>,
    ) -> Result<CallToolResult, McpError> {
        let report = self
            .orchestrator
            .registry()
            .gap_analysis(&params.0.capabilities)
            .map_err(to_mcp)?;
        Self::json(&report)
    }

    #[tool(description = "Summarize tool executions over a time window")]
    async fn performance_analytics(
        &self,
        params: Parameters<AnalyticsRequest>,
    ) -> Result<CallToolResult, McpError> {
        let req = params.0;
        let mut filter = AnalyticsFilter {
            tool_id: req.tool_id,
            project_id: req.project_id.as_deref().map(Self::parse_uuid).transpose()?,
            ..AnalyticsFilter::default()
        };
        if let Some(days) = req.days {
            filter.days = days;
        }

        let analytics = self
            .orchestrator
            .registry()
            .performance_analytics(&filter)
            .map_err(to_mcp)?;
        Self::json(&analytics)
    }

    #[tool(description = "Export orchestrator and registry metrics in Prometheus text format")]
    async fn get_metrics(&self) -> Result<CallToolResult, McpError> {
        let Some(metrics) = self.orchestrator.metrics() else {
            return Err(McpError::invalid_params("metrics are not enabled", None));
        };
        let text = metrics
            .encode_text()
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }
}

#[tool_handler]
impl ServerHandler for McpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(
                "VDW orchestrator: drive projects through five human-gated phases and manage the tool registry"
                    .into(),
            ),
            ..Default::default()
        }
    }
}

pub async fn run_stdio_server(orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    use tokio::io::{stdin, stdout};

    tracing::info!("Starting MCP server via stdio");

    let service = McpServer::new(orchestrator);
    let server = service.serve((stdin(), stdout())).await?;

    let quit_reason = server.waiting().await?;
    tracing::info!("MCP server stopped: {:?}", quit_reason);

    Ok(())
}
