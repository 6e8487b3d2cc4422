use std::sync::Arc;
use std::time::{Duration, Instant};

use rmcp::model::ErrorData as McpError;
use rmcp::{RoleServer, ServerHandler, model::*, service::RequestContext};
use schemars::{JsonSchema, SchemaGenerator};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::elicitation::{ActionEnvelope, ResolutionStatus};
use crate::error::InputError;
use crate::executor::{
    ActionExecutor, QuickActionRequest, ScriptRequest, SearchRequest, TemplateRequest,
};

pub const TOOL_NAMES: [&str; 4] = [
    "search_entities",
    "quick_action",
    "run_placeholder_script",
    "render_template",
];

// schemars 0.9 root schema as the JSON object rmcp expects
fn schema_for_type<T: JsonSchema>() -> JsonObject {
    let schema = SchemaGenerator::default().into_root_schema_for::<T>();
    match serde_json::to_value(schema) {
        Ok(serde_json::Value::Object(object)) => object,
        _ => JsonObject::new(),
    }
}

// =============================================================================
// Interceptors
// =============================================================================

/// Observes every tool invocation. Both hooks run inline on the request path.
pub trait ToolInterceptor: Send + Sync {
    fn before(&self, _tool: &str, _arguments: &JsonObject) {}

    fn after(&self, _tool: &str, _outcome: &Result<CallToolResult, McpError>, _elapsed: Duration) {}
}

pub struct TracingInterceptor;

impl ToolInterceptor for TracingInterceptor {
    fn before(&self, tool: &str, arguments: &JsonObject) {
        tracing::debug!(%tool, ?arguments, "tool call started");
    }

    fn after(&self, tool: &str, outcome: &Result<CallToolResult, McpError>, elapsed: Duration) {
        let elapsed_ms = elapsed.as_millis() as u64;
        match outcome {
            Ok(result) if result.is_error == Some(true) => {
                tracing::warn!(%tool, elapsed_ms, "tool call returned a failure envelope");
            }
            Ok(_) => tracing::info!(%tool, elapsed_ms, "tool call finished"),
            Err(error) => tracing::error!(%tool, elapsed_ms, error = %error.message, "tool call rejected"),
        }
    }
}

// =============================================================================
// MCP Service
// =============================================================================

#[derive(Clone)]
pub struct ResolverService {
    executor: Arc<ActionExecutor>,
    interceptors: Vec<Arc<dyn ToolInterceptor>>,
}

impl ResolverService {
    pub fn new(executor: Arc<ActionExecutor>) -> Self {
        let interceptors: Vec<Arc<dyn ToolInterceptor>> = vec![Arc::new(TracingInterceptor)];
        Self::with_interceptors(executor, interceptors)
    }

    /// Interceptors run in order before the call and in the same order after it.
    pub fn with_interceptors(
        executor: Arc<ActionExecutor>,
        interceptors: Vec<Arc<dyn ToolInterceptor>>,
    ) -> Self {
        Self {
            executor,
            interceptors,
        }
    }

    pub fn tools() -> Vec<Tool> {
        vec![
            Tool::new(
                "search_entities",
                "Rank entities against weighted search terms without acting. Returns the candidates and the decision a quick action would take.",
                Arc::new(schema_for_type::<SearchRequest>()),
            ),
            Tool::new(
                "quick_action",
                "Resolve a target entity from search terms and call a service on it. Returns needs_elicitation when the match is not confident; reply with selected_entity_id, confirm and the echoed elicitation_state.",
                Arc::new(schema_for_type::<QuickActionRequest>()),
            ),
            Tool::new(
                "run_placeholder_script",
                "Resolve every placeholder a script declares in its fields, then run the script with the resolved entity ids as variables.",
                Arc::new(schema_for_type::<ScriptRequest>()),
            ),
            Tool::new(
                "render_template",
                "Render a Home Assistant template and return the result.",
                Arc::new(schema_for_type::<TemplateRequest>()),
            ),
        ]
    }

    fn format_json_result<T: Serialize>(&self, data: &T) -> Result<CallToolResult, McpError> {
        let pretty_json = serde_json::to_string_pretty(data)
            .map_err(|e| McpError::internal_error(e.to_string(), None))?;
        Ok(CallToolResult::success(vec![Content::text(pretty_json)]))
    }

    /// Failed envelopes are still structured output, flagged as tool errors.
    fn envelope_result(&self, envelope: &ActionEnvelope) -> Result<CallToolResult, McpError> {
        let mut result = self.format_json_result(envelope)?;
        if envelope.status == ResolutionStatus::Failed {
            result.is_error = Some(true);
        }
        Ok(result)
    }

    /// Run one tool call through the interceptor chain.
    pub async fn invoke(&self, name: &str, arguments: JsonObject) -> Result<CallToolResult, McpError> {
        for interceptor in &self.interceptors {
            interceptor.before(name, &arguments);
        }
        let started = Instant::now();
        let outcome = self.dispatch(name, arguments).await;
        let elapsed = started.elapsed();
        for interceptor in &self.interceptors {
            interceptor.after(name, &outcome, elapsed);
        }
        outcome
    }

    async fn dispatch(&self, name: &str, arguments: JsonObject) -> Result<CallToolResult, McpError> {
        match name {
            "search_entities" => {
                let args: SearchRequest = decode(
                    name,
                    arguments,
                    r#"{"search_terms": "string | [string | {value, weight}] | {term: weight}", "entity_domain": "string (optional)", "min_confidence": number (optional), "limit": number (optional)}"#,
                )?;
                match self.executor.search_entities(args).await {
                    Ok(preview) => self.format_json_result(&preview),
                    Err(failure) => self.envelope_result(&ActionEnvelope::failed(failure, Vec::new())),
                }
            }
            "quick_action" => {
                let args: QuickActionRequest = decode(
                    name,
                    arguments,
                    r#"{"domain": "string", "service": "string", "search_terms": "string | [string | {value, weight}] | {term: weight}", "entity_domain": "string (optional)", "service_data": object (optional), "selected_entity_id": "string (optional)", "confirm": boolean (optional), "cancel": boolean (optional), "elicitation_state": object (optional)}"#,
                )?;
                let envelope = self.executor.quick_action(args).await;
                self.envelope_result(&envelope)
            }
            "run_placeholder_script" => {
                let args: ScriptRequest = decode(
                    name,
                    arguments,
                    r#"{"script_id": "string", "placeholder_overrides": object (optional), "selections": {placeholder: entity_id} (optional), "confirm": boolean (optional), "cancel": boolean (optional), "variables": object (optional), "elicitation_state": object (optional)}"#,
                )?;
                let envelope = self.executor.run_placeholder_script(args).await;
                self.envelope_result(&envelope)
            }
            "render_template" => {
                let args: TemplateRequest = decode(name, arguments, r#"{"template": "string"}"#)?;
                match self.executor.render_template(args).await {
                    Ok(rendered) => self.format_json_result(&serde_json::json!({ "result": rendered })),
                    Err(failure) => self.envelope_result(&ActionEnvelope::failed(failure, Vec::new())),
                }
            }
            unknown_tool => Err(McpError::invalid_params(
                format!(
                    "Unknown tool: '{}'. Available tools: {}",
                    unknown_tool,
                    TOOL_NAMES.join(", ")
                ),
                None,
            )),
        }
    }
}

fn decode<T: DeserializeOwned>(tool: &str, arguments: JsonObject, expected: &str) -> Result<T, McpError> {
    serde_json::from_value(serde_json::Value::Object(arguments)).map_err(|e| {
        InputError::new(tool, format!("Invalid arguments - {}. Expected: {}", e, expected)).into()
    })
}

impl ServerHandler for ResolverService {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation::from_build_env(),
            instructions: Some(
                "Resolves Home Assistant entities from fuzzy, weighted search terms and acts on them. When a match is not confident the response asks for clarification instead of guessing.".into(),
            ),
        }
    }

    async fn initialize(
        &self,
        _request: InitializeRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<InitializeResult, McpError> {
        if let Some(http_request_part) = context.extensions.get::<axum::http::request::Parts>() {
            let initialize_headers = &http_request_part.headers;
            let initialize_uri = &http_request_part.uri;
            tracing::info!(?initialize_headers, %initialize_uri, "initialize from http server");
        }
        Ok(self.get_info())
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        Ok(ListToolsResult {
            tools: Self::tools(),
            next_cursor: None,
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = request.arguments.unwrap_or_default();
        self.invoke(request.name.as_ref(), arguments).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::HomeAssistantApi;
    use crate::config::ResolverSettings;
    use crate::entity::EntityState;
    use crate::error::ClientError;
    use async_trait::async_trait;
    use serde_json::{Value, json};
    use std::sync::Mutex;

    struct StaticApi;

    #[async_trait]
    impl HomeAssistantApi for StaticApi {
        async fn get_states(&self) -> Result<Vec<EntityState>, ClientError> {
            Ok(vec![
                EntityState::new("light.porch", Some("Porch Light")),
                EntityState::new("switch.heater", Some("Heater")),
            ])
        }

        async fn get_entity_state(&self, entity_id: &str) -> Result<Option<EntityState>, ClientError> {
            Ok(Some(EntityState::new(entity_id, None)))
        }

        async fn call_service(&self, _: &str, _: &str, _: Value) -> Result<Value, ClientError> {
            Ok(json!([]))
        }

        async fn get_script_config(&self, object_id: &str) -> Result<Value, ClientError> {
            Err(ClientError::NotFound(object_id.into()))
        }

        async fn render_template(&self, _: &str) -> Result<Value, ClientError> {
            Ok(json!("on"))
        }
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ToolInterceptor for Recorder {
        fn before(&self, tool: &str, _arguments: &JsonObject) {
            self.events.lock().unwrap().push(format!("before:{tool}"));
        }

        fn after(&self, tool: &str, outcome: &Result<CallToolResult, McpError>, _elapsed: Duration) {
            self.events
                .lock()
                .unwrap()
                .push(format!("after:{tool}:{}", outcome.is_ok()));
        }
    }

    fn executor() -> Arc<ActionExecutor> {
        Arc::new(ActionExecutor::new(Arc::new(StaticApi), ResolverSettings::default()))
    }

    fn service() -> ResolverService {
        ResolverService::new(executor())
    }

    fn args(value: Value) -> JsonObject {
        value.as_object().cloned().unwrap()
    }

    fn text(result: &CallToolResult) -> Value {
        let raw = result.content[0].as_text().unwrap().text.clone();
        serde_json::from_str(&raw).unwrap()
    }

    #[test]
    fn every_tool_has_an_object_schema() {
        let tools = ResolverService::tools();
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_ref()).collect();
        assert_eq!(names, TOOL_NAMES);
        for tool in &tools {
            assert_eq!(tool.input_schema.get("type"), Some(&json!("object")), "{}", tool.name);
        }
    }

    #[tokio::test]
    async fn unknown_tool_lists_available_tools() {
        let err = service().invoke("entity_find", JsonObject::new()).await.unwrap_err();
        assert!(err.message.contains("entity_find"));
        assert!(err.message.contains("run_placeholder_script"));
    }

    #[tokio::test]
    async fn bad_arguments_name_the_tool() {
        let err = service()
            .invoke("quick_action", args(json!({"domain": 3})))
            .await
            .unwrap_err();
        assert!(err.message.starts_with("quick_action: Invalid arguments"));
    }

    #[tokio::test]
    async fn quick_action_returns_the_envelope() {
        let result = service()
            .invoke(
                "quick_action",
                args(json!({"domain": "light", "service": "turn_on", "search_terms": "porch"})),
            )
            .await
            .unwrap();
        assert_ne!(result.is_error, Some(true));
        let body = text(&result);
        assert_eq!(body["status"], "resolved");
        assert_eq!(body["resolved_entities"]["target"], "light.porch");
    }

    #[tokio::test]
    async fn failed_envelopes_are_flagged() {
        let result = service()
            .invoke("run_placeholder_script", args(json!({"script_id": "script.nope"})))
            .await
            .unwrap();
        assert_eq!(result.is_error, Some(true));
        assert_eq!(text(&result)["error"]["kind"], "entity_not_found");
    }

    #[tokio::test]
    async fn interceptors_wrap_every_call() {
        let recorder = Arc::new(Recorder::default());
        let interceptors: Vec<Arc<dyn ToolInterceptor>> =
            vec![Arc::new(TracingInterceptor), recorder.clone()];
        let service = ResolverService::with_interceptors(executor(), interceptors);

        service
            .invoke("render_template", args(json!({"template": "{{ states('light.porch') }}"})))
            .await
            .unwrap();
        let _ = service.invoke("nope", JsonObject::new()).await;

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                "before:render_template",
                "after:render_template:true",
                "before:nope",
                "after:nope:false",
            ]
        );
    }
}
