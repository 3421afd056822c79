//! Terminal stage of the admission chain.
//!
//! Translates a small set of MCP methods into single upstream REST calls made
//! with the caller's credential. Upstream JSON is returned as-is inside the
//! MCP tool result; there are no task rules here.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::auth::UserContext;
use crate::error::{GatewayError, GatewayResult};
use crate::upstream::UpstreamClient;

/// Protocol revision answered when the client does not name one.
pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";

const SERVER_NAME: &str = "taskgate";

/// Handles one admitted request.
///
/// The gateway calls this only after authentication and rate limiting have
/// passed. Tests substitute their own implementation.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        user: &UserContext,
        method: &str,
        params: Option<Value>,
    ) -> GatewayResult<Value>;
}

// ============================================================================
// Tool arguments
// ============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListProjectsArgs {
    #[serde(default)]
    page: Option<u32>,
    #[serde(default)]
    per_page: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct TaskIdArgs {
    task_id: i64,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CreateTaskArgs {
    project_id: i64,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    due_date: Option<String>,
    #[serde(default)]
    priority: Option<u8>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct UpdateTaskArgs {
    task_id: i64,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    done: Option<bool>,
    #[serde(default)]
    due_date: Option<String>,
    #[serde(default)]
    priority: Option<u8>,
}

/// Body sent upstream on create and update. Absent fields are omitted.
#[derive(Debug, Default, Serialize)]
struct TaskBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    done: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    due_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    priority: Option<u8>,
}

impl TaskBody {
    fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.done.is_none()
            && self.due_date.is_none()
            && self.priority.is_none()
    }
}

#[derive(Debug, Deserialize)]
struct CallParams {
    name: String,
    #[serde(default)]
    arguments: Option<Value>,
}

// ============================================================================
// Tool handler
// ============================================================================

/// MCP method router over the task API.
pub struct ToolHandler {
    upstream: Arc<UpstreamClient>,
}

impl ToolHandler {
    pub fn new(upstream: Arc<UpstreamClient>) -> Self {
        Self { upstream }
    }

    /// Tool descriptors advertised by `tools/list`.
    pub fn tool_definitions() -> Value {
        json!([
            {
                "name": "list_projects",
                "description": "List projects visible to the caller",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "page": {"type": "integer", "minimum": 1},
                        "per_page": {"type": "integer", "minimum": 1}
                    },
                    "additionalProperties": false
                }
            },
            {
                "name": "get_task",
                "description": "Fetch a single task by id",
                "inputSchema": {
                    "type": "object",
                    "properties": {"task_id": {"type": "integer"}},
                    "required": ["task_id"],
                    "additionalProperties": false
                }
            },
            {
                "name": "create_task",
                "description": "Create a task in a project",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "project_id": {"type": "integer"},
                        "title": {"type": "string", "minLength": 1},
                        "description": {"type": "string"},
                        "due_date": {"type": "string", "format": "date-time"},
                        "priority": {"type": "integer", "minimum": 0, "maximum": 5}
                    },
                    "required": ["project_id", "title"],
                    "additionalProperties": false
                }
            },
            {
                "name": "update_task",
                "description": "Update fields of an existing task",
                "inputSchema": {
                    "type": "object",
                    "properties": {
                        "task_id": {"type": "integer"},
                        "title": {"type": "string", "minLength": 1},
                        "description": {"type": "string"},
                        "done": {"type": "boolean"},
                        "due_date": {"type": "string", "format": "date-time"},
                        "priority": {"type": "integer", "minimum": 0, "maximum": 5}
                    },
                    "required": ["task_id"],
                    "additionalProperties": false
                }
            },
            {
                "name": "delete_task",
                "description": "Delete a task by id",
                "inputSchema": {
                    "type": "object",
                    "properties": {"task_id": {"type": "integer"}},
                    "required": ["task_id"],
                    "additionalProperties": false
                }
            }
        ])
    }

    fn initialize(params: Option<&Value>) -> Value {
        let protocol_version = params
            .and_then(|p| p.get("protocolVersion"))
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_PROTOCOL_VERSION);
        json!({
            "protocolVersion": protocol_version,
            "capabilities": {"tools": {"listChanged": false}},
            "serverInfo": {"name": SERVER_NAME, "version": env!("CARGO_PKG_VERSION")}
        })
    }

    async fn call_tool(&self, user: &UserContext, params: Option<Value>) -> GatewayResult<Value> {
        let call: CallParams = parse_args(params.unwrap_or(Value::Null), "tools/call params")?;
        let arguments = call.arguments.unwrap_or_else(|| Value::Object(Map::new()));
        let upstream = self.upstream.authorized(&user.token);

        debug!(tool = %call.name, user_id = user.user_id, "Calling tool");

        let result: Value = match call.name.as_str() {
            "list_projects" => {
                let args: ListProjectsArgs = parse_args(arguments, "list_projects")?;
                let mut query = Vec::new();
                if let Some(page) = args.page {
                    query.push(format!("page={page}"));
                }
                if let Some(per_page) = args.per_page {
                    query.push(format!("per_page={per_page}"));
                }
                let path = if query.is_empty() {
                    "/projects".to_string()
                } else {
                    format!("/projects?{}", query.join("&"))
                };
                upstream.get(&path).await?
            }
            "get_task" => {
                let args: TaskIdArgs = parse_args(arguments, "get_task")?;
                upstream.get(&format!("/tasks/{}", args.task_id)).await?
            }
            "create_task" => {
                let args: CreateTaskArgs = parse_args(arguments, "create_task")?;
                if args.title.trim().is_empty() {
                    return Err(invalid_field("create_task", "title", "must not be blank"));
                }
                check_priority("create_task", args.priority)?;
                let body = TaskBody {
                    title: Some(args.title),
                    description: args.description,
                    done: None,
                    due_date: args.due_date,
                    priority: args.priority,
                };
                upstream
                    .put(&format!("/projects/{}/tasks", args.project_id), &body)
                    .await?
            }
            "update_task" => {
                let args: UpdateTaskArgs = parse_args(arguments, "update_task")?;
                if args.title.as_deref().is_some_and(|t| t.trim().is_empty()) {
                    return Err(invalid_field("update_task", "title", "must not be blank"));
                }
                check_priority("update_task", args.priority)?;
                let body = TaskBody {
                    title: args.title,
                    description: args.description,
                    done: args.done,
                    due_date: args.due_date,
                    priority: args.priority,
                };
                if body.is_empty() {
                    return Err(GatewayError::validation(
                        "update_task requires at least one field to change",
                    ));
                }
                upstream
                    .post(&format!("/tasks/{}", args.task_id), &body)
                    .await?
            }
            "delete_task" => {
                let args: TaskIdArgs = parse_args(arguments, "delete_task")?;
                upstream.delete(&format!("/tasks/{}", args.task_id)).await?
            }
            other => {
                return Err(GatewayError::not_found(format!("Unknown tool: {other}"))
                    .with_details(json!({"tool": other})));
            }
        };

        Ok(tool_result(result))
    }
}

#[async_trait]
impl RequestHandler for ToolHandler {
    async fn handle(
        &self,
        user: &UserContext,
        method: &str,
        params: Option<Value>,
    ) -> GatewayResult<Value> {
        match method {
            "initialize" => Ok(Self::initialize(params.as_ref())),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({"tools": Self::tool_definitions()})),
            "tools/call" => self.call_tool(user, params).await,
            other => Err(GatewayError::not_found(format!("Method not found: {other}"))
                .with_details(json!({"method": other}))),
        }
    }
}

impl std::fmt::Debug for ToolHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandler")
            .field("upstream", &self.upstream.api_base())
            .finish()
    }
}

/// Wrap upstream JSON in an MCP tool result.
fn tool_result(value: Value) -> Value {
    let text = value.to_string();
    json!({
        "content": [{"type": "text", "text": text}],
        "structuredContent": value,
        "isError": false
    })
}

fn parse_args<T: DeserializeOwned>(value: Value, what: &str) -> GatewayResult<T> {
    serde_json::from_value(value).map_err(|e| {
        GatewayError::validation(format!("Invalid arguments for {what}: {e}"))
            .with_details(json!({"target": what}))
    })
}

fn invalid_field(tool: &str, field: &str, problem: &str) -> GatewayError {
    GatewayError::validation(format!("Invalid arguments for {tool}: {field} {problem}"))
        .with_details(json!({"target": tool, "field": field}))
}

fn check_priority(tool: &str, priority: Option<u8>) -> GatewayResult<()> {
    match priority {
        Some(p) if p > 5 => Err(invalid_field(tool, "priority", "must be between 0 and 5")),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::error::ErrorKind;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn user() -> UserContext {
        UserContext {
            user_id: 1,
            username: "alice".into(),
            email: None,
            token: "tok-alice".into(),
        }
    }

    fn handler(base_url: &str) -> ToolHandler {
        let config = UpstreamConfig {
            base_url: base_url.to_string(),
            retry_delay_ms: 10,
            ..UpstreamConfig::default()
        };
        ToolHandler::new(Arc::new(UpstreamClient::new(config).unwrap()))
    }

    fn call(name: &str, arguments: Value) -> Option<Value> {
        Some(json!({"name": name, "arguments": arguments}))
    }

    #[tokio::test]
    async fn test_initialize_echoes_protocol_version() {
        let h = handler("http://127.0.0.1:1");
        let result = h
            .handle(&user(), "initialize", Some(json!({"protocolVersion": "2025-03-26"})))
            .await
            .unwrap();
        assert_eq!(result["protocolVersion"], "2025-03-26");
        assert_eq!(result["serverInfo"]["name"], "taskgate");

        let result = h.handle(&user(), "initialize", None).await.unwrap();
        assert_eq!(result["protocolVersion"], DEFAULT_PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn test_tools_list_names() {
        let h = handler("http://127.0.0.1:1");
        let result = h.handle(&user(), "tools/list", None).await.unwrap();
        let names: Vec<&str> = result["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            ["list_projects", "get_task", "create_task", "update_task", "delete_task"]
        );
    }

    #[tokio::test]
    async fn test_unknown_method_is_not_found() {
        let h = handler("http://127.0.0.1:1");
        let err = h.handle(&user(), "resources/list", None).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_unknown_tool_is_not_found() {
        let h = handler("http://127.0.0.1:1");
        let err = h
            .handle(&user(), "tools/call", call("archive_everything", json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_bad_arguments_are_validation_errors() {
        let h = handler("http://127.0.0.1:1");
        for params in [
            None,
            call("get_task", json!({})),
            call("get_task", json!({"task_id": "seven"})),
            call("get_task", json!({"task_id": 7, "extra": true})),
            call("create_task", json!({"project_id": 1, "title": "  "})),
            call("create_task", json!({"project_id": 1, "title": "x", "priority": 9})),
            call("update_task", json!({"task_id": 1})),
        ] {
            let err = h.handle(&user(), "tools/call", params.clone()).await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "params: {params:?}");
        }
    }

    #[tokio::test]
    async fn test_get_task_forwards_with_caller_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/tasks/42"))
            .and(header("authorization", "Bearer tok-alice"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42, "title": "t"})))
            .expect(1)
            .mount(&server)
            .await;

        let result = handler(&server.uri())
            .handle(&user(), "tools/call", call("get_task", json!({"task_id": 42})))
            .await
            .unwrap();
        assert_eq!(result["structuredContent"]["id"], 42);
        assert_eq!(result["content"][0]["type"], "text");
    }

    #[tokio::test]
    async fn test_list_projects_paging() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/projects"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"id": 1}])))
            .expect(1)
            .mount(&server)
            .await;

        let result = handler(&server.uri())
            .handle(&user(), "tools/call", call("list_projects", json!({"page": 2})))
            .await
            .unwrap();
        assert_eq!(result["structuredContent"][0]["id"], 1);
    }

    #[tokio::test]
    async fn test_create_task_uses_put_on_project() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/projects/3/tasks"))
            .and(body_json(json!({"title": "Write docs", "priority": 2})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 9})))
            .expect(1)
            .mount(&server)
            .await;

        let result = handler(&server.uri())
            .handle(
                &user(),
                "tools/call",
                call("create_task", json!({"project_id": 3, "title": "Write docs", "priority": 2})),
            )
            .await
            .unwrap();
        assert_eq!(result["structuredContent"]["id"], 9);
    }

    #[tokio::test]
    async fn test_update_task_sends_only_given_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/tasks/5"))
            .and(body_json(json!({"done": true})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 5, "done": true})))
            .expect(1)
            .mount(&server)
            .await;

        handler(&server.uri())
            .handle(&user(), "tools/call", call("update_task", json!({"task_id": 5, "done": true})))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_upstream_errors_are_mapped() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/api/v1/tasks/404"))
            .respond_with(
                ResponseTemplate::new(404).set_body_json(json!({"message": "The task does not exist."})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let err = handler(&server.uri())
            .handle(&user(), "tools/call", call("delete_task", json!({"task_id": 404})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.message(), "The task does not exist.");
    }
}
