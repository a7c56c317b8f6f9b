/// Node action dispatcher
///
/// Maps a node's declared type to its handler:
/// - Triggers (`cron`, `webhook`, `httpTrigger`, `trigger`): simulated trigger payload
/// - `errorTrigger`: passes the caller input through
/// - `if`: condition evaluator
/// - `merge`: combined payload of its predecessors' outputs
/// - `httpRequest`: outbound HTTP call via reqwest
/// - Integrations (`gmail`, `gsheets`, `github`, `app`, AI models): credential
///   resolution plus a registered connector
/// - Anything else: short randomized delay, then a simulated success
///
/// Every handler yields `(outputs, log, error)`; the engine decides what a
/// failure means for the run.

use crate::{
    runtime::{
        condition::{ConditionError, ConditionEvaluator, IF_RESULT_FIELD},
        context::{OutputStore, Scope},
        integrations::{action_spec, ConnectorRegistry, CredentialPayload, Decryptor},
    },
    workflow::{
        store::CredentialStore,
        types::{is_chat_model, FlowNode, NodeKind},
        value::{to_plain_string, ValueExt},
    },
};
use rand::Rng;
use reqwest::Method;
use serde_json::{json, Map, Value};
use std::{
    ops::RangeInclusive,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;

/// Delay range (ms) for placeholder node types
pub const PLACEHOLDER_DELAY_MS: RangeInclusive<u64> = 50..=250;

/// Why a node failed
#[derive(Debug, thiserror::Error)]
pub enum NodeError {
    /// Missing or malformed node config
    #[error("invalid node config: {0}")]
    InvalidConfig(String),

    /// Missing credential, provider mismatch, or decryption failure
    #[error("credential error: {0}")]
    Credential(String),

    /// Non-success response (status 0 when no response was received)
    #[error("external call failed (status {status}): {message}")]
    ExternalCall { status: u16, message: String },

    #[error("condition evaluation failed: {0}")]
    Condition(#[from] ConditionError),

    /// The run's cancellation token fired while the node was running
    #[error("node execution canceled")]
    Canceled,
}

impl NodeError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, NodeError::Canceled)
    }
}

/// Result of dispatching one node
#[derive(Debug)]
pub struct NodeOutcome {
    /// Outputs recorded for the node (also on failure)
    pub outputs: Value,
    pub log: String,
    pub error: Option<NodeError>,
}

impl NodeOutcome {
    pub fn success(outputs: Value, log: impl Into<String>) -> Self {
        Self {
            outputs,
            log: log.into(),
            error: None,
        }
    }

    pub fn failed(outputs: Value, log: impl Into<String>, error: NodeError) -> Self {
        Self {
            outputs,
            log: log.into(),
            error: Some(error),
        }
    }

    /// Failure with the generic `{status: 0, error}` envelope
    fn from_error(error: NodeError) -> Self {
        let message = error.to_string();
        Self::failed(json!({"status": 0, "error": message}), message, error)
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Everything a handler may read about the run so far
#[derive(Debug, Clone, Copy)]
pub struct NodeContext<'a> {
    pub run_id: &'a str,
    pub step_key: &'a str,
    /// Caller input handed down from the previous node
    pub input: &'a Value,
    /// Outputs recorded so far in this run
    pub outputs: &'a OutputStore,
    /// Static predecessors of the node (merge inputs)
    pub predecessors: &'a [String],
    /// Lookup scope over `input` and `outputs`, built once per node
    pub scope: &'a Scope,
}

/// Resolved `httpRequest` config
#[derive(Debug, Clone)]
struct HttpRequestSpec {
    url: String,
    method: Method,
    headers: Vec<(String, String)>,
    query: Vec<(String, String)>,
    body: Option<Value>,
    timeout: Duration,
    auth: Option<Value>,
    credential_id: Option<String>,
}

impl HttpRequestSpec {
    fn describe(&self) -> Map<String, Value> {
        let mut fields = Map::new();
        fields.insert("url".into(), json!(self.url));
        fields.insert("method".into(), json!(self.method.as_str()));
        fields.insert(
            "headers".into(),
            Value::Object(
                self.headers
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect(),
            ),
        );
        fields.insert(
            "query".into(),
            Value::Object(
                self.query
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect(),
            ),
        );
        if let Some(body) = &self.body {
            fields.insert("body".into(), body.clone());
        }
        fields
    }
}

/// Node executor that dispatches by node type
///
/// Holds the shared HTTP client and the credential/connector collaborators.
pub struct NodeExecutor {
    client: reqwest::Client,
    http_timeout: Duration,
    credentials: Arc<dyn CredentialStore>,
    decryptor: Arc<dyn Decryptor>,
    connectors: ConnectorRegistry,
    placeholder_delay: RangeInclusive<u64>,
}

impl NodeExecutor {
    /// Create a node executor with its collaborators
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        decryptor: Arc<dyn Decryptor>,
        connectors: ConnectorRegistry,
        http_timeout: Duration,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            http_timeout,
            credentials,
            decryptor,
            connectors,
            placeholder_delay: PLACEHOLDER_DELAY_MS,
        })
    }

    /// Override the placeholder delay range (milliseconds)
    pub fn with_placeholder_delay(mut self, range: RangeInclusive<u64>) -> Self {
        self.placeholder_delay = range;
        self
    }

    /// Node-specific fields added to the step-input envelope
    pub fn describe_input(&self, node: &FlowNode, ctx: &NodeContext<'_>) -> Map<String, Value> {
        match node.kind() {
            NodeKind::HttpRequest => self
                .http_spec(&node.config, ctx.scope)
                .map(|spec| spec.describe())
                .unwrap_or_default(),
            NodeKind::Integration => {
                let mut fields = Map::new();
                if let Ok(key) = integration_key(node) {
                    fields.insert("action".into(), json!(key));
                }
                fields
            }
            NodeKind::Merge => {
                let mut fields = Map::new();
                fields.insert("predecessors".into(), json!(ctx.predecessors));
                fields
            }
            _ => Map::new(),
        }
    }

    /// Execute a single node, racing the handler against cancellation
    pub async fn execute_node(
        &self,
        node: &FlowNode,
        ctx: NodeContext<'_>,
        cancel: &CancellationToken,
    ) -> NodeOutcome {
        tracing::info!("🚀 Starting node execution: {} (type: {}, {} of run {})",
            node.id, node.node_type, ctx.step_key, ctx.run_id);
        if cancel.is_cancelled() {
            return NodeOutcome::from_error(NodeError::Canceled);
        }

        let start_time = Instant::now();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => NodeOutcome::from_error(NodeError::Canceled),
            outcome = self.dispatch(node, ctx) => outcome,
        };
        let duration = start_time.elapsed();

        match &outcome.error {
            None => {
                tracing::info!("✅ Node execution completed: {} in {:?}", node.id, duration);
                tracing::debug!("📤 Output data: {}", outcome.outputs);
            }
            Some(NodeError::Canceled) => {
                tracing::warn!("🛑 Node execution canceled: {} after {:?}", node.id, duration);
            }
            Some(e) => {
                tracing::error!("❌ Node execution failed: {} in {:?} - Error: {}", node.id, duration, e);
            }
        }
        outcome
    }

    async fn dispatch(&self, node: &FlowNode, ctx: NodeContext<'_>) -> NodeOutcome {
        let result = match node.kind() {
            NodeKind::Trigger => Ok(self.execute_trigger(node, &ctx)),
            NodeKind::ErrorTrigger => Ok(NodeOutcome::success(
                ctx.input.clone(),
                "error trigger passed input through",
            )),
            NodeKind::If => Ok(self.execute_if(node, &ctx)),
            NodeKind::Merge => Ok(self.execute_merge(&ctx)),
            NodeKind::HttpRequest => self.execute_http_request(node, &ctx).await,
            NodeKind::Integration => self.execute_integration(node, &ctx).await,
            NodeKind::Unknown => Ok(self.execute_placeholder(node).await),
        };
        result.unwrap_or_else(NodeOutcome::from_error)
    }

    fn execute_trigger(&self, node: &FlowNode, ctx: &NodeContext<'_>) -> NodeOutcome {
        let payload = if ctx.input.is_null() {
            json!({})
        } else {
            ctx.input.clone()
        };
        let mut outputs = json!({
            "trigger": node.node_type,
            "fired_at": chrono::Utc::now().to_rfc3339(),
            "payload": payload,
        });
        if let (Some(expression), Some(map)) = (node.config.str_at("expression"), outputs.as_object_mut()) {
            map.insert("expression".into(), json!(expression));
        }
        NodeOutcome::success(outputs, format!("{} trigger fired", node.node_type))
    }

    fn execute_if(&self, node: &FlowNode, ctx: &NodeContext<'_>) -> NodeOutcome {
        tracing::debug!("🔀 Evaluating conditions for if node: {}", node.id);
        let evaluated = ConditionEvaluator::from_config(&node.config)
            .and_then(|evaluator| evaluator.evaluate(ctx.scope));
        match evaluated {
            Ok(report) => NodeOutcome::success(
                report.to_outputs(),
                format!(
                    "conditions evaluated to {} ({} of {} checked, {})",
                    report.result,
                    report.evaluated,
                    report.total,
                    report.combine.as_str()
                ),
            ),
            Err(e) => {
                let message = e.to_string();
                NodeOutcome::failed(
                    json!({IF_RESULT_FIELD: false, "error": message}),
                    message,
                    NodeError::Condition(e),
                )
            }
        }
    }

    fn execute_merge(&self, ctx: &NodeContext<'_>) -> NodeOutcome {
        let mut merged = Vec::new();
        let mut by_node = Map::new();
        for predecessor in ctx.predecessors {
            if by_node.contains_key(predecessor) {
                continue;
            }
            if let Some(outputs) = ctx.outputs.get(predecessor) {
                merged.push(outputs.clone());
                by_node.insert(predecessor.clone(), outputs.clone());
            }
        }
        let log = format!("merged {} input(s)", merged.len());
        NodeOutcome::success(
            json!({
                "merged": merged,
                "by_node": by_node,
                "steps": ctx.outputs.snapshot(),
            }),
            log,
        )
    }

    async fn execute_placeholder(&self, node: &FlowNode) -> NodeOutcome {
        let delay_ms = {
            let (low, high) = (*self.placeholder_delay.start(), *self.placeholder_delay.end());
            if high > low {
                rand::rng().random_range(low..=high)
            } else {
                low
            }
        };
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        NodeOutcome::success(
            json!({"status": 200, "data": {"ok": true}}),
            format!("simulated '{}' node in {}ms", node.node_type, delay_ms),
        )
    }

    fn http_spec(&self, config: &Value, scope: &Scope) -> Result<HttpRequestSpec, NodeError> {
        let config = scope.interpolate_value(config);
        let url = config
            .str_at("url")
            .map(str::trim)
            .ok_or_else(|| NodeError::InvalidConfig("httpRequest requires 'url'".into()))?
            .to_string();
        let method_name = config.str_at("method").unwrap_or("GET").trim().to_uppercase();
        let method = Method::from_bytes(method_name.as_bytes())
            .map_err(|_| NodeError::InvalidConfig(format!("unsupported HTTP method: {}", method_name)))?;

        let pairs = |key: &str| -> Vec<(String, String)> {
            config
                .object_at(key)
                .map(|map| {
                    map.iter()
                        .filter(|(_, v)| !v.is_null())
                        .map(|(k, v)| (k.clone(), to_plain_string(v)))
                        .collect()
                })
                .unwrap_or_default()
        };

        let timeout = config
            .get("timeoutMs")
            .and_then(|v| v.as_u64().or_else(|| v.as_str().and_then(|s| s.trim().parse().ok())))
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(self.http_timeout);

        let body = match config.get("body") {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) if s.trim().is_empty() => None,
            Some(Value::String(s)) => Some(serde_json::from_str(s).unwrap_or_else(|_| json!(s))),
            Some(other) => Some(other.clone()),
        };

        Ok(HttpRequestSpec {
            url,
            method,
            headers: pairs("headers"),
            query: pairs("query"),
            body,
            timeout,
            auth: config.get("auth").filter(|v| v.is_object()).cloned(),
            credential_id: config.str_at("credentialId").map(str::to_string),
        })
    }

    async fn execute_http_request(
        &self,
        node: &FlowNode,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        tracing::debug!("🌐 Executing httpRequest node: {}", node.id);
        let spec = self.http_spec(&node.config, ctx.scope)?;
        let credentials = match &spec.credential_id {
            Some(id) => Some(self.resolve_credential(id, None, None).await?),
            None => None,
        };

        tracing::debug!("🌍 HTTP Request: {} {}", spec.method, spec.url);
        let mut request = self
            .client
            .request(spec.method.clone(), &spec.url)
            .timeout(spec.timeout);
        for (name, value) in &spec.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !spec.query.is_empty() {
            request = request.query(&spec.query);
        }
        request = apply_auth(request, spec.auth.as_ref(), credentials.as_ref())?;
        if let Some(body) = &spec.body {
            request = match body {
                Value::String(text) => request
                    .header("Content-Type", "text/plain")
                    .body(text.clone()),
                other => request.json(other),
            };
        }

        let started = Instant::now();
        let response = request.send().await.map_err(|e| NodeError::ExternalCall {
            status: 0,
            message: if e.is_timeout() {
                format!("request to {} timed out after {:?}", spec.url, spec.timeout)
            } else {
                format!("request to {} failed: {}", spec.url, e)
            },
        })?;

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), json!(s))))
            .collect();
        let text = response.text().await.map_err(|e| NodeError::ExternalCall {
            status: status.as_u16(),
            message: format!("failed to read response body: {}", e),
        })?;
        let data = serde_json::from_str::<Value>(&text).unwrap_or(Value::String(text));
        let duration_ms = started.elapsed().as_millis() as u64;

        tracing::debug!("📡 Response status: {}", status);
        let outputs = json!({
            "status": status.as_u16(),
            "headers": headers,
            "data": data,
            "meta": {"duration_ms": duration_ms},
        });
        let log = format!("{} {} → {} in {}ms", spec.method, spec.url, status.as_u16(), duration_ms);

        if status.is_success() {
            Ok(NodeOutcome::success(outputs, log))
        } else {
            let error = NodeError::ExternalCall {
                status: status.as_u16(),
                message: format!("{} {} returned {}", spec.method, spec.url, status),
            };
            Ok(NodeOutcome::failed(outputs, log, error))
        }
    }

    async fn execute_integration(
        &self,
        node: &FlowNode,
        ctx: &NodeContext<'_>,
    ) -> Result<NodeOutcome, NodeError> {
        let key = integration_key(node)?;
        let spec = action_spec(&key)
            .ok_or_else(|| NodeError::InvalidConfig(format!("unsupported integration action: {}", key)))?;
        tracing::debug!("🔗 Executing integration {} for node: {}", key, node.id);

        let config = ctx.scope.interpolate_value(&node.config);
        for field in spec.required {
            if config.get(*field).map_or(true, is_blank) {
                return Err(NodeError::InvalidConfig(format!("{} requires '{}'", key, field)));
            }
        }

        let credential_id = config
            .str_at("credentialId")
            .ok_or_else(|| NodeError::Credential(format!("{} requires 'credentialId'", key)))?;
        let app = key.split('.').next().unwrap_or_default();
        let credentials = self
            .resolve_credential(credential_id, Some(spec.provider), Some(app))
            .await?;

        let connector = self
            .connectors
            .get(&key)
            .ok_or_else(|| NodeError::InvalidConfig(format!("no connector registered for {}", key)))?;

        let started = Instant::now();
        let called = connector.execute(&config, &credentials).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let outcome = match called {
            Ok(response) => {
                let outputs = json!({
                    "status": response.status,
                    "data": response.data,
                    "meta": {"duration_ms": duration_ms},
                });
                let log = if response.log.is_empty() {
                    format!("{} → {} in {}ms", key, response.status, duration_ms)
                } else {
                    response.log.clone()
                };
                if response.is_success() {
                    NodeOutcome::success(outputs, log)
                } else {
                    let error = NodeError::ExternalCall {
                        status: response.status,
                        message: format!("{} returned status {}", key, response.status),
                    };
                    NodeOutcome::failed(outputs, log, error)
                }
            }
            Err(e) => {
                let message = format!("{} failed: {}", key, e);
                NodeOutcome::failed(
                    json!({"status": 0, "error": message}),
                    message.clone(),
                    NodeError::ExternalCall { status: 0, message },
                )
            }
        };
        Ok(outcome)
    }

    /// Load and decrypt a credential, checking its provider when one is expected
    async fn resolve_credential(
        &self,
        credential_id: &str,
        provider: Option<&str>,
        app: Option<&str>,
    ) -> Result<CredentialPayload, NodeError> {
        let credential = self
            .credentials
            .get(credential_id)
            .await
            .map_err(|e| NodeError::Credential(format!("failed to load credential {}: {}", credential_id, e)))?
            .ok_or_else(|| NodeError::Credential(format!("credential not found: {}", credential_id)))?;

        if let Some(expected) = provider {
            let actual = credential.provider.trim();
            let matches = actual.eq_ignore_ascii_case(expected)
                || app.is_some_and(|app| actual.eq_ignore_ascii_case(app));
            if !matches {
                return Err(NodeError::Credential(format!(
                    "credential {} is for provider '{}', expected '{}'",
                    credential_id, actual, expected
                )));
            }
        }

        tracing::debug!("🔐 Using credential {} (provider: {})", credential_id, credential.provider);
        self.decryptor
            .decrypt(&credential.encrypted_payload)
            .await
            .map_err(|e| NodeError::Credential(format!("failed to decrypt credential {}: {}", credential_id, e)))
    }
}

/// Connector key for an integration node
pub fn integration_key(node: &FlowNode) -> Result<String, NodeError> {
    let config = &node.config;
    let key = match node.node_type.as_str() {
        "gmail" => format!("gmail.{}", config.str_at("action").unwrap_or("sendEmail")),
        "gsheets" => format!("gsheets.{}", config.str_at("action").unwrap_or("appendRow")),
        "github" => format!("github.{}", config.str_at("action").unwrap_or("createIssue")),
        "app" => {
            let action = config
                .str_at("action")
                .ok_or_else(|| NodeError::InvalidConfig("app node requires 'action'".into()))?;
            if action.contains('.') {
                action.to_string()
            } else {
                let app = config
                    .str_at("app")
                    .ok_or_else(|| NodeError::InvalidConfig("app node requires 'app'".into()))?;
                format!("{}.{}", app, action)
            }
        }
        other if other == "aiAgent" || is_chat_model(other) => {
            let provider = config
                .str_at("provider")
                .map(str::to_lowercase)
                .unwrap_or_else(|| {
                    if other.to_lowercase().contains("gemini") {
                        "gemini".to_string()
                    } else {
                        "openai".to_string()
                    }
                });
            format!("{}.chat", provider)
        }
        other => {
            return Err(NodeError::InvalidConfig(format!(
                "'{}' is not an integration node",
                other
            )))
        }
    };
    Ok(key)
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn credential_field<'c>(credentials: Option<&'c CredentialPayload>, keys: &[&str]) -> Option<&'c str> {
    let credentials = credentials?;
    keys.iter()
        .find_map(|key| credentials.get(*key))
        .map(String::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Inject auth headers from the `auth` block and/or a decrypted credential
fn apply_auth(
    request: reqwest::RequestBuilder,
    auth: Option<&Value>,
    credentials: Option<&CredentialPayload>,
) -> Result<reqwest::RequestBuilder, NodeError> {
    const TOKEN_KEYS: [&str; 4] = ["token", "accessToken", "access_token", "apiKey"];
    const API_KEY_KEYS: [&str; 4] = ["apiKey", "api_key", "key", "token"];

    let kind = auth
        .and_then(|a| a.str_at("type"))
        .map(str::to_lowercase)
        .unwrap_or_else(|| {
            if credentials.is_some() {
                "bearer".to_string()
            } else {
                "none".to_string()
            }
        });
    let field = |key: &str| auth.and_then(|a| a.str_at(key));

    let request = match kind.as_str() {
        "none" => request,
        "bearer" => {
            let token = field("token")
                .or_else(|| credential_field(credentials, &TOKEN_KEYS))
                .ok_or_else(|| NodeError::Credential("bearer auth requires a token".into()))?;
            request.bearer_auth(token)
        }
        "basic" => {
            let username = field("username")
                .or_else(|| credential_field(credentials, &["username", "user"]))
                .ok_or_else(|| NodeError::Credential("basic auth requires a username".into()))?;
            let password = field("password").or_else(|| credential_field(credentials, &["password"]));
            request.basic_auth(username, password)
        }
        "header" | "apikey" | "api_key" => {
            let name = field("name").unwrap_or("X-API-Key");
            let value = field("value")
                .or_else(|| credential_field(credentials, &API_KEY_KEYS))
                .ok_or_else(|| NodeError::Credential(format!("header auth '{}' requires a value", name)))?;
            request.header(name, value)
        }
        other => {
            return Err(NodeError::InvalidConfig(format!("unsupported auth type: {}", other)));
        }
    };
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::integrations::{Connector, ConnectorResponse, JsonPayloadDecryptor};
    use crate::workflow::{registry::MemoryStore, store::Credential};
    use async_trait::async_trait;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Recording;

    #[async_trait]
    impl Connector for Recording {
        async fn execute(&self, config: &Value, credentials: &CredentialPayload) -> anyhow::Result<ConnectorResponse> {
            Ok(ConnectorResponse::ok(json!({
                "to": config["to"],
                "token": credentials.get("token"),
            })))
        }
    }

    struct Rejecting;

    #[async_trait]
    impl Connector for Rejecting {
        async fn execute(&self, _config: &Value, _credentials: &CredentialPayload) -> anyhow::Result<ConnectorResponse> {
            Ok(ConnectorResponse {
                status: 403,
                data: json!({"message": "forbidden"}),
                log: String::new(),
            })
        }
    }

    fn node(node_type: &str, config: Value) -> FlowNode {
        serde_json::from_value(json!({
            "id": format!("{node_type}-node"),
            "type": "custom",
            "data": {"nodeType": node_type, "config": config},
        }))
        .unwrap()
    }

    fn executor(store: Arc<MemoryStore>, connectors: ConnectorRegistry) -> NodeExecutor {
        NodeExecutor::new(store, Arc::new(JsonPayloadDecryptor), connectors, Duration::from_secs(5))
            .unwrap()
            .with_placeholder_delay(0..=0)
    }

    async fn run(executor: &NodeExecutor, node: &FlowNode, input: Value) -> NodeOutcome {
        let outputs = OutputStore::new();
        let scope = Scope::new(&input, &outputs);
        let ctx = NodeContext {
            run_id: "run-1",
            step_key: "STEP_01",
            input: &input,
            outputs: &outputs,
            predecessors: &[],
            scope: &scope,
        };
        executor.execute_node(node, ctx, &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn test_http_request_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders/42"))
            .and(query_param("expand", "items"))
            .and(header("authorization", "Bearer secret"))
            .and(body_json(json!({"note": "rush"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": 42})))
            .mount(&server)
            .await;

        let executor = executor(Arc::new(MemoryStore::new()), ConnectorRegistry::new());
        let node = node("httpRequest", json!({
            "url": format!("{}/orders/{{{{ order_id }}}}", server.uri()),
            "method": "post",
            "query": {"expand": "items"},
            "body": "{\"note\": \"rush\"}",
            "auth": {"type": "bearer", "token": "secret"},
        }));

        let outcome = run(&executor, &node, json!({"order_id": 42})).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.outputs["status"], json!(201));
        assert_eq!(outcome.outputs["data"], json!({"id": 42}));
    }

    #[tokio::test]
    async fn test_http_request_non_success_keeps_outputs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("down"))
            .mount(&server)
            .await;

        let executor = executor(Arc::new(MemoryStore::new()), ConnectorRegistry::new());
        let outcome = run(&executor, &node("httpRequest", json!({"url": server.uri()})), Value::Null).await;

        assert!(matches!(outcome.error, Some(NodeError::ExternalCall { status: 503, .. })));
        assert_eq!(outcome.outputs["data"], json!("down"));
    }

    #[tokio::test]
    async fn test_http_request_uses_credential_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("x-api-key", "k-123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let store = Arc::new(MemoryStore::new());
        store.insert_credential(Credential {
            id: "cred-1".into(),
            provider: "custom".into(),
            encrypted_payload: r#"{"apiKey": "k-123"}"#.into(),
        });
        let executor = executor(store, ConnectorRegistry::new());
        let node = node("httpRequest", json!({
            "url": server.uri(),
            "credentialId": "cred-1",
            "auth": {"type": "header"},
        }));

        let outcome = run(&executor, &node, Value::Null).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
    }

    #[tokio::test]
    async fn test_http_request_requires_url() {
        let executor = executor(Arc::new(MemoryStore::new()), ConnectorRegistry::new());
        let outcome = run(&executor, &node("httpRequest", json!({})), Value::Null).await;
        assert!(matches!(outcome.error, Some(NodeError::InvalidConfig(_))));
        assert_eq!(outcome.outputs["status"], json!(0));
    }

    #[tokio::test]
    async fn test_integration_envelope_and_credentials() {
        let store = Arc::new(MemoryStore::new());
        store.insert_credential(Credential {
            id: "g".into(),
            provider: "google".into(),
            encrypted_payload: r#"{"token": "ya29"}"#.into(),
        });
        let connectors = ConnectorRegistry::new().with("gmail.sendEmail", Arc::new(Recording));
        let executor = executor(store, connectors);

        let gmail = node("gmail", json!({"to": "{{ email }}", "subject": "Hi", "credentialId": "g"}));
        let outcome = run(&executor, &gmail, json!({"email": "ada@example.com"})).await;
        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert_eq!(outcome.outputs["status"], json!(200));
        assert_eq!(outcome.outputs["data"], json!({"to": "ada@example.com", "token": "ya29"}));
        assert!(outcome.outputs["meta"]["duration_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_integration_validation_errors() {
        let store = Arc::new(MemoryStore::new());
        store.insert_credential(Credential {
            id: "gh".into(),
            provider: "github".into(),
            encrypted_payload: "{}".into(),
        });
        let executor = executor(store, ConnectorRegistry::new().with("gmail.sendEmail", Arc::new(Recording)));

        let missing_field = node("gmail", json!({"to": "a@b.c", "credentialId": "gh"}));
        let outcome = run(&executor, &missing_field, Value::Null).await;
        assert!(matches!(outcome.error, Some(NodeError::InvalidConfig(_))));

        let wrong_provider = node("gmail", json!({"to": "a@b.c", "subject": "x", "credentialId": "gh"}));
        let outcome = run(&executor, &wrong_provider, Value::Null).await;
        assert!(matches!(outcome.error, Some(NodeError::Credential(_))));

        let no_connector = node("app", json!({"app": "github", "action": "createIssue",
            "owner": "o", "repo": "r", "title": "t", "credentialId": "gh"}));
        let outcome = run(&executor, &no_connector, Value::Null).await;
        assert!(matches!(outcome.error, Some(NodeError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_integration_non_success_status() {
        let store = Arc::new(MemoryStore::new());
        store.insert_credential(Credential {
            id: "s".into(),
            provider: "slack".into(),
            encrypted_payload: "{}".into(),
        });
        let executor = executor(store, ConnectorRegistry::new().with("slack.sendMessage", Arc::new(Rejecting)));
        let slack = node("app", json!({"app": "slack", "action": "sendMessage",
            "channel": "#ops", "text": "deploy", "credentialId": "s"}));

        let outcome = run(&executor, &slack, Value::Null).await;
        assert!(matches!(outcome.error, Some(NodeError::ExternalCall { status: 403, .. })));
        assert_eq!(outcome.outputs["data"]["message"], json!("forbidden"));
    }

    #[test]
    fn test_integration_keys() {
        assert_eq!(integration_key(&node("gsheets", json!({}))).unwrap(), "gsheets.appendRow");
        assert_eq!(
            integration_key(&node("app", json!({"app": "notion", "action": "createPage"}))).unwrap(),
            "notion.createPage"
        );
        assert_eq!(integration_key(&node("geminiChat", json!({}))).unwrap(), "gemini.chat");
        assert_eq!(integration_key(&node("aiAgent", json!({}))).unwrap(), "openai.chat");
        assert!(integration_key(&node("app", json!({"app": "slack"}))).is_err());
    }

    #[tokio::test]
    async fn test_if_merge_and_passthrough_handlers() {
        let executor = executor(Arc::new(MemoryStore::new()), ConnectorRegistry::new());

        let check = node("if", json!({"conditions": [
            {"type": "number", "operator": "gt", "left": "count", "right": 1}]}));
        let outcome = run(&executor, &check, json!({"count": 3})).await;
        assert_eq!(outcome.outputs[IF_RESULT_FIELD], json!(true));

        let broken = node("if", json!({"conditions": [
            {"type": "number", "operator": "gt", "left": "abc", "right": 1}]}));
        let outcome = run(&executor, &broken, Value::Null).await;
        assert!(matches!(outcome.error, Some(NodeError::Condition(_))));

        let passthrough = run(&executor, &node("errorTrigger", json!({})), json!({"failed": "x"})).await;
        assert_eq!(passthrough.outputs, json!({"failed": "x"}));

        let unknown = run(&executor, &node("sticky", json!({})), Value::Null).await;
        assert_eq!(unknown.outputs, json!({"status": 200, "data": {"ok": true}}));

        let mut outputs = OutputStore::new();
        outputs.record("left", json!({"v": 1}));
        outputs.record("right", json!({"v": 2}));
        let predecessors = vec!["left".to_string(), "right".to_string(), "left".to_string()];
        let scope = Scope::new(&Value::Null, &outputs);
        let ctx = NodeContext {
            run_id: "run-1",
            step_key: "STEP_04",
            input: &Value::Null,
            outputs: &outputs,
            predecessors: &predecessors,
            scope: &scope,
        };
        let merged = executor
            .execute_node(&node("merge", json!({})), ctx, &CancellationToken::new())
            .await;
        assert_eq!(merged.outputs["merged"], json!([{"v": 1}, {"v": 2}]));
        assert_eq!(merged.outputs["by_node"]["right"], json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_slow_handler() {
        let executor = executor(Arc::new(MemoryStore::new()), ConnectorRegistry::new())
            .with_placeholder_delay(10_000..=10_000);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let outputs = OutputStore::new();
        let scope = Scope::new(&Value::Null, &outputs);
        let ctx = NodeContext {
            run_id: "run-1",
            step_key: "STEP_01",
            input: &Value::Null,
            outputs: &outputs,
            predecessors: &[],
            scope: &scope,
        };
        let outcome = executor.execute_node(&node("slowThing", json!({})), ctx, &cancel).await;
        assert!(outcome.error.is_some_and(|e| e.is_cancellation()));
    }

    #[test]
    fn test_describe_input_for_http_request() {
        let executor = executor(Arc::new(MemoryStore::new()), ConnectorRegistry::new());
        let outputs = OutputStore::new();
        let input = json!({"id": 7});
        let scope = Scope::new(&input, &outputs);
        let ctx = NodeContext {
            run_id: "run-1",
            step_key: "STEP_02",
            input: &input,
            outputs: &outputs,
            predecessors: &[],
            scope: &scope,
        };
        let fields = executor.describe_input(
            &node("httpRequest", json!({"url": "https://api.test/items/{{ id }}", "headers": {"X-Trace": "t"}})),
            &ctx,
        );
        assert_eq!(fields["url"], json!("https://api.test/items/7"));
        assert_eq!(fields["method"], json!("GET"));
        assert_eq!(fields["headers"], json!({"X-Trace": "t"}));
    }

    #[tokio::test]
    async fn test_handlers_share_the_node_scope() {
        let executor = executor(Arc::new(MemoryStore::new()), ConnectorRegistry::new());
        let mut outputs = OutputStore::new();
        outputs.record("fetch-node", json!({"status": 200, "data": {"state": "paid"}}));
        let input = json!({"id": 7});
        let scope = Scope::new(&input, &outputs);
        let ctx = NodeContext {
            run_id: "run-1",
            step_key: "STEP_03",
            input: &input,
            outputs: &outputs,
            predecessors: &[],
            scope: &scope,
        };

        let check = node("if", json!({"conditions": [
            {"operator": "equals", "left": "{{ steps.fetch-no.data.state }}", "right": "paid"},
            {"type": "number", "operator": "equals", "left": "id", "right": 7}
        ]}));
        assert!(executor.describe_input(&check, &ctx).is_empty());
        let outcome = executor.execute_node(&check, ctx, &CancellationToken::new()).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.outputs["result"], json!(true));
    }
}
