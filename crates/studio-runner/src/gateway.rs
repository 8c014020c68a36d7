//! Role-parameterised access to the model provider. The core consumes a
//! single `generate` operation; the HTTP implementation speaks the
//! OpenAI-compatible chat-completions wire shape with bounded retry, and the
//! scripted implementation replays canned results for tests.

use anyhow::{anyhow, Result};
use reqwest::blocking::Client as HttpClient;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Injector,
    Solver,
}

impl AgentRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentRole::Injector => "injector",
            AgentRole::Solver => "solver",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Message {
        Message {
            role: MessageRole::System,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Message {
        Message {
            role: MessageRole::User,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Message {
        Message {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    pub fn assistant_tool_call(content: impl Into<String>, call: &ToolCall) -> Message {
        Message {
            role: MessageRole::Assistant,
            content: content.into(),
            tool_calls: Some(vec![json!({
                "id": call.id,
                "type": "function",
                "function": {
                    "name": call.name,
                    "arguments": call.arguments.to_string(),
                },
            })]),
            tool_call_id: None,
        }
    }

    pub fn tool_result(tool_call_id: impl Into<String>, content: impl Into<String>) -> Message {
        Message {
            role: MessageRole::Tool,
            content: content.into(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenCounts {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: String,
    #[serde(default)]
    pub tokens: TokenCounts,
}

static CALL_SEQ: AtomicU64 = AtomicU64::new(1);

impl GenerationResult {
    pub fn text(content: impl Into<String>) -> GenerationResult {
        GenerationResult {
            content: Some(content.into()),
            tool_calls: Vec::new(),
            finish_reason: "stop".to_string(),
            tokens: TokenCounts::default(),
        }
    }

    pub fn tool(name: &str, arguments: Value) -> GenerationResult {
        let seq = CALL_SEQ.fetch_add(1, Ordering::Relaxed);
        GenerationResult {
            content: None,
            tool_calls: vec![ToolCall {
                id: format!("call_{}", seq),
                name: name.to_string(),
                arguments,
            }],
            finish_reason: "tool_calls".to_string(),
            tokens: TokenCounts::default(),
        }
    }
}

pub trait ModelGateway: Send + Sync {
    fn model_id(&self) -> &str;
    fn generate(
        &self,
        role: AgentRole,
        messages: &[Message],
        tools: &[ToolDefinition],
        temperature: f64,
        max_tokens: u64,
    ) -> Result<GenerationResult>;
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub endpoint: String,
    pub model: String,
    pub bearer_token: Option<String>,
    pub max_attempts: usize,
    pub base_backoff_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        GatewaySettings {
            endpoint: String::new(),
            model: "default".to_string(),
            bearer_token: None,
            max_attempts: 3,
            base_backoff_ms: 250,
            request_timeout_ms: 300_000,
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

pub struct HttpGateway {
    settings: GatewaySettings,
    client: HttpClient,
}

impl HttpGateway {
    pub fn new(settings: GatewaySettings) -> Result<Self> {
        if settings.endpoint.trim().is_empty() {
            return Err(anyhow!("gateway endpoint must not be empty"));
        }
        let client = HttpClient::builder()
            .connect_timeout(Duration::from_millis(5_000))
            .timeout(Duration::from_millis(settings.request_timeout_ms))
            .build()?;
        Ok(HttpGateway { settings, client })
    }

    fn completions_url(&self) -> String {
        format!(
            "{}/chat/completions",
            self.settings.endpoint.trim_end_matches('/')
        )
    }

    fn wire_messages(messages: &[Message]) -> Vec<Value> {
        messages
            .iter()
            .map(|m| {
                let mut obj = json!({
                    "role": match m.role {
                        MessageRole::System => "system",
                        MessageRole::User => "user",
                        MessageRole::Assistant => "assistant",
                        MessageRole::Tool => "tool",
                    },
                    "content": m.content,
                });
                if let Some(calls) = &m.tool_calls {
                    obj["tool_calls"] = Value::Array(calls.clone());
                }
                if let Some(id) = &m.tool_call_id {
                    obj["tool_call_id"] = Value::String(id.clone());
                }
                obj
            })
            .collect()
    }

    fn wire_tools(tools: &[ToolDefinition]) -> Vec<Value> {
        tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect()
    }

    fn parse_result(body: Value) -> Result<GenerationResult> {
        let choice = body
            .get("choices")
            .and_then(|c| c.get(0))
            .ok_or_else(|| anyhow!("gateway response has no choices"))?;
        let message = choice
            .get("message")
            .ok_or_else(|| anyhow!("gateway response has no message"))?;

        let content = message
            .get("content")
            .and_then(|c| c.as_str())
            .map(|s| s.to_string());

        let mut tool_calls = Vec::new();
        if let Some(raw_calls) = message.get("tool_calls").and_then(|t| t.as_array()) {
            for raw in raw_calls {
                let id = raw
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string();
                let function = raw
                    .get("function")
                    .ok_or_else(|| anyhow!("tool call without function block"))?;
                let name = function
                    .get("name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| anyhow!("tool call without name"))?
                    .to_string();
                let arguments = match function.get("arguments") {
                    Some(Value::String(s)) => {
                        serde_json::from_str(s).unwrap_or_else(|_| json!({}))
                    }
                    Some(other) => other.clone(),
                    None => json!({}),
                };
                tool_calls.push(ToolCall {
                    id,
                    name,
                    arguments,
                });
            }
        }

        let usage = body.get("usage").cloned().unwrap_or_else(|| json!({}));
        let tokens = TokenCounts {
            prompt_tokens: usage
                .get("prompt_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            completion_tokens: usage
                .get("completion_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            total_tokens: usage
                .get("total_tokens")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
        };

        Ok(GenerationResult {
            content,
            tool_calls,
            finish_reason: choice
                .get("finish_reason")
                .and_then(|v| v.as_str())
                .unwrap_or("stop")
                .to_string(),
            tokens,
        })
    }
}

impl ModelGateway for HttpGateway {
    fn model_id(&self) -> &str {
        &self.settings.model
    }

    fn generate(
        &self,
        _role: AgentRole,
        messages: &[Message],
        tools: &[ToolDefinition],
        temperature: f64,
        max_tokens: u64,
    ) -> Result<GenerationResult> {
        let mut payload = json!({
            "model": self.settings.model,
            "messages": Self::wire_messages(messages),
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        if !tools.is_empty() {
            payload["tools"] = Value::Array(Self::wire_tools(tools));
        }

        let url = self.completions_url();
        let mut last_error = anyhow!("gateway retry budget exhausted");
        for attempt in 1..=self.settings.max_attempts.max(1) {
            if attempt > 1 {
                thread::sleep(Duration::from_millis(
                    self.settings.base_backoff_ms * (attempt as u64 - 1),
                ));
            }
            let mut builder = self.client.post(&url);
            if let Some(token) = &self.settings.bearer_token {
                builder = builder.bearer_auth(token);
            }
            match builder.json(&payload).send() {
                Err(err) => {
                    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
                    last_error = anyhow!("gateway transport error: {}", err);
                    if !retryable {
                        return Err(last_error);
                    }
                }
                Ok(response) => {
                    let status = response.status().as_u16();
                    if (200..300).contains(&status) {
                        let body: Value = response
                            .json()
                            .map_err(|e| anyhow!("gateway returned invalid JSON: {}", e))?;
                        return Self::parse_result(body);
                    }
                    let body = response.text().unwrap_or_default();
                    let preview: String = body.chars().take(512).collect();
                    last_error = anyhow!("gateway http status {}: {}", status, preview);
                    if !is_retryable_status(status) {
                        return Err(last_error);
                    }
                }
            }
        }
        Err(last_error)
    }
}

/// Replays a fixed sequence of results; exhaustion is an error so tests catch
/// agents that loop longer than scripted.
pub struct ScriptedGateway {
    model: String,
    responses: Mutex<VecDeque<GenerationResult>>,
}

impl ScriptedGateway {
    pub fn new(model: &str, responses: Vec<GenerationResult>) -> ScriptedGateway {
        ScriptedGateway {
            model: model.to_string(),
            responses: Mutex::new(responses.into()),
        }
    }
}

impl ModelGateway for ScriptedGateway {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn generate(
        &self,
        _role: AgentRole,
        _messages: &[Message],
        _tools: &[ToolDefinition],
        _temperature: f64,
        _max_tokens: u64,
    ) -> Result<GenerationResult> {
        let mut queue = self
            .responses
            .lock()
            .map_err(|_| anyhow!("scripted gateway lock poisoned"))?;
        queue
            .pop_front()
            .ok_or_else(|| anyhow!("scripted gateway exhausted"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn completion_body(content: &str) -> String {
        json!({
            "choices": [{
                "message": { "content": content },
                "finish_reason": "stop",
            }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3, "total_tokens": 15 },
        })
        .to_string()
    }

    fn tool_call_body() -> String {
        json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_abc",
                        "type": "function",
                        "function": {
                            "name": "bash",
                            "arguments": "{\"command\": \"ls\"}",
                        },
                    }],
                },
                "finish_reason": "tool_calls",
            }],
            "usage": { "prompt_tokens": 20, "completion_tokens": 8, "total_tokens": 28 },
        })
        .to_string()
    }

    fn spawn_server(responses: Vec<(u16, String)>) -> (String, mpsc::Receiver<Value>) {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("bind fake gateway");
        let endpoint = format!("http://{}", server.server_addr());
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for (status, body) in responses {
                let mut request = match server.recv() {
                    Ok(request) => request,
                    Err(_) => return,
                };
                let mut payload = String::new();
                let _ = request.as_reader().read_to_string(&mut payload);
                let _ = tx.send(serde_json::from_str(&payload).unwrap_or(Value::Null));
                let response = tiny_http::Response::from_string(body).with_status_code(status);
                let _ = request.respond(response);
            }
        });
        (endpoint, rx)
    }

    fn gateway_for(endpoint: &str, max_attempts: usize) -> HttpGateway {
        HttpGateway::new(GatewaySettings {
            endpoint: endpoint.to_string(),
            model: "test-model".to_string(),
            max_attempts,
            base_backoff_ms: 1,
            ..GatewaySettings::default()
        })
        .expect("gateway")
    }

    use std::io::Read;

    #[test]
    fn generate_sends_tools_and_parses_tool_calls() {
        let (endpoint, requests) = spawn_server(vec![(200, tool_call_body())]);
        let gateway = gateway_for(&endpoint, 1);
        let tools = vec![ToolDefinition {
            name: "bash".to_string(),
            description: "run a command".to_string(),
            parameters: json!({"type": "object"}),
        }];
        let result = gateway
            .generate(
                AgentRole::Solver,
                &[Message::system("s"), Message::user("u")],
                &tools,
                0.7,
                4096,
            )
            .expect("generate");
        assert_eq!(result.tool_calls.len(), 1);
        assert_eq!(result.tool_calls[0].name, "bash");
        assert_eq!(result.tool_calls[0].arguments["command"], "ls");
        assert_eq!(result.tokens.total_tokens, 28);

        let sent = requests.recv().expect("captured request");
        assert_eq!(sent["model"], "test-model");
        assert_eq!(sent["tools"][0]["function"]["name"], "bash");
        assert_eq!(sent["messages"][0]["role"], "system");
    }

    #[test]
    fn generate_retries_on_server_errors() {
        let (endpoint, _requests) = spawn_server(vec![
            (500, "upstream sad".to_string()),
            (200, completion_body("recovered")),
        ]);
        let gateway = gateway_for(&endpoint, 3);
        let result = gateway
            .generate(AgentRole::Injector, &[Message::user("hi")], &[], 0.7, 128)
            .expect("should recover on retry");
        assert_eq!(result.content.as_deref(), Some("recovered"));
    }

    #[test]
    fn generate_fails_fast_on_client_errors() {
        let (endpoint, _requests) = spawn_server(vec![(400, "bad request".to_string())]);
        let gateway = gateway_for(&endpoint, 3);
        let err = gateway
            .generate(AgentRole::Injector, &[Message::user("hi")], &[], 0.7, 128)
            .expect_err("400 must not be retried");
        assert!(err.to_string().contains("400"));
    }

    #[test]
    fn scripted_gateway_pops_in_order_and_exhausts() {
        let gateway = ScriptedGateway::new(
            "scripted",
            vec![
                GenerationResult::text("first"),
                GenerationResult::tool("bash", json!({"command": "ls"})),
            ],
        );
        let first = gateway
            .generate(AgentRole::Solver, &[], &[], 0.0, 1)
            .expect("first");
        assert_eq!(first.content.as_deref(), Some("first"));
        let second = gateway
            .generate(AgentRole::Solver, &[], &[], 0.0, 1)
            .expect("second");
        assert_eq!(second.tool_calls[0].name, "bash");
        assert!(gateway.generate(AgentRole::Solver, &[], &[], 0.0, 1).is_err());
    }
}
