use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use sopflow_core::config::ReasonerConfig;
use sopflow_core::error::{Result, SopError};
use sopflow_core::traits::Reasoner;
use sopflow_core::types::ToolContext;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a tool inside an automated procedure. \
Answer the directive using the provided arguments and reply with a single JSON object only.";

/// Reasoner backed by an OpenAI-compatible chat completions endpoint
/// (OpenAI, Groq, Ollama, vLLM, ...). Non-streaming.
pub struct HttpReasoner {
    http: Client,
    config: ReasonerConfig,
}

impl HttpReasoner {
    pub fn new(config: ReasonerConfig) -> Self {
        Self {
            http: Client::new(),
            config,
        }
    }

    fn endpoint(&self) -> String {
        let base = self.config.base_url.trim_end_matches('/');
        if base.ends_with("/chat/completions") {
            base.to_string()
        } else {
            format!("{}/chat/completions", base)
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// User message: the directive followed by the resolved arguments as JSON.
pub(crate) fn render_prompt(directive: &str, args: &Map<String, Value>) -> String {
    if args.is_empty() {
        directive.to_string()
    } else {
        format!(
            "{}\n\nArguments:\n{}",
            directive,
            serde_json::to_string_pretty(args).unwrap_or_default()
        )
    }
}

impl Reasoner for HttpReasoner {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn description(&self) -> &str {
        &self.config.description
    }

    fn timeout_secs(&self) -> Option<u64> {
        self.config.timeout_secs
    }

    fn reason(
        &self,
        directive: String,
        args: Map<String, Value>,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let system = self
                .config
                .system_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string());
            let body = ChatRequest {
                model: &self.config.model,
                messages: vec![
                    ChatMessage {
                        role: "system".into(),
                        content: system,
                    },
                    ChatMessage {
                        role: "user".into(),
                        content: render_prompt(&directive, &args),
                    },
                ],
                temperature: 0.0,
                stream: false,
            };

            debug!(
                agent = %self.config.name,
                model = %self.config.model,
                step_id = %ctx.step_id,
                "Calling reasoner"
            );

            let mut req = self.http.post(self.endpoint()).json(&body);
            if let Some(api_key) = &self.config.api_key {
                req = req.header("Authorization", format!("Bearer {}", api_key));
            }

            let tool_err = |message: String| SopError::ToolExecution {
                tool: format!("agent:{}", self.config.name),
                message,
            };

            let response = req.send().await.map_err(|e| tool_err(e.to_string()))?;
            if !response.status().is_success() {
                let status = response.status();
                let body = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "unknown".to_string());
                return Err(tool_err(format!("HTTP {}: {}", status, body)));
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .map_err(|e| tool_err(format!("invalid response body: {}", e)))?;

            parsed
                .choices
                .into_iter()
                .next()
                .map(|c| c.message.content)
                .ok_or_else(|| tool_err("response contained no choices".to_string()))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(base_url: &str) -> ReasonerConfig {
        ReasonerConfig {
            name: "writer".into(),
            description: "Writes things".into(),
            base_url: base_url.into(),
            model: "llama3".into(),
            api_key: None,
            system_prompt: None,
            timeout_secs: Some(20),
        }
    }

    #[test]
    fn endpoint_appends_path_once() {
        assert_eq!(
            HttpReasoner::new(config("http://localhost:11434/v1/")).endpoint(),
            "http://localhost:11434/v1/chat/completions"
        );
        assert_eq!(
            HttpReasoner::new(config("https://api.groq.com/openai/v1/chat/completions")).endpoint(),
            "https://api.groq.com/openai/v1/chat/completions"
        );
    }

    #[test]
    fn prompt_includes_args() {
        let args = json!({"area": 12}).as_object().cloned().unwrap();
        let prompt = render_prompt("Summarise", &args);
        assert!(prompt.starts_with("Summarise\n\nArguments:\n"));
        assert!(prompt.contains("\"area\": 12"));
        assert_eq!(render_prompt("Only", &Map::new()), "Only");
    }

    #[test]
    fn reasoner_metadata() {
        let r = HttpReasoner::new(config("http://x"));
        assert_eq!(r.name(), "writer");
        assert_eq!(r.timeout_secs(), Some(20));
    }
}
