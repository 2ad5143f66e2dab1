//! OpenAI-compatible chat completions client
//!
//! Talks to any server exposing `POST {base_url}/chat/completions` (vLLM,
//! llama.cpp server, LM Studio, hosted APIs). Model names are picked per role
//! from [`LlmConfig`].

use super::generator::{AgentRole, Generation, GenerationError, GenerationRequest, TextGenerator};
use crate::config::LlmConfig;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

// ============================================================================
// Client
// ============================================================================

pub struct OpenAiCompatClient {
    client: Client,
    config: LlmConfig,
}

impl OpenAiCompatClient {
    pub fn new(config: LlmConfig) -> Self {
        // The gateway enforces per-attempt timeouts; this only guards against
        // a connection that never resolves.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_else(|e| {
                tracing::error!("Failed to build HTTP client, using default client: {}", e);
                Client::new()
            });

        Self { client, config }
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'))
    }

    fn temperature_for(&self, role: AgentRole) -> f32 {
        // Classification and extraction want determinism
        match role {
            AgentRole::Kai => self.config.temperature,
            _ => 0.0,
        }
    }

    fn body<'a>(&'a self, request: &'a GenerationRequest) -> ChatRequest<'a> {
        ChatRequest {
            model: self.config.model_for(request.role),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            temperature: self.temperature_for(request.role),
            stream: false,
        }
    }

    /// Check whether the server answers at all
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/models", self.config.base_url.trim_end_matches('/'));
        let mut req = self.client.get(&url).timeout(Duration::from_secs(3));
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }
        match req.send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> GenerationError {
    if err.is_timeout() {
        GenerationError::Timeout
    } else if let Some(status) = err.status() {
        GenerationError::Upstream {
            status: status.as_u16(),
            message: err.to_string(),
        }
    } else {
        GenerationError::Connection(err.to_string())
    }
}

fn extract_content(response: ChatResponse) -> Result<String, GenerationError> {
    response
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
        .ok_or_else(|| GenerationError::InvalidRequest("empty completion".to_string()))
}

#[async_trait]
impl TextGenerator for OpenAiCompatClient {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        let url = self.endpoint();
        let body = self.body(request);
        tracing::debug!(role = %request.role, model = body.model, "Chat completion request to {}", url);

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = &self.config.api_key {
            req = req.bearer_auth(key);
        }

        let response = req.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerationError::Upstream {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            GenerationError::InvalidRequest(format!("Failed to parse completion: {}", e))
        })?;
        Ok(Generation::new(extract_content(parsed)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> OpenAiCompatClient {
        OpenAiCompatClient::new(LlmConfig {
            base_url: "http://localhost:8000/v1/".to_string(),
            kai_model: Some("kai-chat".to_string()),
            ..LlmConfig::default()
        })
    }

    #[test]
    fn test_request_body_shape() {
        let client = client();
        let request = GenerationRequest::new(AgentRole::Kai, "be kind", "hello");
        let json = serde_json::to_value(client.body(&request)).unwrap();

        assert_eq!(json["model"], "kai-chat");
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "hello");
        assert_eq!(json["stream"], false);
        assert_eq!(client.endpoint(), "http://localhost:8000/v1/chat/completions");
    }

    #[test]
    fn test_classifier_uses_zero_temperature() {
        let client = client();
        let request = GenerationRequest::new(AgentRole::SafetyClassifier, "classify", "hi");
        assert_eq!(client.body(&request).temperature, 0.0);
        assert_eq!(client.body(&request).model, "default");
    }

    #[test]
    fn test_extract_content() {
        let response: ChatResponse = serde_json::from_str(
            r#"{"choices": [{"message": {"role": "assistant", "content": "  Hi there  "}}]}"#,
        )
        .unwrap();
        assert_eq!(extract_content(response).unwrap(), "Hi there");

        let empty: ChatResponse = serde_json::from_str(r#"{"choices": []}"#).unwrap();
        assert!(matches!(
            extract_content(empty),
            Err(GenerationError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transient() {
        let client = OpenAiCompatClient::new(LlmConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            ..LlmConfig::default()
        });
        let request = GenerationRequest::new(AgentRole::Kai, "system", "hi");
        let err = client.generate(&request).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
