//! OpenAI-compatible chat-completions adapter.
//!
//! Serves any provider that speaks `POST {base}/chat/completions`: OpenAI
//! itself, vLLM, llama.cpp server, Ollama and most proxies. The base URL
//! comes from the model's `endpoint`, falling back to the adapter default;
//! the bearer token is read from the variable named by `api_key_env`.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use routing::{ChatMessage, ModelConfig, ProviderAdapter, ProviderFailure, ProviderRequest, ProviderResponse};

pub struct OpenAiCompatibleAdapter {
    provider: String,
    client: reqwest::Client,
    default_base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    total_tokens: u64,
}

impl OpenAiCompatibleAdapter {
    pub fn new(provider: impl Into<String>, default_base_url: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            client: reqwest::Client::new(),
            default_base_url: default_base_url.into(),
        }
    }

    fn completions_url(&self, model: &ModelConfig) -> String {
        let base = model
            .endpoint
            .as_deref()
            .unwrap_or(&self.default_base_url)
            .trim_end_matches('/');
        format!("{base}/chat/completions")
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn invoke(
        &self,
        model: &ModelConfig,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse, ProviderFailure> {
        let url = self.completions_url(model);
        let body = ChatCompletionRequest {
            model: &model.model_name,
            messages: &request.messages,
            max_tokens: request.max_tokens_for(model),
            temperature: request.temperature_for(model),
        };

        let mut call = self.client.post(&url).json(&body);
        if let Some(key) = model
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
        {
            call = call.bearer_auth(key);
        }

        debug!(model_id = %model.id, %url, "Calling chat completions");
        let response = call
            .send()
            .await
            .map_err(|e| ProviderFailure::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &text));
        }

        let text = response
            .text()
            .await
            .map_err(|e| ProviderFailure::Transport(e.to_string()))?;
        parse_completion(&text)
    }
}

fn classify_status(status: StatusCode, body: &str) -> ProviderFailure {
    let detail = format!("{status}: {}", truncate(body, 200));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderFailure::Unauthorized(detail),
        StatusCode::TOO_MANY_REQUESTS => ProviderFailure::RateLimited(detail),
        StatusCode::BAD_REQUEST
        | StatusCode::PAYLOAD_TOO_LARGE
        | StatusCode::UNPROCESSABLE_ENTITY => ProviderFailure::InvalidRequest(detail),
        _ => ProviderFailure::Unavailable(detail),
    }
}

fn parse_completion(body: &str) -> Result<ProviderResponse, ProviderFailure> {
    let parsed: ChatCompletionResponse =
        serde_json::from_str(body).map_err(|e| ProviderFailure::Malformed(e.to_string()))?;
    let content = parsed
        .choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .ok_or_else(|| ProviderFailure::Malformed("response contained no message".into()))?;
    Ok(ProviderResponse {
        content,
        tokens: parsed.usage.map_or(0, |u| u.total_tokens),
        cost: None,
    })
}

fn truncate(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion() {
        let body = r#"{
            "id": "chatcmpl-1",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "안녕하세요"}}],
            "usage": {"prompt_tokens": 9, "completion_tokens": 3, "total_tokens": 12}
        }"#;
        let response = parse_completion(body).unwrap();
        assert_eq!(response.content, "안녕하세요");
        assert_eq!(response.tokens, 12);
        assert!(response.cost.is_none());
    }

    #[test]
    fn test_empty_choices_is_malformed() {
        assert!(matches!(
            parse_completion(r#"{"choices": []}"#),
            Err(ProviderFailure::Malformed(_))
        ));
        assert!(matches!(
            parse_completion("<html>bad gateway</html>"),
            Err(ProviderFailure::Malformed(_))
        ));
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, ""),
            ProviderFailure::RateLimited(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            ProviderFailure::Unauthorized(_)
        ));
        let invalid = classify_status(StatusCode::BAD_REQUEST, "context length exceeded");
        assert!(!invalid.retry_elsewhere());
        assert!(classify_status(StatusCode::BAD_GATEWAY, "").retry_elsewhere());
    }

    fn model(endpoint: Option<&str>) -> ModelConfig {
        serde_json::from_value(serde_json::json!({
            "id": "local",
            "provider": "vllm",
            "model_name": "qwen",
            "display_name": "Qwen",
            "quality_score": 0.5,
            "speed_score": 0.5,
            "cost_efficiency": 0.5,
            "reliability_score": 0.5,
            "endpoint": endpoint,
            "version": 1,
            "created_at": "2026-01-01T00:00:00Z",
            "updated_at": "2026-01-01T00:00:00Z"
        }))
        .unwrap()
    }

    #[test]
    fn test_endpoint_overrides_default_base() {
        let adapter = OpenAiCompatibleAdapter::new("vllm", "https://api.openai.com/v1/");
        assert_eq!(
            adapter.completions_url(&model(None)),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            adapter.completions_url(&model(Some("http://gpu-01:8000/v1"))),
            "http://gpu-01:8000/v1/chat/completions"
        );
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("가나다라", 2), "가나");
        assert_eq!(truncate("abc", 10), "abc");
    }
}
