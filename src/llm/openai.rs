//! OpenAI-compatible completion client — the bundled [`ChatModel`] backend.

use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

use super::provider::{ChatModel, Message, MessageContent};
use async_trait::async_trait;

#[derive(Debug, Clone, Serialize)]
struct ChatCompletionRequest {
    model: String,
    messages: Vec<Message>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

pub struct OpenAiChatModel {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
    provider_id: String,
    max_retries: u32,
}

impl OpenAiChatModel {
    pub fn new(api_key: String, base_url: Option<String>, model: Option<String>) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_secs(60))
                .build()
                .unwrap_or_else(|_| Client::new()),
            api_key,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
            model: model.unwrap_or_else(|| "gpt-4o-mini".to_string()),
            provider_id: "openai".to_string(),
            max_retries: 2,
        }
    }

    pub fn with_id(mut self, id: String) -> Self {
        self.provider_id = id;
        self
    }

    /// POST the completion request, retrying network errors, 429 (honoring
    /// Retry-After) and 5xx with exponential backoff. Other statuses return
    /// immediately for the caller to report.
    async fn post_with_retry(
        &self,
        url: &str,
        body: &ChatCompletionRequest,
    ) -> Result<reqwest::Response, String> {
        let mut delay = Duration::from_millis(1000);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let sent = self
                .client
                .post(url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await;

            let retry_after = match sent {
                Ok(response) => {
                    let status = response.status();
                    let retryable =
                        status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error();
                    if status.is_success() || !retryable || attempt > self.max_retries {
                        return Ok(response);
                    }
                    response
                        .headers()
                        .get("retry-after")
                        .and_then(|v| v.to_str().ok())
                        .and_then(|v| v.parse::<u64>().ok())
                        .map(Duration::from_secs)
                }
                Err(e) => {
                    if attempt > self.max_retries {
                        return Err(format!(
                            "Network request failed after {} attempts: {}",
                            attempt, e
                        ));
                    }
                    tracing::warn!("completion request error: {}, retrying", e);
                    None
                }
            };

            tokio::time::sleep(retry_after.unwrap_or(delay)).await;
            delay = std::cmp::min(delay * 2, Duration::from_secs(60));
        }
    }
}

#[async_trait]
impl ChatModel for OpenAiChatModel {
    async fn generate(
        &self,
        prompt: &str,
        history: &[Message],
        system_prompt: &str,
    ) -> Result<String, String> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if !system_prompt.is_empty() {
            messages.push(Message {
                role: "system".to_string(),
                content: MessageContent::Text(system_prompt.to_string()),
            });
        }
        messages.extend_from_slice(history);
        messages.push(Message {
            role: "user".to_string(),
            content: MessageContent::Text(prompt.to_string()),
        });

        let url = format!("{}/chat/completions", self.base_url);
        let request_body = ChatCompletionRequest {
            model: self.model.clone(),
            messages,
            stream: false,
            temperature: Some(0.7),
            max_tokens: None,
        };

        let response = self.post_with_retry(&url, &request_body).await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(format!("API Error ({}): {}", status, error_text));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| format!("Failed to parse response: {}", e))?;

        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        Ok(content)
    }

    fn id(&self) -> &str {
        &self.provider_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn completes_against_a_mock_server() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(header("Authorization", "Bearer test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "Hi there!"}}]
            })))
            .mount(&server)
            .await;

        let model = OpenAiChatModel::new("test-key".to_string(), Some(server.uri()), None);
        let out = model
            .generate("say hi", &[], "You are a helpful assistant.")
            .await
            .unwrap();
        assert_eq!(out, "Hi there!");
    }

    #[tokio::test]
    async fn surfaces_api_errors_with_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid key"))
            .mount(&server)
            .await;

        let model = OpenAiChatModel::new("bad".to_string(), Some(server.uri()), None);
        let err = model.generate("hi", &[], "").await.unwrap_err();
        assert!(err.contains("401"), "{}", err);
    }

    #[tokio::test]
    async fn retries_server_errors_until_success() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "recovered"}}]
            })))
            .mount(&server)
            .await;

        let model = OpenAiChatModel::new("k".to_string(), Some(server.uri()), None);
        let out = model.generate("hi", &[], "").await.unwrap();
        assert_eq!(out, "recovered");
    }

    #[tokio::test]
    async fn history_precedes_the_prompt_in_the_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{"message": {"role": "assistant", "content": "ok"}}]
            })))
            .mount(&server)
            .await;

        let model = OpenAiChatModel::new("k".to_string(), Some(server.uri()), None);
        let history = vec![Message::new("user", "earlier"), Message::new("assistant", "yes?")];
        model.generate("now", &history, "persona").await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[1]["content"], "earlier");
        assert_eq!(messages[3]["content"], "now");
    }
}
