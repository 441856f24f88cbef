//! Fallback backend: a local OpenAI-compatible chat-completions server
//! with the same spec contract embedded in its system message.

use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};

use super::{parse_spec_text, system_instruction, BackendError, BackendHealth, SpecBackend};
use crate::spec::AnimationSpec;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

pub struct LocalBackend {
    client: reqwest::Client,
    base_url: String,
    model: String,
}

impl LocalBackend {
    pub fn new(base_url: String, model: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        }
    }
}

#[async_trait]
impl SpecBackend for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    async fn generate_spec(
        &self,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<AnimationSpec, BackendError> {
        let mut messages = vec![serde_json::json!({
            "role": "system",
            "content": system_instruction()
        })];
        let user_content = match context {
            Some(context) => format!(
                "{}\n\nA previous attempt failed. Fix the issue described here and return \
                 corrected JSON:\n{}",
                prompt, context
            ),
            None => prompt.to_string(),
        };
        messages.push(serde_json::json!({"role": "user", "content": user_content}));

        let response = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&serde_json::json!({
                "model": self.model,
                "messages": messages,
                "temperature": 0.1,
                "max_tokens": 4096
            }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    BackendError::Timeout
                } else {
                    BackendError::Unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(BackendError::RateLimited);
        }
        if !status.is_success() {
            return Err(BackendError::Unavailable(format!("HTTP {}", status)));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        let content = body["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("");
        if content.is_empty() {
            return Err(BackendError::MalformedOutput {
                raw: String::new(),
                diagnostic: "empty completion".to_string(),
            });
        }
        parse_spec_text(content)
    }

    async fn health(&self) -> BackendHealth {
        let started = Instant::now();
        let ok = matches!(
            self.client
                .get(format!("{}/v1/models", self.base_url))
                .send()
                .await,
            Ok(response) if response.status().is_success()
        );
        BackendHealth {
            ok,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }
}
