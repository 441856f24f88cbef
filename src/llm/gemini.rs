//! Primary backend: hosted structured-output model speaking the
//! generateContent protocol.

use async_trait::async_trait;
use serde_json::Value;
use std::time::{Duration, Instant};

use super::{
    parse_spec_text, spec_json_schema, system_instruction, BackendError, BackendHealth,
    SpecBackend,
};
use crate::spec::AnimationSpec;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiBackend {
    pub fn new(api_key: String, model: String) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()
                .unwrap_or_default(),
            api_key,
            base_url: "https://generativelanguage.googleapis.com".to_string(),
            model,
        }
    }

    pub fn with_base_url(mut self, base_url: String) -> Self {
        self.base_url = base_url;
        self
    }

    fn request_body(prompt: &str, context: Option<&str>) -> Value {
        let user_text = match context {
            Some(context) => format!(
                "{}\n\nA previous attempt failed. Fix the issue described here and return \
                 corrected JSON:\n{}",
                prompt, context
            ),
            None => prompt.to_string(),
        };
        serde_json::json!({
            "systemInstruction": {"parts": [{"text": system_instruction()}]},
            "contents": [{"role": "user", "parts": [{"text": user_text}]}],
            "generationConfig": {
                "temperature": 0.1,
                "maxOutputTokens": 4096,
                "responseMimeType": "application/json",
                "responseSchema": spec_json_schema()
            }
        })
    }

    fn map_transport_error(e: reqwest::Error) -> BackendError {
        if e.is_timeout() {
            BackendError::Timeout
        } else {
            BackendError::Unavailable(e.to_string())
        }
    }
}

#[async_trait]
impl SpecBackend for GeminiBackend {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn generate_spec(
        &self,
        prompt: &str,
        context: Option<&str>,
    ) -> Result<AnimationSpec, BackendError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.base_url, self.model, self.api_key
        );
        let response = self
            .client
            .post(&url)
            .json(&Self::request_body(prompt, context))
            .send()
            .await
            .map_err(Self::map_transport_error)?;

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

        if let Some(reason) = body["promptFeedback"]["blockReason"].as_str() {
            return Err(BackendError::Refused(format!("prompt blocked: {}", reason)));
        }
        let candidate = &body["candidates"][0];
        if candidate["finishReason"].as_str() == Some("SAFETY") {
            return Err(BackendError::Refused("response blocked for safety".to_string()));
        }

        let mut text = String::new();
        if let Some(parts) = candidate["content"]["parts"].as_array() {
            for part in parts {
                if let Some(fragment) = part["text"].as_str() {
                    text.push_str(fragment);
                }
            }
        }
        if text.is_empty() {
            return Err(BackendError::MalformedOutput {
                raw: String::new(),
                diagnostic: "empty candidate content".to_string(),
            });
        }
        parse_spec_text(&text)
    }

    async fn health(&self) -> BackendHealth {
        let url = format!(
            "{}/v1beta/models/{}?key={}",
            self.base_url, self.model, self.api_key
        );
        let started = Instant::now();
        let ok = matches!(
            self.client.get(&url).send().await,
            Ok(response) if response.status().is_success()
        );
        BackendHealth {
            ok,
            latency_ms: started.elapsed().as_millis() as u64,
        }
    }
}
