use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use loomgen_types::{LoomError, Result};

use crate::{
    call_with_retry, validate_request, BackoffPolicy, Conversation, GenerationAdapter,
    GenerationParams,
};

const PROVIDER: &str = "openai";

// ---------------------------------------------------------------------------
// AdapterConfig
// ---------------------------------------------------------------------------

/// Explicit construction-time configuration for an HTTP generation backend.
///
/// The credential always travels here; `from_env` constructors are the one
/// place the process environment is consulted to fill it in.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Per-call deadline; a call fails rather than hanging past it.
    pub timeout: Duration,
    /// Total attempt budget per call, transient failures included.
    pub max_attempts: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            base_url: "https://api.openai.com".to_string(),
            model: "gpt-3.5-turbo".to_string(),
            timeout: Duration::from_secs(50),
            max_attempts: 6,
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAiAdapter
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct OpenAiAdapter {
    config: AdapterConfig,
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl OpenAiAdapter {
    /// Construct the adapter, refusing eagerly when no credential is present.
    pub fn new(config: AdapterConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(LoomError::Authentication {
                provider: PROVIDER.into(),
            });
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| LoomError::Other(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            backoff: BackoffPolicy::default(),
        })
    }

    /// Read the credential from `OPENAI_API_KEY` and delegate to [`new`](Self::new).
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_default();
        Self::new(AdapterConfig {
            api_key,
            ..AdapterConfig::default()
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = url.into();
        self
    }

    fn build_request_body(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
    ) -> serde_json::Value {
        json!({
            "model": self.config.model,
            "messages": conversation,
            "max_tokens": params.max_new_tokens,
            "frequency_penalty": params.frequency_penalty,
            "presence_penalty": params.presence_penalty,
            "temperature": params.temperature,
            "top_p": params.top_p,
        })
    }

    async fn complete_once(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
    ) -> Result<String> {
        let body = self.build_request_body(conversation, params);

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LoomError::RequestTimeout {
                        provider: PROVIDER.into(),
                        timeout_ms: self.config.timeout.as_millis() as u64,
                    }
                } else {
                    LoomError::Backend {
                        provider: PROVIDER.into(),
                        status: 0,
                        message: e.to_string(),
                        retryable: true,
                    }
                }
            })?;

        let status = resp.status();
        let response_body = resp.text().await.map_err(|e| LoomError::Backend {
            provider: PROVIDER.into(),
            status: 0,
            message: e.to_string(),
            retryable: true,
        })?;

        if !status.is_success() {
            return Err(map_error(status, &response_body));
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&response_body).map_err(|e| LoomError::InvalidResponse {
                provider: PROVIDER.into(),
                message: format!("failed to parse response JSON: {e}"),
            })?;

        extract_completion(&parsed)
    }
}

// ---------------------------------------------------------------------------
// Response parsing / error mapping
// ---------------------------------------------------------------------------

fn extract_completion(body: &serde_json::Value) -> Result<String> {
    let content = body["choices"][0]["message"]["content"].as_str();
    match content {
        Some(text) if !text.is_empty() => Ok(text.to_string()),
        Some(_) => Err(LoomError::InvalidResponse {
            provider: PROVIDER.into(),
            message: "backend returned an empty completion".into(),
        }),
        None => Err(LoomError::InvalidResponse {
            provider: PROVIDER.into(),
            message: "response is missing choices[0].message.content".into(),
        }),
    }
}

fn map_error(status: reqwest::StatusCode, body: &str) -> LoomError {
    let status_u16 = status.as_u16();
    match status_u16 {
        429 => {
            // Try to extract retry-after from the error body
            let retry_ms = serde_json::from_str::<serde_json::Value>(body)
                .ok()
                .and_then(|v| v["error"]["retry_after"].as_f64())
                .map(|s| (s * 1000.0) as u64)
                .unwrap_or(1000);
            LoomError::RateLimited {
                provider: PROVIDER.into(),
                retry_after_ms: retry_ms,
            }
        }
        401 | 403 => LoomError::Authentication {
            provider: PROVIDER.into(),
        },
        500..=599 => LoomError::Backend {
            provider: PROVIDER.into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: true,
        },
        _ => LoomError::Backend {
            provider: PROVIDER.into(),
            status: status_u16,
            message: extract_error_message(body),
            retryable: false,
        },
    }
}

fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(String::from))
        .unwrap_or_else(|| body.to_string())
}

// ---------------------------------------------------------------------------
// GenerationAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl GenerationAdapter for OpenAiAdapter {
    async fn generate(
        &self,
        conversation: &Conversation,
        params: &GenerationParams,
    ) -> Result<String> {
        validate_request(conversation, params)?;
        call_with_retry(
            || self.complete_once(conversation, params),
            self.config.max_attempts,
            &self.backoff,
            PROVIDER,
        )
        .await
    }

    fn model_name(&self) -> &str {
        &self.config.model
    }

    fn dump(&self) -> serde_json::Value {
        // The credential is deliberately not dumped; load pulls it from the
        // environment or an explicit config.
        json!({
            "model": self.config.model,
            "base_url": self.config.base_url,
            "timeout_secs": self.config.timeout.as_secs(),
            "max_attempts": self.config.max_attempts,
            "type_info": {
                "module": "loomgen_llm::openai",
                "name": "OpenAiAdapter",
            },
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
