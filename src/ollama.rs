//! Ollama API client
//!
//! Stateless request/response wrapper over the Ollama HTTP API:
//! `/api/generate` for completions, `/api/tags` for the model list.
//! Non-2xx statuses, timeouts and malformed payloads surface as errors
//! for the orchestrator to absorb.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::config::OllamaConfig;

/// Generation backend seam. The orchestrator only sees this trait, so
/// tests can count calls without a live Ollama.
#[async_trait]
pub trait Generator: Send + Sync {
    /// Generate a reply for `prompt` given recent conversation `context`.
    async fn generate(&self, prompt: &str, context: &str, model: &str) -> Result<String>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    num_predict: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    name: String,
}

/// Client for the Ollama HTTP API
#[derive(Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
    bot_name: String,
    max_tokens: u32,
    temperature: f32,
    system_prompt: String,
}

impl OllamaClient {
    pub fn new(config: &OllamaConfig, bot_name: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("failed to build Ollama HTTP client")?;

        Ok(Self {
            client,
            base_url: format!("{}:{}", config.host, config.port),
            bot_name: bot_name.to_string(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
        })
    }

    /// Assemble the full prompt: system prompt with `{bot_name}`
    /// substituted, optional recent-conversation block, then the turn.
    fn build_prompt(&self, prompt: &str, context: &str) -> String {
        let system = self.system_prompt.replace("{bot_name}", &self.bot_name);
        if context.is_empty() {
            format!("{system}\n\nUser: {prompt}\nAssistant:")
        } else {
            format!("{system}\n\nRecent conversation:\n{context}\n\nUser: {prompt}\nAssistant:")
        }
    }

    /// List model names known to the Ollama instance.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);
        let response = self.client.get(&url).send().await?;

        if !response.status().is_success() {
            bail!("failed to list models: HTTP {}", response.status());
        }

        let tags: TagsResponse = response.json().await.context("malformed /api/tags payload")?;
        let models: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        debug!(?models, "available models");
        Ok(models)
    }

    /// Whether a specific model is present.
    pub async fn model_exists(&self, model: &str) -> bool {
        match self.list_models().await {
            Ok(models) => models.iter().any(|m| m == model),
            Err(e) => {
                error!("model lookup failed: {e:#}");
                false
            }
        }
    }

    /// Probe the API; used at startup before connecting to chat.
    pub async fn test_connection(&self) -> bool {
        match self.list_models().await {
            Ok(models) => {
                info!(count = models.len(), "Ollama reachable");
                true
            }
            Err(e) => {
                error!("Ollama connection test failed: {e:#}");
                false
            }
        }
    }
}

#[async_trait]
impl Generator for OllamaClient {
    async fn generate(&self, prompt: &str, context: &str, model: &str) -> Result<String> {
        let full_prompt = self.build_prompt(prompt, context);
        debug!(model, prompt_len = full_prompt.len(), "generating response");

        let request = GenerateRequest {
            model,
            prompt: full_prompt,
            stream: false,
            options: GenerateOptions {
                num_predict: self.max_tokens,
                temperature: self.temperature,
            },
        };

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .context("Ollama request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Ollama API error {status}: {body}");
        }

        let payload: GenerateResponse = response
            .json()
            .await
            .context("unexpected Ollama response format")?;

        Ok(payload.response.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn client(system_prompt: &str) -> OllamaClient {
        OllamaClient::new(
            &OllamaConfig {
                host: "http://localhost".to_string(),
                port: 11434,
                model: "llama3.2:3b".to_string(),
                timeout: Duration::from_secs(5),
                max_tokens: 100,
                temperature: 0.7,
                system_prompt: system_prompt.to_string(),
            },
            "NakenBot",
        )
        .expect("client should build")
    }

    #[test]
    fn prompt_substitutes_bot_name() {
        let prompt = client("You are {bot_name}.").build_prompt("hello", "");
        assert!(prompt.starts_with("You are NakenBot."));
        assert!(prompt.ends_with("User: hello\nAssistant:"));
        assert!(!prompt.contains("Recent conversation:"));
    }

    #[test]
    fn prompt_includes_context_block_when_present() {
        let prompt = client("sys").build_prompt("hello", "alice: earlier line");
        assert!(prompt.contains("Recent conversation:\nalice: earlier line"));
        assert!(prompt.ends_with("User: hello\nAssistant:"));
    }

    #[test]
    fn generate_request_serializes_expected_shape() {
        let request = GenerateRequest {
            model: "llama2",
            prompt: "hi".to_string(),
            stream: false,
            options: GenerateOptions {
                num_predict: 100,
                temperature: 0.7,
            },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["model"], "llama2");
        assert_eq!(json["stream"], false);
        assert_eq!(json["options"]["num_predict"], 100);
    }

    #[test]
    fn tags_payload_parses_model_names() {
        let json = r#"{"models":[{"name":"llama2","size":1},{"name":"mistral"}]}"#;
        let tags: TagsResponse = serde_json::from_str(json).unwrap();
        let names: Vec<String> = tags.models.into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["llama2", "mistral"]);
    }
}
