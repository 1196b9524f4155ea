use async_trait::async_trait;
use rig::completion::Prompt;
use rig::prelude::*;
use rig::providers::openai;
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::config::ProviderConfig;
use crate::error::GenerationError;

/// Opaque text-generation capability.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str, temperature: f64) -> Result<String, GenerationError>;
}

/// Generates text and decodes it strictly into `T`.
///
/// Any mismatch between the output and `T` surfaces as
/// [`GenerationError::Schema`]; fields are never coalesced.
pub async fn generate_structured<T: DeserializeOwned>(
    generator: &dyn TextGenerator,
    prompt: &str,
    temperature: f64,
) -> Result<T, GenerationError> {
    let text = generator.generate(prompt, temperature).await?;
    decode_json(&text)
}

/// Like [`generate_structured`], bounded by `timeout`.
pub async fn generate_structured_within<T: DeserializeOwned>(
    generator: &dyn TextGenerator,
    prompt: &str,
    temperature: f64,
    timeout: Duration,
) -> Result<T, GenerationError> {
    tokio::time::timeout(timeout, generate_structured(generator, prompt, temperature))
        .await
        .map_err(|_| GenerationError::Timeout(timeout.as_millis() as u64))?
}

pub async fn generate_within(
    generator: &dyn TextGenerator,
    prompt: &str,
    temperature: f64,
    timeout: Duration,
) -> Result<String, GenerationError> {
    tokio::time::timeout(timeout, generator.generate(prompt, temperature))
        .await
        .map_err(|_| GenerationError::Timeout(timeout.as_millis() as u64))?
}

/// Decodes the JSON payload of a model response, tolerating code fences and
/// surrounding prose.
pub fn decode_json<T: DeserializeOwned>(text: &str) -> Result<T, GenerationError> {
    let body = json_body(text)
        .ok_or_else(|| GenerationError::Schema("no JSON object in output".to_string()))?;
    serde_json::from_str(body).map_err(|e| GenerationError::Schema(e.to_string()))
}

fn json_body(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let closing = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closing)?;
    (end > start).then(|| &text[start..=end])
}

/// OpenAI-backed generator.
pub struct RigGenerator {
    client: openai::Client,
    model: String,
}

impl RigGenerator {
    pub fn from_config(config: &ProviderConfig) -> Result<Self, GenerationError> {
        let api_key = config
            .openai_api_key
            .as_deref()
            .ok_or_else(|| GenerationError::Unavailable("OpenAI API key not configured".to_string()))?;
        Ok(Self {
            client: openai::Client::new(api_key),
            model: config.model.clone(),
        })
    }
}

#[async_trait]
impl TextGenerator for RigGenerator {
    async fn generate(&self, prompt: &str, temperature: f64) -> Result<String, GenerationError> {
        let agent = self
            .client
            .agent(&self.model)
            .temperature(temperature)
            .build();
        agent
            .prompt(prompt.to_string())
            .await
            .map_err(|e| GenerationError::Request(format!("Prompt error: {}", e)))
    }
}

/// Stand-in used when no generation backend is configured; every call fails
/// so callers take their deterministic paths.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableGenerator;

#[async_trait]
impl TextGenerator for UnavailableGenerator {
    async fn generate(&self, _prompt: &str, _temperature: f64) -> Result<String, GenerationError> {
        Err(GenerationError::Unavailable(
            "no text generation backend configured".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        value: u32,
    }

    #[test]
    fn decodes_fenced_json() {
        let text = "Here you go:\n```json\n{\"value\": 4}\n```";
        assert_eq!(decode_json::<Answer>(text).unwrap(), Answer { value: 4 });
    }

    #[test]
    fn schema_mismatch_is_reported() {
        let err = decode_json::<Answer>("{\"other\": 1}").unwrap_err();
        assert!(matches!(err, GenerationError::Schema(_)));
        let err = decode_json::<Answer>("no json here").unwrap_err();
        assert!(matches!(err, GenerationError::Schema(_)));
    }

    #[tokio::test]
    async fn unavailable_generator_always_fails() {
        let err = generate_structured::<Answer>(&UnavailableGenerator, "p", 0.1)
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::Unavailable(_)));
    }
}
