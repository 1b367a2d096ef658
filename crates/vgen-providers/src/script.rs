//! Script providers.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use vgen_models::{Capability, GenerationRequest, ProviderTier};

use crate::error::{check_status, ProviderError, ProviderResult};
use crate::probe::{array_len, probe_api_key, probe_model_server, ProbeOutcome};
use crate::provider::{Provider, Scene, Script, ScriptProvider, StageContext};

/// Target seconds of narration per scene.
const SECONDS_PER_SCENE: f64 = 8.0;

const MAX_SCENES: usize = 24;

/// Shape the LLM providers are asked to answer with.
#[derive(Debug, Deserialize)]
struct ScriptDraft {
    #[serde(default)]
    title: String,
    scenes: Vec<SceneDraft>,
}

#[derive(Debug, Deserialize)]
struct SceneDraft {
    narration: String,
    #[serde(default)]
    visual_prompt: String,
}

fn scene_count(target_secs: u32) -> usize {
    ((target_secs as f64 / SECONDS_PER_SCENE).ceil() as usize).clamp(1, MAX_SCENES)
}

fn script_prompt(request: &GenerationRequest) -> String {
    format!(
        "Write a narrated video script of about {secs} seconds in {scenes} scenes about:\n\
         {brief}\n\n\
         Answer with JSON only: {{\"title\": string, \"scenes\": [{{\"narration\": string, \
         \"visual_prompt\": string}}]}}",
        secs = request.target_duration_secs,
        scenes = scene_count(request.target_duration_secs),
        brief = request.brief.trim(),
    )
}

/// Parse an LLM answer and spread the target duration across scenes by
/// narration length.
fn script_from_json(provider: &str, raw: &str, target_secs: u32) -> ProviderResult<Script> {
    let draft: ScriptDraft = serde_json::from_str(raw.trim())
        .map_err(|e| ProviderError::invalid_response(provider, format!("script JSON: {e}")))?;

    let drafts: Vec<SceneDraft> = draft
        .scenes
        .into_iter()
        .filter(|s| !s.narration.trim().is_empty())
        .collect();

    let words: Vec<usize> = drafts
        .iter()
        .map(|s| s.narration.split_whitespace().count().max(1))
        .collect();
    let total_words: usize = words.iter().sum();

    let scenes = drafts
        .into_iter()
        .zip(words)
        .enumerate()
        .map(|(index, (scene, words))| {
            let visual_prompt = if scene.visual_prompt.trim().is_empty() {
                scene.narration.clone()
            } else {
                scene.visual_prompt
            };
            Scene {
                index,
                duration_secs: target_secs as f64 * words as f64 / total_words.max(1) as f64,
                narration: scene.narration.trim().to_string(),
                visual_prompt,
            }
        })
        .collect();

    let script = Script {
        title: draft.title,
        scenes,
    };
    script.ensure_usable(provider)?;
    Ok(script)
}

/// Deterministic built-in script writer. Always available.
#[derive(Debug, Default)]
pub struct TemplateScriptProvider;

impl TemplateScriptProvider {
    pub fn new() -> Self {
        Self
    }

    fn build(request: &GenerationRequest) -> Script {
        let brief = request.brief.trim();
        let mut sentences: Vec<String> = brief
            .split(['.', '!', '?', '\n'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect();
        if sentences.is_empty() {
            sentences.push(brief.to_string());
        }

        let count = scene_count(request.target_duration_secs);
        let duration = request.target_duration_secs as f64 / count as f64;
        let topic = sentences[0].clone();

        let scenes = (0..count)
            .map(|index| {
                let narration = if index == 0 {
                    format!("Let's talk about {}.", lowercase_first(&topic))
                } else if index == count - 1 && count > 1 {
                    format!("That's the story of {}. Thanks for watching.", lowercase_first(&topic))
                } else {
                    let sentence = &sentences[index % sentences.len()];
                    format!("{sentence}.")
                };
                Scene {
                    index,
                    visual_prompt: sentences[index % sentences.len()].clone(),
                    narration,
                    duration_secs: duration,
                }
            })
            .collect();

        Script {
            title: topic,
            scenes,
        }
    }
}

fn lowercase_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl Provider for TemplateScriptProvider {
    fn name(&self) -> &str {
        "template"
    }

    fn capability(&self) -> Capability {
        Capability::Script
    }

    fn tier(&self) -> ProviderTier {
        ProviderTier::Free
    }

    async fn probe(&self) -> ProbeOutcome {
        ProbeOutcome::up()
    }
}

#[async_trait]
impl ScriptProvider for TemplateScriptProvider {
    async fn generate_script(
        &self,
        request: &GenerationRequest,
        ctx: &StageContext,
    ) -> ProviderResult<Script> {
        ctx.check_cancelled()?;
        let script = Self::build(request);
        script.ensure_usable(self.name())?;
        Ok(script)
    }
}

/// Script writer backed by a local Ollama server.
pub struct OllamaScriptProvider {
    http: Client,
    base_url: String,
    model: String,
}

impl OllamaScriptProvider {
    pub fn new(http: Client, base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
        }
    }
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

#[async_trait]
impl Provider for OllamaScriptProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn capability(&self) -> Capability {
        Capability::Script
    }

    fn tier(&self) -> ProviderTier {
        ProviderTier::Local
    }

    async fn probe(&self) -> ProbeOutcome {
        let url = format!("{}/api/tags", self.base_url);
        probe_model_server(&self.http, &url, |body| array_len(body, Some("models"))).await
    }
}

#[async_trait]
impl ScriptProvider for OllamaScriptProvider {
    async fn generate_script(
        &self,
        request: &GenerationRequest,
        ctx: &StageContext,
    ) -> ProviderResult<Script> {
        let url = format!("{}/api/generate", self.base_url);
        debug!(job_id = %ctx.job_id, model = %self.model, "Requesting script from Ollama");

        let body = json!({
            "model": self.model,
            "prompt": script_prompt(request),
            "stream": false,
            "format": "json",
        });

        let answer: OllamaResponse = ctx
            .interruptible(async {
                let response = self
                    .http
                    .post(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| ProviderError::from_reqwest(self.name(), e))?;
                check_status(self.name(), response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| ProviderError::from_reqwest(self.name(), e))
            })
            .await?;

        script_from_json(self.name(), &answer.response, request.target_duration_secs)
    }
}

/// Script writer backed by an OpenAI-compatible chat completions API.
pub struct OpenAiScriptProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
}

impl OpenAiScriptProvider {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
        }
    }
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
}

#[async_trait]
impl Provider for OpenAiScriptProvider {
    fn name(&self) -> &str {
        "openai"
    }

    fn capability(&self) -> Capability {
        Capability::Script
    }

    fn tier(&self) -> ProviderTier {
        ProviderTier::Paid
    }

    async fn probe(&self) -> ProbeOutcome {
        probe_api_key(self.api_key.as_deref())
    }
}

#[async_trait]
impl ScriptProvider for OpenAiScriptProvider {
    async fn generate_script(
        &self,
        request: &GenerationRequest,
        ctx: &StageContext,
    ) -> ProviderResult<Script> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Config("OPENAI_API_KEY not set".into()))?;
        let url = format!("{}/v1/chat/completions", self.base_url);

        let body = json!({
            "model": self.model,
            "response_format": { "type": "json_object" },
            "messages": [
                { "role": "system", "content": "You write concise scripts for short narrated videos." },
                { "role": "user", "content": script_prompt(request) },
            ],
        });

        let answer: ChatResponse = ctx
            .interruptible(async {
                let response = self
                    .http
                    .post(&url)
                    .bearer_auth(api_key)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| ProviderError::from_reqwest(self.name(), e))?;
                check_status(self.name(), response)
                    .await?
                    .json()
                    .await
                    .map_err(|e| ProviderError::from_reqwest(self.name(), e))
            })
            .await?;

        let content = answer
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::invalid_response(self.name(), "empty completion"))?;

        script_from_json(self.name(), &content, request.target_duration_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use vgen_media::{ProcessRegistry, ProcessRunner};
    use vgen_models::JobId;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn ctx() -> StageContext {
        StageContext::new(
            JobId::new(),
            std::env::temp_dir(),
            CancellationToken::new(),
            ProcessRunner::new(Arc::new(ProcessRegistry::default())),
        )
    }

    fn request(secs: u32) -> GenerationRequest {
        GenerationRequest::new("How tides work. The moon pulls the ocean!", secs)
    }

    #[tokio::test]
    async fn test_template_script_fills_duration() {
        let script = TemplateScriptProvider::new()
            .generate_script(&request(30), &ctx())
            .await
            .unwrap();
        assert_eq!(script.scenes.len(), 4);
        assert!((script.total_duration_secs() - 30.0).abs() < 1e-6);
        assert_eq!(script.title, "How tides work");
        assert!(script.scenes[0].narration.starts_with("Let's talk about how tides work"));
    }

    #[tokio::test]
    async fn test_template_respects_cancellation() {
        let ctx = ctx();
        ctx.cancel.cancel();
        let err = TemplateScriptProvider::new()
            .generate_script(&request(30), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_script_from_json_weights_by_words() {
        let raw = r#"{"title":"T","scenes":[
            {"narration":"one two three","visual_prompt":"a"},
            {"narration":"  "},
            {"narration":"four"}
        ]}"#;
        let script = script_from_json("test", raw, 20).unwrap();
        assert_eq!(script.scenes.len(), 2);
        assert!((script.scenes[0].duration_secs - 15.0).abs() < 1e-6);
        assert!((script.scenes[1].duration_secs - 5.0).abs() < 1e-6);
        assert_eq!(script.scenes[1].visual_prompt, "four");
        assert_eq!(script.scenes[1].index, 1);
    }

    #[test]
    fn test_script_from_json_rejects_garbage() {
        assert!(matches!(
            script_from_json("test", "not json", 20),
            Err(ProviderError::InvalidResponse { .. })
        ));
        assert!(script_from_json("test", r#"{"scenes":[]}"#, 20).is_err());
    }

    #[tokio::test]
    async fn test_ollama_generate() {
        let server = MockServer::start().await;
        let inner = json!({
            "title": "Tides",
            "scenes": [{ "narration": "The moon pulls the sea.", "visual_prompt": "moon over sea" }]
        })
        .to_string();
        Mock::given(method("POST"))
            .and(path("/api/generate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "response": inner })))
            .mount(&server)
            .await;

        let provider = OllamaScriptProvider::new(Client::new(), server.uri(), "llama3.1");
        let script = provider.generate_script(&request(10), &ctx()).await.unwrap();
        assert_eq!(script.title, "Tides");
        assert_eq!(script.scenes.len(), 1);
        assert!((script.total_duration_secs() - 10.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_ollama_server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_string("model crashed"))
            .mount(&server)
            .await;

        let provider = OllamaScriptProvider::new(Client::new(), server.uri(), "llama3.1");
        let err = provider.generate_script(&request(10), &ctx()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(err.allows_fallback());
    }

    #[tokio::test]
    async fn test_openai_probe_and_generate() {
        let server = MockServer::start().await;
        let content = json!({
            "title": "Tides",
            "scenes": [{ "narration": "Water rises twice a day.", "visual_prompt": "beach" }]
        })
        .to_string();
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": content } }]
            })))
            .mount(&server)
            .await;

        let unconfigured = OpenAiScriptProvider::new(Client::new(), server.uri(), None, "gpt-4o-mini");
        assert!(!unconfigured.probe().await.available);

        let provider =
            OpenAiScriptProvider::new(Client::new(), server.uri(), Some("sk-test".into()), "gpt-4o-mini");
        assert!(provider.probe().await.available);
        let script = provider.generate_script(&request(12), &ctx()).await.unwrap();
        assert_eq!(script.scenes[0].visual_prompt, "beach");
    }
}
