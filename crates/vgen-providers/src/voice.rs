//! Voice providers.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::json;
use tracing::{debug, info};

use vgen_media::ProcessSpec;
use vgen_models::{Capability, ProviderTier};

use crate::error::{check_status, ProviderError, ProviderResult};
use crate::probe::{probe_api_key, probe_binary, probe_file, ProbeOutcome};
use crate::provider::{Provider, Script, StageContext, VoiceProvider, VoiceTrack};

/// Local Piper TTS, run as a tracked subprocess reading text on stdin.
pub struct PiperVoiceProvider {
    binary: String,
    model_path: Option<PathBuf>,
    timeout: Duration,
}

impl PiperVoiceProvider {
    pub fn new(binary: impl Into<String>, model_path: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            model_path,
            timeout: Duration::from_secs(600),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn spec(&self, model: &Path, output: &Path, text: &str) -> ProcessSpec {
        ProcessSpec::new(&self.binary)
            .name("piper")
            .arg("--model")
            .arg(model.to_string_lossy())
            .arg("--output_file")
            .arg(output.to_string_lossy())
            .stdin(text.as_bytes().to_vec())
            .timeout(self.timeout)
    }
}

#[async_trait]
impl Provider for PiperVoiceProvider {
    fn name(&self) -> &str {
        "piper"
    }

    fn capability(&self) -> Capability {
        Capability::Voice
    }

    fn tier(&self) -> ProviderTier {
        ProviderTier::Local
    }

    async fn probe(&self) -> ProbeOutcome {
        let binary = probe_binary(&self.binary);
        if !binary.available {
            return binary;
        }
        match &self.model_path {
            Some(model) => probe_file(model, "voice model"),
            None => ProbeOutcome::down("PIPER_MODEL not configured"),
        }
    }
}

#[async_trait]
impl VoiceProvider for PiperVoiceProvider {
    async fn synthesize(&self, script: &Script, ctx: &StageContext) -> ProviderResult<VoiceTrack> {
        let model = self
            .model_path
            .as_ref()
            .ok_or_else(|| ProviderError::Config("PIPER_MODEL not configured".into()))?;
        let text = script.narration();
        if text.is_empty() {
            return Err(ProviderError::invalid_input("nothing to narrate"));
        }

        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let output = ctx.work_dir.join("voice.wav");
        let spec = self.spec(model, &output, &text);

        ctx.processes.run(&spec, &ctx.job_id, &ctx.cancel).await?;

        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(ProviderError::invalid_response(self.name(), "piper produced no audio"));
        }

        info!(job_id = %ctx.job_id, path = %output.display(), "Narration synthesized with piper");
        Ok(VoiceTrack {
            path: output,
            duration_secs: script.total_duration_secs(),
        })
    }
}

/// ElevenLabs text-to-speech API.
pub struct ElevenLabsVoiceProvider {
    http: Client,
    base_url: String,
    api_key: Option<String>,
    voice_id: String,
    model_id: String,
}

impl ElevenLabsVoiceProvider {
    pub fn new(
        http: Client,
        base_url: impl Into<String>,
        api_key: Option<String>,
        voice_id: impl Into<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            voice_id: voice_id.into(),
            model_id: "eleven_multilingual_v2".to_string(),
        }
    }

    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }
}

#[async_trait]
impl Provider for ElevenLabsVoiceProvider {
    fn name(&self) -> &str {
        "elevenlabs"
    }

    fn capability(&self) -> Capability {
        Capability::Voice
    }

    fn tier(&self) -> ProviderTier {
        ProviderTier::Paid
    }

    async fn probe(&self) -> ProbeOutcome {
        probe_api_key(self.api_key.as_deref())
    }
}

#[async_trait]
impl VoiceProvider for ElevenLabsVoiceProvider {
    async fn synthesize(&self, script: &Script, ctx: &StageContext) -> ProviderResult<VoiceTrack> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| ProviderError::Config("ELEVENLABS_API_KEY not set".into()))?;
        let text = script.narration();
        if text.is_empty() {
            return Err(ProviderError::invalid_input("nothing to narrate"));
        }

        let url = format!("{}/v1/text-to-speech/{}", self.base_url, self.voice_id);
        debug!(job_id = %ctx.job_id, voice = %self.voice_id, "Requesting ElevenLabs synthesis");

        let audio = ctx
            .interruptible(async {
                let response = self
                    .http
                    .post(&url)
                    .header("xi-api-key", api_key)
                    .header("accept", "audio/mpeg")
                    .json(&json!({ "text": text, "model_id": self.model_id }))
                    .send()
                    .await
                    .map_err(|e| ProviderError::from_reqwest(self.name(), e))?;
                check_status(self.name(), response)
                    .await?
                    .bytes()
                    .await
                    .map_err(|e| ProviderError::from_reqwest(self.name(), e))
            })
            .await?;

        if audio.is_empty() {
            return Err(ProviderError::invalid_response(self.name(), "empty audio body"));
        }

        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let output = ctx.work_dir.join("voice.mp3");
        tokio::fs::write(&output, &audio).await?;

        info!(job_id = %ctx.job_id, bytes = audio.len(), "Narration synthesized with elevenlabs");
        Ok(VoiceTrack {
            path: output,
            duration_secs: script.total_duration_secs(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Scene;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use vgen_media::{ProcessRegistry, ProcessRunner};
    use vgen_models::JobId;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn script() -> Script {
        Script {
            title: "Tides".into(),
            scenes: vec![Scene {
                index: 0,
                narration: "The moon pulls the sea.".into(),
                visual_prompt: "moon".into(),
                duration_secs: 6.0,
            }],
        }
    }

    fn ctx(dir: &std::path::Path) -> StageContext {
        StageContext::new(
            JobId::new(),
            dir,
            CancellationToken::new(),
            ProcessRunner::new(Arc::new(ProcessRegistry::default())),
        )
    }

    #[tokio::test]
    async fn test_piper_probe_requires_model() {
        let dir = tempfile::tempdir().unwrap();
        let provider = PiperVoiceProvider::new("vgen-missing-piper", Some(dir.path().join("en.onnx")));
        let outcome = provider.probe().await;
        assert!(!outcome.available);
        assert!(outcome.reason.unwrap().contains("not found in PATH"));
    }

    #[tokio::test]
    async fn test_piper_missing_binary_allows_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let model = dir.path().join("en.onnx");
        std::fs::write(&model, b"model").unwrap();
        let provider = PiperVoiceProvider::new("vgen-missing-piper", Some(model));
        let err = provider.synthesize(&script(), &ctx(dir.path())).await.unwrap_err();
        assert!(err.allows_fallback());
        assert!(matches!(err, ProviderError::Process(_)));
    }

    #[tokio::test]
    async fn test_elevenlabs_writes_audio() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/text-to-speech/rachel"))
            .and(header("xi-api-key", "el-key"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xFB, 0x90, 0x00]))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let provider =
            ElevenLabsVoiceProvider::new(Client::new(), server.uri(), Some("el-key".into()), "rachel");
        let track = provider.synthesize(&script(), &ctx(dir.path())).await.unwrap();
        assert_eq!(track.path, dir.path().join("voice.mp3"));
        assert_eq!(std::fs::read(&track.path).unwrap().len(), 4);
        assert_eq!(track.duration_secs, 6.0);
    }

    #[tokio::test]
    async fn test_elevenlabs_rejection_is_not_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("invalid api key"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let provider =
            ElevenLabsVoiceProvider::new(Client::new(), server.uri(), Some("bad".into()), "rachel");
        let err = provider.synthesize(&script(), &ctx(dir.path())).await.unwrap_err();
        assert!(matches!(err, ProviderError::Rejected { status: 401, .. }));
        assert!(!err.is_transient());
        assert!(err.allows_fallback());
    }
}
