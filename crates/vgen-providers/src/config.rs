//! Provider configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use vgen_models::{ProviderProfile, ProviderTier};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::ProviderSet;
use crate::script::{OllamaScriptProvider, OpenAiScriptProvider, TemplateScriptProvider};
use crate::selector::{PriorityTable, ProviderSelector, DEFAULT_PROBE_FRESHNESS, DEFAULT_PROBE_TIMEOUT};
use crate::visual::{PlaceholderVisualProvider, StableDiffusionVisualProvider};
use crate::voice::{ElevenLabsVoiceProvider, PiperVoiceProvider};

/// Endpoints, keys and tier order for every provider.
#[derive(Debug, Clone)]
pub struct ProvidersConfig {
    pub ollama_url: String,
    pub ollama_model: String,
    pub openai_base_url: String,
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub piper_binary: String,
    pub piper_model: Option<PathBuf>,
    pub elevenlabs_base_url: String,
    pub elevenlabs_api_key: Option<String>,
    pub elevenlabs_voice_id: String,
    pub stable_diffusion_url: String,
    /// Frame size for generated stills
    pub width: u32,
    pub height: u32,
    /// Timeout for generation requests (not probes)
    pub request_timeout: Duration,
    pub probe_timeout: Duration,
    /// How long a probe result is trusted
    pub probe_freshness: Duration,
    pub offline_tiers: Vec<ProviderTier>,
    pub quality_tiers: Vec<ProviderTier>,
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            ollama_url: "http://localhost:11434".to_string(),
            ollama_model: "llama3.1".to_string(),
            openai_base_url: "https://api.openai.com".to_string(),
            openai_api_key: None,
            openai_model: "gpt-4o-mini".to_string(),
            piper_binary: "piper".to_string(),
            piper_model: None,
            elevenlabs_base_url: "https://api.elevenlabs.io".to_string(),
            elevenlabs_api_key: None,
            elevenlabs_voice_id: "21m00Tcm4TlvDq8ikWAM".to_string(),
            stable_diffusion_url: "http://localhost:7860".to_string(),
            width: 1280,
            height: 720,
            request_timeout: Duration::from_secs(300),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe_freshness: DEFAULT_PROBE_FRESHNESS,
            offline_tiers: vec![ProviderTier::Local, ProviderTier::Free, ProviderTier::Paid],
            quality_tiers: vec![ProviderTier::Paid, ProviderTier::Local, ProviderTier::Free],
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

/// Parse a comma-separated tier list such as `local,free,paid`.
pub fn parse_tiers(value: &str) -> ProviderResult<Vec<ProviderTier>> {
    let tiers = value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<ProviderTier>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProviderError::Config(e.to_string()))?;
    if tiers.is_empty() {
        return Err(ProviderError::Config("tier list is empty".into()));
    }
    Ok(tiers)
}

impl ProvidersConfig {
    /// Create config from environment variables.
    pub fn from_env() -> ProviderResult<Self> {
        let defaults = Self::default();

        let offline_tiers = match env_optional("PROVIDER_TIERS_OFFLINE") {
            Some(v) => parse_tiers(&v)?,
            None => defaults.offline_tiers,
        };
        let quality_tiers = match env_optional("PROVIDER_TIERS_QUALITY") {
            Some(v) => parse_tiers(&v)?,
            None => defaults.quality_tiers,
        };

        Ok(Self {
            ollama_url: env_string("OLLAMA_URL", &defaults.ollama_url),
            ollama_model: env_string("OLLAMA_MODEL", &defaults.ollama_model),
            openai_base_url: env_string("OPENAI_BASE_URL", &defaults.openai_base_url),
            openai_api_key: env_optional("OPENAI_API_KEY"),
            openai_model: env_string("OPENAI_MODEL", &defaults.openai_model),
            piper_binary: env_string("PIPER_BINARY", &defaults.piper_binary),
            piper_model: env_optional("PIPER_MODEL").map(PathBuf::from),
            elevenlabs_base_url: env_string("ELEVENLABS_BASE_URL", &defaults.elevenlabs_base_url),
            elevenlabs_api_key: env_optional("ELEVENLABS_API_KEY"),
            elevenlabs_voice_id: env_string("ELEVENLABS_VOICE_ID", &defaults.elevenlabs_voice_id),
            stable_diffusion_url: env_string("SD_URL", &defaults.stable_diffusion_url),
            width: env_parse("VIDEO_WIDTH", defaults.width),
            height: env_parse("VIDEO_HEIGHT", defaults.height),
            request_timeout: Duration::from_secs(env_parse("PROVIDER_REQUEST_TIMEOUT_SECS", 300)),
            probe_timeout: Duration::from_millis(env_parse("PROBE_TIMEOUT_MS", 2000)),
            probe_freshness: Duration::from_secs(env_parse("PROBE_FRESHNESS_SECS", 60)),
            offline_tiers,
            quality_tiers,
        })
    }

    pub fn priority_table(&self) -> PriorityTable {
        PriorityTable::new()
            .with_tiers(ProviderProfile::OfflinePreferred, self.offline_tiers.clone())
            .with_tiers(ProviderProfile::QualityPreferred, self.quality_tiers.clone())
    }

    pub fn selector(&self) -> ProviderSelector {
        ProviderSelector::new(self.priority_table())
            .with_probe_timeout(self.probe_timeout)
            .with_freshness(self.probe_freshness)
    }

    /// Build every configured provider. Providers without keys or models are
    /// still registered so selection can report why they were skipped.
    pub fn build(&self) -> ProviderResult<ProviderSet> {
        let http = Client::builder()
            .timeout(self.request_timeout)
            .build()
            .map_err(|e| ProviderError::Config(format!("HTTP client: {e}")))?;

        Ok(ProviderSet::new()
            .with_script(Arc::new(OllamaScriptProvider::new(
                http.clone(),
                &self.ollama_url,
                &self.ollama_model,
            )))
            .with_script(Arc::new(TemplateScriptProvider::new()))
            .with_script(Arc::new(OpenAiScriptProvider::new(
                http.clone(),
                &self.openai_base_url,
                self.openai_api_key.clone(),
                &self.openai_model,
            )))
            .with_voice(Arc::new(PiperVoiceProvider::new(
                &self.piper_binary,
                self.piper_model.clone(),
            )))
            .with_voice(Arc::new(ElevenLabsVoiceProvider::new(
                http.clone(),
                &self.elevenlabs_base_url,
                self.elevenlabs_api_key.clone(),
                &self.elevenlabs_voice_id,
            )))
            .with_visual(Arc::new(StableDiffusionVisualProvider::new(
                http,
                &self.stable_diffusion_url,
                self.width,
                self.height,
            )))
            .with_visual(Arc::new(PlaceholderVisualProvider::new(self.width, self.height))))
    }
}
