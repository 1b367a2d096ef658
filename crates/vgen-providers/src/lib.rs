//! Generation providers and tiered provider selection.
//!
//! Every pipeline stage (script, voice, visuals) has a list of interchangeable
//! providers. The [`ProviderSelector`] probes them with a bounded timeout and
//! orders the live ones by the tier order configured for the caller's
//! [`ProviderProfile`](vgen_models::ProviderProfile).

pub mod config;
pub mod error;
pub mod probe;
pub mod provider;
pub mod script;
pub mod selector;
pub mod visual;
pub mod voice;

pub use config::ProvidersConfig;
pub use error::{NoProviderAvailable, ProviderError, ProviderResult};
pub use probe::ProbeOutcome;
pub use provider::{
    Provider, ProviderSet, Scene, Script, ScriptProvider, StageContext, VisualAsset, VisualProvider,
    VoiceProvider, VoiceTrack,
};
pub use script::{OllamaScriptProvider, OpenAiScriptProvider, TemplateScriptProvider};
pub use selector::{
    select_chain, PriorityTable, ProviderSelector, DEFAULT_PROBE_FRESHNESS, DEFAULT_PROBE_TIMEOUT,
};
pub use visual::{PlaceholderVisualProvider, StableDiffusionVisualProvider};
pub use voice::{ElevenLabsVoiceProvider, PiperVoiceProvider};
