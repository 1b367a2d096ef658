//! Visual providers.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use vgen_media::FfmpegCommand;
use vgen_models::{Capability, ProviderTier};

use crate::error::{check_status, ProviderError, ProviderResult};
use crate::probe::{array_len, probe_binary, probe_model_server, ProbeOutcome};
use crate::provider::{Provider, Script, StageContext, VisualAsset, VisualProvider};

/// Local Stable Diffusion WebUI (AUTOMATIC1111 API).
pub struct StableDiffusionVisualProvider {
    http: Client,
    base_url: String,
    width: u32,
    height: u32,
    steps: u32,
}

impl StableDiffusionVisualProvider {
    pub fn new(http: Client, base_url: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            width,
            height,
            steps: 20,
        }
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }
}

#[derive(Deserialize)]
struct Txt2ImgResponse {
    #[serde(default)]
    images: Vec<String>,
}

#[async_trait]
impl Provider for StableDiffusionVisualProvider {
    fn name(&self) -> &str {
        "stable_diffusion"
    }

    fn capability(&self) -> Capability {
        Capability::Visual
    }

    fn tier(&self) -> ProviderTier {
        ProviderTier::Local
    }

    async fn probe(&self) -> ProbeOutcome {
        let url = format!("{}/sdapi/v1/sd-models", self.base_url);
        probe_model_server(&self.http, &url, |body| array_len(body, None)).await
    }
}

#[async_trait]
impl VisualProvider for StableDiffusionVisualProvider {
    async fn generate_visuals(
        &self,
        script: &Script,
        ctx: &StageContext,
    ) -> ProviderResult<Vec<VisualAsset>> {
        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let url = format!("{}/sdapi/v1/txt2img", self.base_url);
        let mut assets = Vec::with_capacity(script.scenes.len());

        for scene in &script.scenes {
            ctx.check_cancelled()?;
            debug!(job_id = %ctx.job_id, scene = scene.index, "Generating scene image");

            let body = json!({
                "prompt": scene.visual_prompt,
                "width": self.width,
                "height": self.height,
                "steps": self.steps,
            });

            let answer: Txt2ImgResponse = ctx
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

            let encoded = answer
                .images
                .into_iter()
                .next()
                .ok_or_else(|| ProviderError::invalid_response(self.name(), "no image returned"))?;
            let png = STANDARD
                .decode(encoded.trim())
                .map_err(|e| ProviderError::invalid_response(self.name(), format!("image base64: {e}")))?;

            let path = ctx.work_dir.join(format!("scene-{:03}.png", scene.index));
            tokio::fs::write(&path, png).await?;
            assets.push(VisualAsset {
                scene_index: scene.index,
                path,
            });
        }

        info!(job_id = %ctx.job_id, count = assets.len(), "Scene images generated");
        Ok(assets)
    }
}

/// Solid colour frames rendered by FFmpeg. Needs nothing but the binary.
pub struct PlaceholderVisualProvider {
    width: u32,
    height: u32,
}

const PALETTE: [&str; 6] = ["0x1d3557", "0x457b9d", "0x2a9d8f", "0xe9c46a", "0xf4a261", "0xe76f51"];

impl PlaceholderVisualProvider {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    fn command(&self, index: usize, output: &std::path::Path) -> FfmpegCommand {
        let source = format!(
            "color=c={}:s={}x{}",
            PALETTE[index % PALETTE.len()],
            self.width,
            self.height
        );
        FfmpegCommand::new(source, output)
            .input_args(["-f", "lavfi"])
            .single_frame()
    }
}

#[async_trait]
impl Provider for PlaceholderVisualProvider {
    fn name(&self) -> &str {
        "placeholder"
    }

    fn capability(&self) -> Capability {
        Capability::Visual
    }

    fn tier(&self) -> ProviderTier {
        ProviderTier::Free
    }

    async fn probe(&self) -> ProbeOutcome {
        probe_binary("ffmpeg")
    }
}

#[async_trait]
impl VisualProvider for PlaceholderVisualProvider {
    async fn generate_visuals(
        &self,
        script: &Script,
        ctx: &StageContext,
    ) -> ProviderResult<Vec<VisualAsset>> {
        tokio::fs::create_dir_all(&ctx.work_dir).await?;
        let mut assets = Vec::with_capacity(script.scenes.len());

        for scene in &script.scenes {
            ctx.check_cancelled()?;
            let path = ctx.work_dir.join(format!("scene-{:03}.png", scene.index));
            let spec = self.command(scene.index, &path).into_spec().name("ffmpeg-placeholder");
            ctx.processes.run(&spec, &ctx.job_id, &ctx.cancel).await?;
            assets.push(VisualAsset {
                scene_index: scene.index,
                path,
            });
        }

        Ok(assets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::Scene;
    use std::path::Path;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use vgen_media::{ProcessRegistry, ProcessRunner};
    use vgen_models::JobId;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn script(scenes: usize) -> Script {
        Script {
            title: "Tides".into(),
            scenes: (0..scenes)
                .map(|index| Scene {
                    index,
                    narration: format!("Scene {index}."),
                    visual_prompt: format!("prompt {index}"),
                    duration_secs: 3.0,
                })
                .collect(),
        }
    }

    fn ctx(dir: &Path) -> StageContext {
        StageContext::new(
            JobId::new(),
            dir,
            CancellationToken::new(),
            ProcessRunner::new(Arc::new(ProcessRegistry::default())),
        )
    }

    #[tokio::test]
    async fn test_stable_diffusion_probe_counts_models() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/sdapi/v1/sd-models"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "title": "sdxl" }])))
            .mount(&server)
            .await;

        let provider = StableDiffusionVisualProvider::new(Client::new(), server.uri(), 512, 512);
        assert!(provider.probe().await.available);
    }

    #[tokio::test]
    async fn test_stable_diffusion_writes_one_image_per_scene() {
        let server = MockServer::start().await;
        let png = STANDARD.encode(b"\x89PNG fake");
        Mock::given(method("POST"))
            .and(path("/sdapi/v1/txt2img"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "images": [png] })))
            .expect(2)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let provider = StableDiffusionVisualProvider::new(Client::new(), server.uri(), 512, 512);
        let assets = provider.generate_visuals(&script(2), &ctx(dir.path())).await.unwrap();
        assert_eq!(assets.len(), 2);
        assert_eq!(assets[1].path, dir.path().join("scene-001.png"));
        assert_eq!(std::fs::read(&assets[0].path).unwrap(), b"\x89PNG fake");
    }

    #[tokio::test]
    async fn test_stable_diffusion_bad_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "images": [] })))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let provider = StableDiffusionVisualProvider::new(Client::new(), server.uri(), 512, 512);
        let err = provider.generate_visuals(&script(1), &ctx(dir.path())).await.unwrap_err();
        assert!(matches!(err, ProviderError::InvalidResponse { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_scene() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path());
        ctx.cancel.cancel();
        let err = PlaceholderVisualProvider::new(64, 64)
            .generate_visuals(&script(3), &ctx)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_placeholder_command_uses_lavfi() {
        let args = PlaceholderVisualProvider::new(640, 360)
            .command(7, Path::new("/tmp/scene-007.png"))
            .build_args();
        let lavfi = args.iter().position(|a| a == "lavfi").unwrap();
        let source = args.iter().position(|a| a.starts_with("color=c=")).unwrap();
        assert!(lavfi < source);
        assert!(args.contains(&"color=c=0x457b9d:s=640x360".to_string()));
    }
}
