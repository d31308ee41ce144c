//! Ollama-backed implementation of the model capabilities.
//!
//! Loading verifies (and optionally pulls) the model, then preloads it so the
//! first request does not pay the load cost. Generation uses `/api/generate`
//! in raw mode with a locally rendered Gemma chat template.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures::StreamExt;
use image::{ImageFormat, RgbImage};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{
    BackendError, ChatMessage, ContentPart, DeviceMap, EncodedInput, LoadConfig, LoadedModel,
    ModelLoader, Role, SamplingConfig, TextSink, Tokenizer, VisionModel,
};

pub const OLLAMA_DEFAULT_URL: &str = "http://localhost:11434";

/// Keep loaded models resident for the lifetime of the server.
const KEEP_ALIVE_FOREVER: i64 = -1;

#[derive(Serialize)]
struct ShowRequest<'a> {
    model: &'a str,
}

#[derive(Deserialize, Default)]
struct ShowResponse {
    #[serde(default)]
    details: ModelDetails,
}

#[derive(Deserialize, Default)]
struct ModelDetails {
    #[serde(default)]
    quantization_level: String,
    #[serde(default)]
    parameter_size: String,
}

#[derive(Serialize)]
struct PullRequest<'a> {
    model: &'a str,
    stream: bool,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    prompt: Option<&'a str>,
    #[serde(skip_serializing_if = "no_images")]
    images: &'a [String],
    raw: bool,
    stream: bool,
    keep_alive: i64,
    options: OllamaOptions,
}

fn no_images(images: &&[String]) -> bool {
    images.is_empty()
}

#[derive(Serialize, Default, Clone, Debug, PartialEq)]
struct OllamaOptions {
    num_ctx: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_gpu: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_k: Option<u32>,
}

impl OllamaOptions {
    fn for_load(config: &LoadConfig) -> Self {
        Self {
            num_ctx: config.max_seq_length,
            num_gpu: match config.device_map {
                DeviceMap::Cpu => Some(0),
                DeviceMap::Auto | DeviceMap::Gpu => None,
            },
            ..Self::default()
        }
    }

    // Ollama always keeps its KV cache on, so `use_cache` has no knob here.
    fn with_sampling(&self, sampling: &SamplingConfig) -> Self {
        Self {
            num_predict: Some(sampling.max_new_tokens),
            temperature: Some(sampling.temperature),
            top_p: Some(sampling.top_p),
            top_k: Some(sampling.top_k),
            ..self.clone()
        }
    }
}

#[derive(Deserialize)]
struct GenerateChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BackendError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(BackendError::Status { status, body })
}

pub struct OllamaLoader {
    client: Client,
    base_url: String,
}

impl OllamaLoader {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        // No overall timeout: generation streams for as long as the model talks.
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn show(&self, model_id: &str) -> Result<Option<ShowResponse>, BackendError> {
        let response = self
            .client
            .post(format!("{}/api/show", self.base_url))
            .json(&ShowRequest { model: model_id })
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let show = check_status(response).await?.json().await?;
        Ok(Some(show))
    }

    async fn pull(&self, model_id: &str) -> Result<(), BackendError> {
        info!(model = model_id, "pulling model from registry");
        let response = self
            .client
            .post(format!("{}/api/pull", self.base_url))
            .json(&PullRequest {
                model: model_id,
                stream: false,
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }

    async fn preload(&self, model_id: &str, options: &OllamaOptions) -> Result<(), BackendError> {
        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&GenerateRequest {
                model: model_id,
                prompt: None,
                images: &[],
                raw: false,
                stream: false,
                keep_alive: KEEP_ALIVE_FOREVER,
                options: options.clone(),
            })
            .send()
            .await?;
        check_status(response).await?;
        Ok(())
    }
}

#[async_trait]
impl ModelLoader for OllamaLoader {
    async fn load(&self, model_id: &str, config: &LoadConfig) -> Result<LoadedModel, BackendError> {
        let show = match self.show(model_id).await? {
            Some(show) => show,
            None if config.pull_missing => {
                self.pull(model_id).await?;
                self.show(model_id)
                    .await?
                    .ok_or_else(|| BackendError::ModelNotFound(model_id.to_string()))?
            }
            None => return Err(BackendError::ModelNotFound(model_id.to_string())),
        };

        let details = &show.details;
        if config.load_in_4bit && !details.quantization_level.to_uppercase().starts_with("Q4") {
            warn!(
                model = model_id,
                quantization = %details.quantization_level,
                "4-bit loading requested but the backend model is not 4-bit quantized"
            );
        }
        if config.dtype != "auto" {
            debug!(model = model_id, dtype = %config.dtype, "dtype is fixed by the backend model file");
        }

        let options = OllamaOptions::for_load(config);
        self.preload(model_id, &options).await?;

        info!(
            model = model_id,
            parameters = %details.parameter_size,
            quantization = %details.quantization_level,
            num_ctx = options.num_ctx,
            "model loaded"
        );

        Ok(LoadedModel {
            model: Arc::new(OllamaModel {
                client: self.client.clone(),
                base_url: self.base_url.clone(),
                model_id: model_id.to_string(),
                options,
            }),
            tokenizer: Arc::new(GemmaChatTemplate),
        })
    }
}

pub struct OllamaModel {
    client: Client,
    base_url: String,
    model_id: String,
    options: OllamaOptions,
}

impl OllamaModel {
    /// Returns `true` once the final chunk has been forwarded.
    async fn forward_line(line: &[u8], sink: &TextSink) -> Result<bool, BackendError> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        if line.is_empty() {
            return Ok(false);
        }

        let chunk: GenerateChunk = serde_json::from_str(line)
            .map_err(|e| BackendError::Protocol(format!("invalid generate chunk: {}", e)))?;

        if let Some(error) = chunk.error {
            return Err(BackendError::Generation(error));
        }

        sink.push(chunk.response).await?;
        Ok(chunk.done)
    }
}

#[async_trait]
impl VisionModel for OllamaModel {
    async fn generate(
        &self,
        input: EncodedInput,
        sampling: &SamplingConfig,
        sink: TextSink,
    ) -> Result<(), BackendError> {
        if sink.is_closed() {
            return Err(BackendError::Cancelled);
        }

        let request = GenerateRequest {
            model: &self.model_id,
            prompt: Some(&input.prompt),
            images: &input.images,
            raw: true,
            stream: true,
            keep_alive: KEEP_ALIVE_FOREVER,
            options: self.options.with_sampling(sampling),
        };

        let response = self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&request)
            .send()
            .await?;
        let response = check_status(response).await?;

        let mut byte_stream = response.bytes_stream();
        let mut buffer = Vec::new();

        while let Some(chunk) = byte_stream.next().await {
            buffer.extend_from_slice(&chunk?);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if Self::forward_line(&line, &sink).await? {
                    return Ok(());
                }
            }
        }

        if Self::forward_line(&buffer, &sink).await? {
            return Ok(());
        }

        Err(BackendError::Protocol(
            "stream ended before the final chunk".to_string(),
        ))
    }
}

/// Gemma turn format with Ollama's numbered image placeholders.
pub struct GemmaChatTemplate;

impl GemmaChatTemplate {
    fn placeholder(index: usize) -> String {
        format!("[img-{}]", index)
    }
}

impl Tokenizer for GemmaChatTemplate {
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, BackendError> {
        if messages.is_empty() {
            return Err(BackendError::Protocol("empty conversation".to_string()));
        }

        let mut prompt = String::new();
        let mut images = 0;
        for message in messages {
            let role = match message.role {
                Role::User => "user",
                Role::Model => "model",
            };
            prompt.push_str("<start_of_turn>");
            prompt.push_str(role);
            prompt.push('\n');
            for part in &message.content {
                match part {
                    ContentPart::Image => {
                        prompt.push_str(&Self::placeholder(images));
                        images += 1;
                    }
                    ContentPart::Text { text } => prompt.push_str(text.trim()),
                }
            }
            prompt.push_str("<end_of_turn>\n");
        }

        if add_generation_prompt {
            prompt.push_str("<start_of_turn>model\n");
        }
        Ok(prompt)
    }

    fn encode(&self, image: &RgbImage, text: &str) -> Result<EncodedInput, BackendError> {
        if !text.contains(&Self::placeholder(0)) {
            return Err(BackendError::Protocol(
                "prompt has no image placeholder".to_string(),
            ));
        }

        let mut png = Cursor::new(Vec::new());
        image.write_to(&mut png, ImageFormat::Png)?;

        Ok(EncodedInput {
            prompt: text.to_string(),
            images: vec![STANDARD.encode(png.into_inner())],
        })
    }
}
