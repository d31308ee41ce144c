//! Narrow capabilities the server needs from a vision-language model runtime.
//!
//! The HTTP layer only ever talks to these traits. `ollama` provides the
//! production implementation; tests plug in a scripted one.

pub mod ollama;

#[cfg(test)]
pub mod scripted;

use std::sync::Arc;

use async_trait::async_trait;
use image::RgbImage;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("model '{0}' is not available on the backend")]
    ModelNotFound(String),

    #[error("failed to encode image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("malformed backend response: {0}")]
    Protocol(String),

    #[error("generation failed: {0}")]
    Generation(String),

    #[error("receiver dropped, generation cancelled")]
    Cancelled,
}

/// How a model should be brought into memory.
#[derive(Debug, Clone, PartialEq)]
pub struct LoadConfig {
    /// `auto` leaves the precision to the runtime.
    pub dtype: String,
    pub load_in_4bit: bool,
    pub max_seq_length: u32,
    pub device_map: DeviceMap,
    /// Fetch the model when the backend does not have it yet.
    pub pull_missing: bool,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            dtype: "auto".to_string(),
            load_in_4bit: true,
            max_seq_length: 1024,
            device_map: DeviceMap::Auto,
            pull_missing: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DeviceMap {
    Auto,
    Cpu,
    Gpu,
}

/// Sampling parameters applied to every generation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SamplingConfig {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub use_cache: bool,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 2048,
            temperature: 1.0,
            top_p: 0.95,
            top_k: 64,
            use_cache: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentPart {
    Image,
    Text { text: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: Vec<ContentPart>,
}

impl ChatMessage {
    pub fn user(content: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content,
        }
    }
}

/// Model-ready input produced by a [`Tokenizer`].
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedInput {
    pub prompt: String,
    /// Base64 encoded PNG payloads, in placeholder order.
    pub images: Vec<String>,
}

/// Write side of the streaming bridge.
///
/// Pushing fails with [`BackendError::Cancelled`] once the reader is gone, which
/// is how a disconnected client stops generation.
#[derive(Debug, Clone)]
pub struct TextSink {
    tx: mpsc::Sender<String>,
}

impl TextSink {
    pub fn new(tx: mpsc::Sender<String>) -> Self {
        Self { tx }
    }

    pub async fn push(&self, text: impl Into<String>) -> Result<(), BackendError> {
        let text = text.into();
        if text.is_empty() {
            return Ok(());
        }
        self.tx.send(text).await.map_err(|_| BackendError::Cancelled)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub trait Tokenizer: Send + Sync {
    /// Render a conversation into the model's prompt format.
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, BackendError>;

    fn encode(&self, image: &RgbImage, text: &str) -> Result<EncodedInput, BackendError>;
}

#[async_trait]
pub trait VisionModel: Send + Sync {
    /// Generate text for `input`, pushing increments into `sink` as they are produced.
    async fn generate(
        &self,
        input: EncodedInput,
        sampling: &SamplingConfig,
        sink: TextSink,
    ) -> Result<(), BackendError>;
}

pub struct LoadedModel {
    pub model: Arc<dyn VisionModel>,
    pub tokenizer: Arc<dyn Tokenizer>,
}

#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, model_id: &str, config: &LoadConfig) -> Result<LoadedModel, BackendError>;
}
