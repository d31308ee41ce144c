//! In-process backend driven by fixed scripts, used by the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use tokio::sync::Notify;

use super::ollama::GemmaChatTemplate;
use super::{
    BackendError, ChatMessage, EncodedInput, LoadConfig, LoadedModel, ModelLoader,
    SamplingConfig, TextSink, Tokenizer, VisionModel,
};
use crate::vision::IMAGE_SIZE;

#[derive(Debug, Default)]
pub struct Calls {
    pub load: AtomicUsize,
    pub encode: AtomicUsize,
    pub generate: AtomicUsize,
    pub cancelled: AtomicUsize,
}

impl Calls {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Default)]
pub struct Script {
    pub chunks: Vec<String>,
    /// Wait on this after the first chunk.
    pub hold_after_first: Option<Arc<Notify>>,
    /// Fail instead of emitting the chunk at this index.
    pub fail_at: Option<usize>,
    /// Emit forever until the reader goes away.
    pub endless: bool,
}

impl Script {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            chunks: chunks.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

#[derive(Default)]
pub struct ScriptedLoader {
    scripts: HashMap<String, Script>,
    pub calls: Arc<Calls>,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_model(mut self, model_id: &str, script: Script) -> Self {
        self.scripts.insert(model_id.to_string(), script);
        self
    }
}

#[async_trait]
impl ModelLoader for ScriptedLoader {
    async fn load(&self, model_id: &str, _config: &LoadConfig) -> Result<LoadedModel, BackendError> {
        self.calls.load.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .get(model_id)
            .cloned()
            .ok_or_else(|| BackendError::ModelNotFound(model_id.to_string()))?;

        Ok(LoadedModel {
            model: Arc::new(ScriptedModel {
                script,
                calls: self.calls.clone(),
            }),
            tokenizer: Arc::new(ScriptedTokenizer {
                calls: self.calls.clone(),
            }),
        })
    }
}

struct ScriptedTokenizer {
    calls: Arc<Calls>,
}

impl Tokenizer for ScriptedTokenizer {
    fn apply_chat_template(
        &self,
        messages: &[ChatMessage],
        add_generation_prompt: bool,
    ) -> Result<String, BackendError> {
        GemmaChatTemplate.apply_chat_template(messages, add_generation_prompt)
    }

    fn encode(&self, image: &RgbImage, text: &str) -> Result<EncodedInput, BackendError> {
        self.calls.encode.fetch_add(1, Ordering::SeqCst);
        if image.dimensions() != (IMAGE_SIZE, IMAGE_SIZE) {
            return Err(BackendError::Protocol(format!(
                "expected a {0}x{0} raster, got {1:?}",
                IMAGE_SIZE,
                image.dimensions()
            )));
        }
        Ok(EncodedInput {
            prompt: text.to_string(),
            images: Vec::new(),
        })
    }
}

struct ScriptedModel {
    script: Script,
    calls: Arc<Calls>,
}

#[async_trait]
impl VisionModel for ScriptedModel {
    async fn generate(
        &self,
        _input: EncodedInput,
        _sampling: &SamplingConfig,
        sink: TextSink,
    ) -> Result<(), BackendError> {
        self.calls.generate.fetch_add(1, Ordering::SeqCst);

        if self.script.endless {
            loop {
                if let Err(e) = sink.push("tick ").await {
                    self.calls.cancelled.fetch_add(1, Ordering::SeqCst);
                    return Err(e);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }

        for (i, chunk) in self.script.chunks.iter().enumerate() {
            if self.script.fail_at == Some(i) {
                return Err(BackendError::Generation("scripted failure".to_string()));
            }
            sink.push(chunk.clone()).await?;
            if i == 0 {
                if let Some(gate) = &self.script.hold_after_first {
                    gate.notified().await;
                }
            }
        }
        Ok(())
    }
}
