use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{ensure, Context, Result};
use clap::Parser;

use crate::backend::ollama::OLLAMA_DEFAULT_URL;
use crate::backend::{DeviceMap, LoadConfig, SamplingConfig};
use crate::registry::ModelSpec;

const E2B_DEFAULT_MODEL: &str = "hf.co/qizunlee/gemma3n_E2B_it_ft_3RGarbageClassification";
const E4B_DEFAULT_MODEL: &str = "hf.co/qizunlee/gemma3n_E4B_it_ft_3RGarbageClassification";

#[derive(Debug, Clone, Parser)]
#[command(name = "gemma3n-server", version, about = "Gemma 3n garbage classification inference API")]
pub struct Cli {
    #[arg(long, env = "GEMMA3N_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "GEMMA3N_PORT", default_value_t = 8000)]
    pub port: u16,

    /// Base URL of the Ollama server that runs the models
    #[arg(long, env = "OLLAMA_URL", default_value = OLLAMA_DEFAULT_URL)]
    pub ollama_url: String,

    /// Backend model serving the `e2b` variant
    #[arg(long, env = "GEMMA3N_E2B_MODEL", default_value = E2B_DEFAULT_MODEL)]
    pub e2b_model: String,

    /// Backend model serving the `e4b` variant
    #[arg(long, env = "GEMMA3N_E4B_MODEL", default_value = E4B_DEFAULT_MODEL)]
    pub e4b_model: String,

    #[arg(long, env = "GEMMA3N_DTYPE", default_value = "auto")]
    pub dtype: String,

    #[arg(long, env = "GEMMA3N_LOAD_IN_4BIT", default_value_t = true, action = clap::ArgAction::Set)]
    pub load_in_4bit: bool,

    #[arg(long, env = "GEMMA3N_MAX_SEQ_LENGTH", default_value_t = 1024)]
    pub max_seq_length: u32,

    #[arg(long, env = "GEMMA3N_DEVICE_MAP", value_enum, default_value_t = DeviceMap::Auto)]
    pub device_map: DeviceMap,

    /// Pull models the backend does not have yet instead of failing startup
    #[arg(long, env = "GEMMA3N_PULL_MISSING", default_value_t = false)]
    pub pull_missing: bool,

    #[arg(long, default_value_t = 2048)]
    pub max_new_tokens: u32,

    #[arg(long, default_value_t = 1.0)]
    pub temperature: f32,

    #[arg(long, default_value_t = 0.95)]
    pub top_p: f32,

    #[arg(long, default_value_t = 64)]
    pub top_k: u32,

    /// Generations allowed to run at the same time
    #[arg(long, env = "GEMMA3N_MAX_CONCURRENT", default_value_t = 4)]
    pub max_concurrent_generations: usize,

    /// How long a request waits for a free generation slot
    #[arg(long, default_value_t = 30)]
    pub queue_timeout_secs: u64,

    /// Text increments buffered between the generator and the response
    #[arg(long, default_value_t = 32)]
    pub stream_buffer: usize,

    #[arg(long, default_value_t = 10 * 1024 * 1024)]
    pub max_upload_bytes: usize,
}

/// Per-request knobs shared by every inference call.
#[derive(Debug, Clone)]
pub struct InferenceSettings {
    pub sampling: SamplingConfig,
    pub queue_timeout: Duration,
    pub stream_buffer: usize,
}

impl Default for InferenceSettings {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            queue_timeout: Duration::from_secs(30),
            stream_buffer: 32,
        }
    }
}

impl Cli {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.max_concurrent_generations > 0,
            "--max-concurrent-generations must be at least 1"
        );
        ensure!(self.stream_buffer > 0, "--stream-buffer must be at least 1");
        ensure!(self.max_new_tokens > 0, "--max-new-tokens must be at least 1");
        ensure!(self.temperature >= 0.0, "--temperature must not be negative");
        ensure!(
            self.top_p > 0.0 && self.top_p <= 1.0,
            "--top-p must be in (0, 1]"
        );
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid listen address {}:{}", self.host, self.port))
    }

    pub fn model_specs(&self) -> Vec<ModelSpec> {
        vec![
            ModelSpec::new("e2b", self.e2b_model.clone()),
            ModelSpec::new("e4b", self.e4b_model.clone()),
        ]
    }

    pub fn load_config(&self) -> LoadConfig {
        LoadConfig {
            dtype: self.dtype.clone(),
            load_in_4bit: self.load_in_4bit,
            max_seq_length: self.max_seq_length,
            device_map: self.device_map,
            pull_missing: self.pull_missing,
        }
    }

    pub fn inference_settings(&self) -> InferenceSettings {
        InferenceSettings {
            sampling: SamplingConfig {
                max_new_tokens: self.max_new_tokens,
                temperature: self.temperature,
                top_p: self.top_p,
                top_k: self.top_k,
                use_cache: true,
            },
            queue_timeout: Duration::from_secs(self.queue_timeout_secs),
            stream_buffer: self.stream_buffer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_fixed_generation_parameters() {
        let cli = Cli::parse_from(["gemma3n-server"]);
        cli.validate().unwrap();

        assert_eq!(cli.bind_addr().unwrap().port(), 8000);
        assert_eq!(cli.inference_settings().sampling, SamplingConfig::default());
        assert_eq!(cli.load_config(), LoadConfig::default());

        let specs = cli.model_specs();
        assert_eq!(specs[0].key, "e2b");
        assert_eq!(specs[0].model_id, E2B_DEFAULT_MODEL);
        assert_eq!(specs[1].key, "e4b");
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "gemma3n-server",
            "--port",
            "9100",
            "--e2b-model",
            "gemma3n:e2b",
            "--load-in-4bit",
            "false",
            "--device-map",
            "cpu",
            "--top-k",
            "32",
        ]);

        assert_eq!(cli.port, 9100);
        assert_eq!(cli.model_specs()[0].model_id, "gemma3n:e2b");
        let load = cli.load_config();
        assert!(!load.load_in_4bit);
        assert_eq!(load.device_map, DeviceMap::Cpu);
        assert_eq!(cli.inference_settings().sampling.top_k, 32);
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let cli = Cli::parse_from(["gemma3n-server", "--max-concurrent-generations", "0"]);
        assert!(cli.validate().is_err());

        let cli = Cli::parse_from(["gemma3n-server", "--top-p", "1.5"]);
        assert!(cli.validate().is_err());
    }
}
