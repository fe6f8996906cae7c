//! Session configuration surface.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::engine::{ContextParams, LoraAdapter, ModelParams};
use crate::error::SessionError;
use crate::prompt::{PromptFormat, PromptTemplate};
use crate::sampling::SamplingParams;
use crate::state::SessionStateStore;

pub const DEFAULT_CONTEXT_LENGTH: usize = 2048;
pub const DEFAULT_BATCH_SIZE: usize = 512;

/// GPU layer count used when Metal is requested on Apple silicon.
pub const METAL_GPU_LAYERS: u32 = 100;

fn default_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub model_path: PathBuf,
    pub context_length: usize,
    pub n_threads: usize,
    pub n_batch: usize,
    pub use_mmap: bool,
    pub use_mlock: bool,
    pub use_metal: bool,
    /// Explicit layer count; derived from `use_metal` when unset.
    pub n_gpu_layers: Option<u32>,
    pub flash_attention: bool,
    /// Decode `[bos, eos]` once after context creation.
    pub warmup: bool,

    pub grammar_path: Option<PathBuf>,
    /// Fail the load on an unusable grammar instead of continuing without it.
    pub strict_grammar: bool,
    /// Non-empty forces mmap off.
    pub lora_adapters: Vec<LoraAdapter>,

    pub prompt_format: PromptFormat,
    pub custom_prompt_format: Option<String>,
    pub add_bos_token: bool,
    pub add_eos_token: bool,
    pub parse_special_tokens: bool,

    /// Strings whose single token is never shown to the callback.
    pub skip_tokens: Vec<String>,
    pub skip_token_ids: Vec<i32>,

    pub save_load_state: bool,
    pub state_path: Option<PathBuf>,

    pub max_output_tokens: Option<usize>,
    pub max_output_bytes: Option<usize>,

    /// Protected prefix for rotation; defaults to the penalty window.
    pub context_keep: Option<usize>,
    pub clear_penalty_history_on_rotate: bool,

    pub sampling: SamplingParams,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::new(),
            context_length: DEFAULT_CONTEXT_LENGTH,
            n_threads: default_threads(),
            n_batch: DEFAULT_BATCH_SIZE,
            use_mmap: true,
            use_mlock: false,
            use_metal: false,
            n_gpu_layers: None,
            flash_attention: false,
            warmup: false,
            grammar_path: None,
            strict_grammar: false,
            lora_adapters: Vec::new(),
            prompt_format: PromptFormat::None,
            custom_prompt_format: None,
            add_bos_token: true,
            add_eos_token: false,
            parse_special_tokens: true,
            skip_tokens: Vec::new(),
            skip_token_ids: Vec::new(),
            save_load_state: false,
            state_path: None,
            max_output_tokens: None,
            max_output_bytes: None,
            context_keep: None,
            clear_penalty_history_on_rotate: false,
            sampling: SamplingParams::default(),
        }
    }
}

impl SessionConfig {
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            ..Default::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, SessionError> {
        serde_yaml_ng::from_str(yaml).map_err(|e| SessionError::Config(e.to_string()))
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self, SessionError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| SessionError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.context_length == 0 {
            return Err("context_length must be greater than 0".to_string());
        }
        if self.n_batch == 0 {
            return Err("n_batch must be greater than 0".to_string());
        }
        if self.n_batch > self.context_length {
            return Err(format!(
                "n_batch ({}) cannot exceed context_length ({})",
                self.n_batch, self.context_length
            ));
        }
        if self.n_threads == 0 {
            return Err("n_threads must be greater than 0".to_string());
        }

        PromptTemplate::new(self.prompt_format, self.custom_prompt_format.as_deref())?;

        if self.save_load_state && self.state_path.is_none() {
            return Err("save_load_state requires state_path".to_string());
        }
        if let Some(max_tokens) = self.max_output_tokens {
            if max_tokens == 0 {
                return Err("max_output_tokens must be greater than 0".to_string());
            }
        }
        for adapter in &self.lora_adapters {
            if !adapter.scale.is_finite() {
                return Err(format!(
                    "lora adapter {} has a non-finite scale",
                    adapter.path.display()
                ));
            }
        }

        self.sampling.validate()
    }

    /// The mmap flag passed to the loader; LoRA adapters force it off.
    pub fn effective_use_mmap(&self) -> bool {
        self.use_mmap && self.lora_adapters.is_empty()
    }

    pub fn effective_gpu_layers(&self) -> u32 {
        match self.n_gpu_layers {
            Some(layers) => layers,
            None if self.use_metal && !cfg!(target_arch = "x86_64") => METAL_GPU_LAYERS,
            None => 0,
        }
    }

    /// Rotation prefix length `P`, capped at half the context.
    pub fn protected_prefix(&self) -> usize {
        self.context_keep
            .unwrap_or_else(|| self.sampling.resolved_penalty_last_n(self.context_length))
            .min(self.context_length / 2)
    }

    pub fn prompt_template(&self) -> Result<PromptTemplate, SessionError> {
        PromptTemplate::new(self.prompt_format, self.custom_prompt_format.as_deref())
            .map_err(SessionError::Config)
    }

    /// The state store, when state persistence is enabled.
    pub fn state_store(&self) -> Option<SessionStateStore> {
        match (&self.state_path, self.save_load_state) {
            (Some(path), true) => Some(SessionStateStore::new(path.clone())),
            _ => None,
        }
    }

    pub fn model_params(&self) -> ModelParams {
        ModelParams {
            n_gpu_layers: self.effective_gpu_layers(),
            use_mmap: self.effective_use_mmap(),
            use_mlock: self.use_mlock,
            lora_adapters: self.lora_adapters.clone(),
        }
    }

    pub fn context_params(&self) -> ContextParams {
        ContextParams {
            context_length: self.context_length,
            n_batch: self.n_batch,
            n_threads: self.n_threads,
            flash_attention: self.flash_attention,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = SessionConfig::new("/models/tiny.gguf");
        assert!(config.validate().is_ok());
        assert_eq!(config.context_length, 2048);
        assert!(config.add_bos_token);
        assert!(!config.add_eos_token);
        assert!(config.state_store().is_none());
    }

    #[test]
    fn test_lora_forces_mmap_off() {
        let mut config = SessionConfig::default();
        assert!(config.effective_use_mmap());
        config.lora_adapters.push(LoraAdapter {
            path: PathBuf::from("adapter.bin"),
            scale: 1.0,
        });
        assert!(!config.effective_use_mmap());
        assert!(!config.model_params().use_mmap);
    }

    #[test]
    fn test_gpu_layers() {
        let mut config = SessionConfig::default();
        assert_eq!(config.effective_gpu_layers(), 0);
        config.use_metal = true;
        let expected = if cfg!(target_arch = "x86_64") { 0 } else { 100 };
        assert_eq!(config.effective_gpu_layers(), expected);
        config.n_gpu_layers = Some(12);
        assert_eq!(config.effective_gpu_layers(), 12);
    }

    #[test]
    fn test_validation_failures() {
        let cases: Vec<(SessionConfig, &str)> = vec![
            (
                SessionConfig {
                    context_length: 0,
                    ..Default::default()
                },
                "context_length",
            ),
            (
                SessionConfig {
                    context_length: 256,
                    n_batch: 512,
                    ..Default::default()
                },
                "n_batch",
            ),
            (
                SessionConfig {
                    prompt_format: PromptFormat::Custom,
                    custom_prompt_format: Some("no placeholder".to_string()),
                    ..Default::default()
                },
                "{prompt}",
            ),
            (
                SessionConfig {
                    save_load_state: true,
                    ..Default::default()
                },
                "state_path",
            ),
            (
                SessionConfig {
                    sampling: SamplingParams {
                        min_p: -0.1,
                        ..Default::default()
                    },
                    ..Default::default()
                },
                "min_p",
            ),
        ];
        for (config, needle) in cases {
            let err = config.validate().unwrap_err();
            assert!(err.contains(needle), "{} should mention {}", err, needle);
        }
    }

    #[test]
    fn test_protected_prefix_resolution() {
        let mut config = SessionConfig {
            context_length: 100,
            ..Default::default()
        };
        assert_eq!(config.protected_prefix(), 50);
        config.sampling.penalty_last_n = 16;
        assert_eq!(config.protected_prefix(), 16);
        config.context_keep = Some(4);
        assert_eq!(config.protected_prefix(), 4);
        config.sampling.penalty_last_n = -1;
        config.context_keep = None;
        assert_eq!(config.protected_prefix(), 50);
    }

    #[test]
    fn test_yaml_config() {
        let yaml = r#"
model_path: /models/dolphin.gguf
context_length: 1024
prompt_format: custom
custom_prompt_format: "USER: {prompt}\nASSISTANT:"
lora_adapters:
  - path: /models/style.lora
    scale: 0.5
skip_tokens: ["<|im_end|>"]
save_load_state: true
state_path: /tmp/chat.state
sampling:
  mirostat: v2
  mirostat_tau: 5.0
  mirostat_eta: 0.1
"#;
        let config = SessionConfig::from_yaml_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.context_length, 1024);
        assert_eq!(config.n_batch, DEFAULT_BATCH_SIZE);
        assert_eq!(config.lora_adapters[0].scale, 0.5);
        assert!(config.state_store().is_some());
        assert_eq!(
            config.sampling.mirostat,
            crate::sampling::MirostatMode::V2
        );

        assert!(SessionConfig::from_yaml_str("context_length: [").is_err());
    }

    #[test]
    fn test_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.yaml");
        std::fs::write(&path, "context_length: 64\nn_batch: 16\n").unwrap();
        let config = SessionConfig::from_yaml_file(&path).unwrap();
        assert_eq!(config.n_batch, 16);
        assert!(SessionConfig::from_yaml_file(&dir.path().join("missing.yaml")).is_err());
    }
}
