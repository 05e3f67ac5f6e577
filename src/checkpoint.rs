use anyhow::{bail, Context, Result};
use candle_core::{DType, Device};
use candle_nn::VarBuilder;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::{DeviceChoice, ModelArgs};
use crate::engine::Engine;
use crate::gpt2::{Gpt2, Gpt2Config};
use crate::tokenizer::TextCodec;

const TOKENIZER_FILE: &str = "tokenizer.json";
const SAFETENSORS_FILE: &str = "model.safetensors";
const SAFETENSORS_INDEX_FILE: &str = "model.safetensors.index.json";
const PYTORCH_FILE: &str = "pytorch_model.bin";

/// Where the tokenizer is read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenizerSource {
    /// A `tokenizer.json` file, or a directory containing one.
    Local(PathBuf),
    /// A Hugging Face Hub repo id, e.g. `gpt2`.
    Hub(String),
}

impl TokenizerSource {
    /// Existing paths are local; anything else is treated as a hub repo id.
    /// With no identifier the checkpoint directory is used.
    pub fn resolve(identifier: Option<&str>, checkpoint: &Path) -> Self {
        match identifier {
            None => TokenizerSource::Local(checkpoint.to_path_buf()),
            Some(id) if Path::new(id).exists() => TokenizerSource::Local(PathBuf::from(id)),
            Some(id) => TokenizerSource::Hub(id.to_string()),
        }
    }
}

/// Weight files present in a checkpoint directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightFiles {
    Safetensors(Vec<PathBuf>),
    Pytorch(PathBuf),
}

impl WeightFiles {
    /// Prefers safetensors (single file, then sharded index) over
    /// `pytorch_model.bin`.
    pub fn discover(dir: &Path) -> Result<Self> {
        let single = dir.join(SAFETENSORS_FILE);
        if single.exists() {
            return Ok(WeightFiles::Safetensors(vec![single]));
        }

        let index = dir.join(SAFETENSORS_INDEX_FILE);
        if index.exists() {
            let raw = fs::read_to_string(&index)
                .with_context(|| format!("Failed to read {}", index.display()))?;
            let json: serde_json::Value = serde_json::from_str(&raw)
                .with_context(|| format!("Failed to parse {}", index.display()))?;
            let Some(map) = json.get("weight_map").and_then(|m| m.as_object()) else {
                bail!("{} has no weight_map", index.display());
            };
            let shards: BTreeSet<&str> = map.values().filter_map(|v| v.as_str()).collect();
            return Ok(WeightFiles::Safetensors(
                shards.into_iter().map(|s| dir.join(s)).collect(),
            ));
        }

        let pth = dir.join(PYTORCH_FILE);
        if pth.exists() {
            return Ok(WeightFiles::Pytorch(pth));
        }

        bail!(
            "No weights in {}: expected {}, {} or {}",
            dir.display(),
            SAFETENSORS_FILE,
            SAFETENSORS_INDEX_FILE,
            PYTORCH_FILE
        )
    }

    fn var_builder(&self, device: &Device) -> Result<VarBuilder<'static>> {
        match self {
            // SAFETY: the checkpoint is treated as read-only for the process
            // lifetime, so the mapping is not mutated underneath us.
            WeightFiles::Safetensors(files) => unsafe {
                VarBuilder::from_mmaped_safetensors(files, DType::F32, device)
                    .context("Failed to map safetensors weights")
            },
            WeightFiles::Pytorch(file) => VarBuilder::from_pth(file, DType::F32, device)
                .context("Failed to read pytorch weights"),
        }
    }
}

pub fn select_device(choice: DeviceChoice) -> Result<Device> {
    let device = match choice {
        DeviceChoice::Cpu => Device::Cpu,
        DeviceChoice::Cuda => Device::new_cuda(0).context("CUDA device unavailable")?,
        DeviceChoice::Metal => Device::new_metal(0).context("Metal device unavailable")?,
        DeviceChoice::Auto => {
            if candle_core::utils::cuda_is_available() {
                Device::new_cuda(0).context("CUDA device unavailable")?
            } else if candle_core::utils::metal_is_available() {
                Device::new_metal(0).context("Metal device unavailable")?
            } else {
                Device::Cpu
            }
        }
    };
    tracing::info!(device = device_label(&device), "Selected compute device");
    Ok(device)
}

pub fn device_label(device: &Device) -> &'static str {
    if device.is_cuda() {
        "cuda"
    } else if device.is_metal() {
        "metal"
    } else {
        "cpu"
    }
}

pub fn read_config(checkpoint: &Path) -> Result<Gpt2Config> {
    let path = checkpoint.join("config.json");
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read model config {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

pub async fn load_tokenizer(
    source: &TokenizerSource,
    hf_token: Option<String>,
    eos_hint: Option<u32>,
) -> Result<TextCodec> {
    let file = match source {
        TokenizerSource::Local(path) => {
            let file = if path.is_dir() {
                path.join(TOKENIZER_FILE)
            } else {
                path.clone()
            };
            if !file.exists() {
                bail!(
                    "No tokenizer at {}; pass --tokenizer gpt2 to use the base GPT-2 vocabulary",
                    file.display()
                );
            }
            file
        }
        TokenizerSource::Hub(repo_id) => {
            tracing::info!(repo_id = %repo_id, "Fetching tokenizer from Hugging Face Hub");
            let api = hf_hub::api::tokio::ApiBuilder::new()
                .with_progress(false)
                .with_token(hf_token)
                .build()
                .context("Failed to build Hugging Face Hub client")?;
            api.model(repo_id.clone())
                .get(TOKENIZER_FILE)
                .await
                .with_context(|| format!("Failed to fetch {TOKENIZER_FILE} from {repo_id}"))?
        }
    };

    let codec = TextCodec::from_file(&file, eos_hint)
        .with_context(|| format!("Failed to load tokenizer {}", file.display()))?;
    tracing::info!(
        tokenizer = %file.display(),
        vocab_size = codec.vocab_size(),
        "Tokenizer loaded"
    );
    Ok(codec)
}

pub fn load_model(checkpoint: &Path, cfg: &Gpt2Config, device: &Device, pad_token_id: u32) -> Result<Gpt2> {
    let weights = WeightFiles::discover(checkpoint)?;
    tracing::info!(weights = ?weights, "Loading model weights");
    let vb = weights.var_builder(device)?;
    let name = checkpoint
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| checkpoint.display().to_string());
    Gpt2::load(cfg, vb, name, pad_token_id).context("Failed to build GPT-2 from checkpoint")
}

/// Startup phase: everything the listener needs, loaded before it binds.
pub async fn load_engine(args: &ModelArgs) -> Result<Engine> {
    let checkpoint = args.checkpoint.clone();
    if !checkpoint.is_dir() {
        bail!("Checkpoint directory {} does not exist", checkpoint.display());
    }

    let cfg = read_config(&checkpoint)?;
    let source = TokenizerSource::resolve(args.tokenizer.as_deref(), &checkpoint);
    if args.tokenizer.is_some() {
        tracing::warn!(
            source = ?source,
            "Tokenizer does not come from the checkpoint directory; make sure it matches the training vocabulary"
        );
    }
    let codec = load_tokenizer(&source, args.hf_token.clone(), cfg.eos_token_id).await?;
    if codec.vocab_size() > cfg.vocab_size {
        bail!(
            "Tokenizer vocabulary ({}) is larger than the model's ({})",
            codec.vocab_size(),
            cfg.vocab_size
        );
    }

    let device = select_device(args.device)?;
    let label = device_label(&device);
    let pad_token_id = cfg.pad_token_id.or(codec.pad_token_id()).unwrap_or(0);

    let model = tokio::task::spawn_blocking(move || load_model(&checkpoint, &cfg, &device, pad_token_id))
        .await
        .context("Model loading task panicked")??;
    tracing::info!(model = ?model, "Model loaded");

    Ok(Engine::new(codec, Box::new(model))
        .with_seed(args.seed)
        .with_device_label(label))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteProfile;
    use crate::decoding::DecodingPolicy;
    use crate::engine::EchoStrip;
    use candle_core::Tensor;
    use std::collections::HashMap;

    #[test]
    fn tokenizer_defaults_to_checkpoint() {
        let source = TokenizerSource::resolve(None, Path::new("ckpt"));
        assert_eq!(source, TokenizerSource::Local(PathBuf::from("ckpt")));
    }

    #[test]
    fn unknown_paths_are_hub_ids() {
        let source = TokenizerSource::resolve(Some("gpt2"), Path::new("ckpt"));
        assert_eq!(source, TokenizerSource::Hub("gpt2".into()));
    }

    #[test]
    fn existing_paths_are_local() {
        let dir = tempfile::tempdir().unwrap();
        let id = dir.path().to_string_lossy().into_owned();
        let source = TokenizerSource::resolve(Some(&id), Path::new("ckpt"));
        assert_eq!(source, TokenizerSource::Local(dir.path().to_path_buf()));
    }

    #[test]
    fn prefers_safetensors_over_pytorch() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(PYTORCH_FILE), b"").unwrap();
        fs::write(dir.path().join(SAFETENSORS_FILE), b"").unwrap();
        assert_eq!(
            WeightFiles::discover(dir.path()).unwrap(),
            WeightFiles::Safetensors(vec![dir.path().join(SAFETENSORS_FILE)])
        );
    }

    #[test]
    fn reads_sharded_index() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(SAFETENSORS_INDEX_FILE),
            r#"{"weight_map": {"a": "model-00002.safetensors", "b": "model-00001.safetensors", "c": "model-00001.safetensors"}}"#,
        )
        .unwrap();
        assert_eq!(
            WeightFiles::discover(dir.path()).unwrap(),
            WeightFiles::Safetensors(vec![
                dir.path().join("model-00001.safetensors"),
                dir.path().join("model-00002.safetensors"),
            ])
        );
    }

    #[test]
    fn missing_weights_fail() {
        let dir = tempfile::tempdir().unwrap();
        assert!(WeightFiles::discover(dir.path()).is_err());
    }

    #[test]
    fn missing_config_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_config(dir.path()).is_err());
    }

    const CONFIG_JSON: &str = r#"{"model_type": "gpt2", "vocab_size": 11, "n_positions": 16,
        "n_embd": 8, "n_layer": 2, "n_head": 2, "eos_token_id": 0}"#;

    const TOKENIZER_JSON: &str = r#"{
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [
            {"id": 0, "content": "<|endoftext|>", "single_word": false, "lstrip": false,
             "rstrip": false, "normalized": false, "special": true}
        ],
        "normalizer": null,
        "pre_tokenizer": {"type": "WhitespaceSplit"},
        "post_processor": null,
        "decoder": null,
        "model": {
            "type": "WordLevel",
            "vocab": {
                "<|endoftext|>": 0, "<unk>": 1, "User:": 2, "Bot:": 3, "one": 4, "two": 5,
                "three": 6, "four": 7, "five": 8, "six": 9, "seven": 10
            },
            "unk_token": "<unk>"
        }
    }"#;

    /// Writes config, tokenizer and `transformer.`-prefixed safetensors, the
    /// layout `GPT2LMHeadModel.save_pretrained` produces.
    fn write_checkpoint(dir: &Path, config_json: &str) {
        fs::write(dir.join("config.json"), config_json).unwrap();
        fs::write(dir.join(TOKENIZER_FILE), TOKENIZER_JSON).unwrap();

        let cfg: Gpt2Config = serde_json::from_str(CONFIG_JSON).unwrap();
        let weights: HashMap<String, Tensor> = crate::gpt2::tests::tiny_weights(&cfg)
            .into_iter()
            .map(|(name, tensor)| (format!("transformer.{name}"), tensor))
            .collect();
        candle_core::safetensors::save(&weights, dir.join(SAFETENSORS_FILE)).unwrap();
    }

    fn model_args(checkpoint: &Path) -> ModelArgs {
        ModelArgs {
            checkpoint: checkpoint.to_path_buf(),
            tokenizer: None,
            device: DeviceChoice::Cpu,
            seed: Some(3),
            hf_token: None,
        }
    }

    #[tokio::test]
    async fn loads_a_prefixed_checkpoint_and_completes() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), CONFIG_JSON);

        let engine = load_engine(&model_args(dir.path())).await.unwrap();
        assert_eq!(engine.device_label(), "cpu");
        assert_eq!(engine.codec().eos_token_id(), Some(0));

        let profile = RouteProfile {
            policy: DecodingPolicy::greedy(8),
            echo: EchoStrip::None,
            ..RouteProfile::chat()
        };
        let completion = engine.complete(&profile, "one two").unwrap();
        assert_eq!(completion.prompt_tokens, 4);
        assert!(completion.prompt_tokens + completion.generated_tokens <= 8);
        assert!(completion.text.starts_with("User: one two Bot:"), "{}", completion.text);
    }

    #[tokio::test]
    async fn tokenizer_larger_than_model_vocabulary_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), &CONFIG_JSON.replace("\"vocab_size\": 11", "\"vocab_size\": 8"));

        let err = load_engine(&model_args(dir.path())).await.unwrap_err();
        assert!(err.to_string().contains("larger than the model"), "{err:#}");
    }

    #[tokio::test]
    async fn missing_tokenizer_suggests_the_base_vocabulary() {
        let dir = tempfile::tempdir().unwrap();
        write_checkpoint(dir.path(), CONFIG_JSON);
        fs::remove_file(dir.path().join(TOKENIZER_FILE)).unwrap();

        let err = load_engine(&model_args(dir.path())).await.unwrap_err();
        assert!(format!("{err:#}").contains("--tokenizer gpt2"), "{err:#}");
    }

    #[tokio::test]
    async fn missing_checkpoint_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let args = model_args(&dir.path().join("checkpoint-3499"));
        assert!(load_engine(&args).await.is_err());
    }
}
