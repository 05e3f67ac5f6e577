//! GPT-2 decoder on candle.
//!
//! Weight names follow Hugging Face `GPT2LMHeadModel` checkpoints. The
//! projections are stored in Conv1D layout (`[in, out]`) and transposed on
//! load. The LM head is tied to the token embedding.

use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder};
use serde::Deserialize;

use crate::decoding::CausalLm;
use crate::error::ServeError;

/// Additive mask value for positions a query may not attend to.
const MASKED: f32 = -1.0e9;

#[derive(Debug, Clone, Deserialize)]
pub struct Gpt2Config {
    #[serde(default)]
    pub model_type: Option<String>,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    #[serde(default = "default_n_positions")]
    pub n_positions: usize,
    #[serde(default = "default_n_embd")]
    pub n_embd: usize,
    #[serde(default = "default_n_layer")]
    pub n_layer: usize,
    #[serde(default = "default_n_head")]
    pub n_head: usize,
    #[serde(default)]
    pub n_inner: Option<usize>,
    #[serde(default = "default_layer_norm_epsilon")]
    pub layer_norm_epsilon: f64,
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    #[serde(default)]
    pub pad_token_id: Option<u32>,
}

fn default_vocab_size() -> usize {
    50257
}

fn default_n_positions() -> usize {
    1024
}

fn default_n_embd() -> usize {
    768
}

fn default_n_layer() -> usize {
    12
}

fn default_n_head() -> usize {
    12
}

fn default_layer_norm_epsilon() -> f64 {
    1e-5
}

impl Gpt2Config {
    pub fn validate(&self) -> Result<(), ServeError> {
        if let Some(kind) = self.model_type.as_deref() {
            if kind != "gpt2" {
                return Err(ServeError::Model(candle_core::Error::Msg(format!(
                    "unsupported model_type '{kind}', expected 'gpt2'"
                ))));
            }
        }
        if self.n_head == 0 || self.n_embd % self.n_head != 0 {
            return Err(ServeError::Model(candle_core::Error::Msg(format!(
                "n_embd ({}) is not divisible by n_head ({})",
                self.n_embd, self.n_head
            ))));
        }
        Ok(())
    }

    fn inner_dim(&self) -> usize {
        self.n_inner.unwrap_or(4 * self.n_embd)
    }
}

/// Conv1D stores `[in, out]`; candle's `Linear` wants `[out, in]`.
fn conv1d(in_dim: usize, out_dim: usize, vb: VarBuilder) -> candle_core::Result<Linear> {
    let weight = vb.get((in_dim, out_dim), "weight")?.t()?.contiguous()?;
    let bias = vb.get(out_dim, "bias")?;
    Ok(Linear::new(weight, Some(bias)))
}

struct Attention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    head_dim: usize,
}

impl Attention {
    fn load(cfg: &Gpt2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let c = cfg.n_embd;
        Ok(Self {
            c_attn: conv1d(c, 3 * c, vb.pp("c_attn"))?,
            c_proj: conv1d(c, c, vb.pp("c_proj"))?,
            n_head: cfg.n_head,
            head_dim: c / cfg.n_head,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let (b, t, c) = xs.dims3()?;
        let qkv = self.c_attn.forward(xs)?;
        let split = |start: usize| -> candle_core::Result<Tensor> {
            qkv.narrow(D::Minus1, start, c)?
                .reshape((b, t, self.n_head, self.head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let q = split(0)?;
        let k = split(c)?;
        let v = split(2 * c)?;

        let att = (q.matmul(&k.t()?)? / (self.head_dim as f64).sqrt())?;
        let att = att.broadcast_add(mask)?;
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        let ys = att
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, c))?;
        self.c_proj.forward(&ys)
    }
}

struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn load(cfg: &Gpt2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            c_fc: conv1d(cfg.n_embd, cfg.inner_dim(), vb.pp("c_fc"))?,
            c_proj: conv1d(cfg.inner_dim(), cfg.n_embd, vb.pp("c_proj"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        // gelu_new: tanh approximation
        self.c_proj.forward(&self.c_fc.forward(xs)?.gelu()?)
    }
}

struct Block {
    ln_1: LayerNorm,
    attn: Attention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(cfg: &Gpt2Config, vb: VarBuilder) -> candle_core::Result<Self> {
        let eps = cfg.layer_norm_epsilon;
        Ok(Self {
            ln_1: candle_nn::layer_norm(cfg.n_embd, eps, vb.pp("ln_1"))?,
            attn: Attention::load(cfg, vb.pp("attn"))?,
            ln_2: candle_nn::layer_norm(cfg.n_embd, eps, vb.pp("ln_2"))?,
            mlp: Mlp::load(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, xs: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let xs = (xs + self.attn.forward(&self.ln_1.forward(xs)?, mask)?)?;
        &xs + self.mlp.forward(&self.ln_2.forward(&xs)?)?
    }
}

pub struct Gpt2 {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    n_positions: usize,
    pad_token_id: u32,
    device: Device,
    name: String,
}

impl std::fmt::Debug for Gpt2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gpt2")
            .field("name", &self.name)
            .field("layers", &self.blocks.len())
            .field("n_positions", &self.n_positions)
            .field("device", &self.device)
            .finish()
    }
}

impl Gpt2 {
    /// Builds the model from `vb`, which may point at the checkpoint root or
    /// at its `transformer.` prefix.
    pub fn load(
        cfg: &Gpt2Config,
        vb: VarBuilder,
        name: impl Into<String>,
        pad_token_id: u32,
    ) -> Result<Self, ServeError> {
        cfg.validate()?;
        let vb = if vb.contains_tensor("transformer.wte.weight") {
            vb.pp("transformer")
        } else {
            vb
        };
        let device = vb.device().clone();

        let wte = candle_nn::embedding(cfg.vocab_size, cfg.n_embd, vb.pp("wte"))?;
        let wpe = candle_nn::embedding(cfg.n_positions, cfg.n_embd, vb.pp("wpe"))?;
        let blocks = (0..cfg.n_layer)
            .map(|i| Block::load(cfg, vb.pp(format!("h.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let ln_f = candle_nn::layer_norm(cfg.n_embd, cfg.layer_norm_epsilon, vb.pp("ln_f"))?;

        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            n_positions: cfg.n_positions,
            pad_token_id,
            device,
            name: name.into(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Left-pads ragged rows so the last column is a real token in every row.
    fn pack(&self, rows: &[Vec<u32>], masks: &[Vec<u32>]) -> (Vec<u32>, Vec<u32>, usize) {
        let t = rows.iter().map(Vec::len).max().unwrap_or(0);
        let mut ids = Vec::with_capacity(rows.len() * t);
        let mut mask = Vec::with_capacity(rows.len() * t);
        for (row, row_mask) in rows.iter().zip(masks) {
            let pad = t - row.len();
            ids.extend(std::iter::repeat(self.pad_token_id).take(pad));
            ids.extend_from_slice(row);
            mask.extend(std::iter::repeat(0).take(pad));
            mask.extend(row_mask.iter().copied());
            // mask shorter than its row: missing entries count as real tokens
            mask.extend(std::iter::repeat(1).take(row.len().saturating_sub(row_mask.len())));
            mask.truncate(ids.len());
        }
        (ids, mask, t)
    }

    fn forward(&self, rows: &[Vec<u32>], masks: &[Vec<u32>]) -> candle_core::Result<Tensor> {
        let b = rows.len();
        let (ids, mask, t) = self.pack(rows, masks);

        // Positions count real tokens only, as padding-aware HF generation does.
        let mut positions = Vec::with_capacity(b * t);
        let mut additive = Vec::with_capacity(b * t * t);
        for r in 0..b {
            let row_mask = &mask[r * t..(r + 1) * t];
            let mut seen = 0u32;
            for &m in row_mask {
                if m == 1 {
                    positions.push(seen);
                    seen += 1;
                } else {
                    positions.push(1);
                }
            }
            for i in 0..t {
                for (j, &m) in row_mask.iter().enumerate() {
                    additive.push(if j <= i && m == 1 { 0.0 } else { MASKED });
                }
            }
        }

        let ids = Tensor::from_vec(ids, (b, t), &self.device)?;
        let positions = Tensor::from_vec(positions, (b, t), &self.device)?;
        let mask = Tensor::from_vec(additive, (b, 1, t, t), &self.device)?;

        let mut xs = (self.wte.forward(&ids)? + self.wpe.forward(&positions)?)?;
        for block in &self.blocks {
            xs = block.forward(&xs, &mask)?;
        }
        let last = self.ln_f.forward(&xs.i((.., t - 1, ..))?)?;
        last.matmul(&self.wte.embeddings().t()?)
    }
}

impl CausalLm for Gpt2 {
    fn next_token_logits(
        &self,
        rows: &[Vec<u32>],
        attention_mask: &[Vec<u32>],
    ) -> Result<Vec<Vec<f32>>, ServeError> {
        let longest = rows.iter().map(Vec::len).max().unwrap_or(0);
        if longest == 0 {
            return Err(ServeError::Model(candle_core::Error::Msg(
                "cannot run the model on an empty sequence".into(),
            )));
        }
        if longest > self.n_positions {
            return Err(ServeError::ContextOverflow {
                len: longest,
                max: self.n_positions,
            });
        }
        let logits = self.forward(rows, attention_mask)?;
        Ok(logits.to_dtype(DType::F32)?.to_vec2::<f32>()?)
    }

    fn max_positions(&self) -> usize {
        self.n_positions
    }

    fn name(&self) -> &str {
        &self.name
    }
}
