use std::path::Path;

use candle_core::{DType, Device, IndexOp, Result, Tensor, D};
use candle_nn::{
    embedding, linear, linear_no_bias, ops, rms_norm, Embedding, Linear, Module, RmsNorm,
    VarBuilder, VarMap,
};
use serde::{Deserialize, Serialize};

use crate::sampler::Predictor;

const SOFTPLUS_THRESHOLD: f64 = 20.0;

fn heinsen_associative_scan_log(log_coeffs: &Tensor, log_values: &Tensor) -> Result<Tensor> {
    let a_star = log_coeffs.cumsum(1)?;
    // logcumsumexp, with clamping for numerical stability
    let log_h0_plus_b_star = log_values
        .sub(&a_star)?
        .exp()?
        .clamp(1e-6, 1e6)?
        .cumsum(1)?
        .log()?
        .clamp(-1e6, 1e6)?;
    let log_h = a_star.add(&log_h0_plus_b_star)?;
    log_h.exp()
}

/// log(1 + exp(x)), linear past the threshold.
fn softplus(x: &Tensor) -> Result<Tensor> {
    let clipped = x.clamp(-SOFTPLUS_THRESHOLD, SOFTPLUS_THRESHOLD)?;
    let soft = (clipped.exp()? + 1.0)?.log()?;
    x.gt(SOFTPLUS_THRESHOLD)?.where_cond(x, &soft)
}

fn log_g(x: &Tensor) -> Result<Tensor> {
    let positive = (x.relu()? + 0.5)?.log()?;
    let negative = softplus(&x.neg()?)?.neg()?;
    x.ge(0f64)?.where_cond(&positive, &negative)
}

/// minGRU evaluated in log space over the whole sequence at once.
struct MinGRU {
    to_hidden_and_gate: Linear,
    to_out: Option<Linear>,
}

impl MinGRU {
    fn new(dim: usize, exp_factor: f32, vb: VarBuilder) -> Result<Self> {
        let dim_inner = (dim as f32 * exp_factor).round() as usize;
        let to_hidden_and_gate = linear(dim, dim_inner * 2, vb.pp("hidden_n_gate"))?;
        let to_out = if dim_inner != dim {
            Some(linear_no_bias(dim_inner, dim, vb.pp("to_out"))?)
        } else {
            None
        };
        Ok(Self {
            to_hidden_and_gate,
            to_out,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let hid_n_gate = self.to_hidden_and_gate.forward(x)?.chunk(2, D::Minus1)?;
        let (hidden, gate) = (&hid_n_gate[0], &hid_n_gate[1]);

        // log(1 - z) and log(z) for z = sigmoid(gate)
        let log_coeffs = softplus(gate)?.neg()?;
        let log_z = softplus(&gate.neg()?)?.neg()?;
        let log_values = log_z.add(&log_g(hidden)?)?;

        let out = heinsen_associative_scan_log(&log_coeffs, &log_values)?;
        match &self.to_out {
            Some(proj) => proj.forward(&out),
            None => Ok(out),
        }
    }
}

struct FeedForward {
    linear1: Linear,
    linear2: Linear,
}

impl FeedForward {
    fn new(dim: usize, mult: usize, vb: VarBuilder) -> Result<Self> {
        let dim_inner = dim * mult;
        let linear1 = linear(dim, dim_inner, vb.pp("linear1"))?;
        let linear2 = linear(dim_inner, dim, vb.pp("linear2"))?;
        Ok(Self { linear1, linear2 })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.linear1.forward(x)?.gelu()?;
        self.linear2.forward(&out)
    }
}

struct MinGRUBlock {
    norm1: RmsNorm,
    min_gru: MinGRU,
    norm2: RmsNorm,
    ffn: FeedForward,
}

impl MinGRUBlock {
    fn new(config: &LanguageModelConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.dim;
        Ok(Self {
            norm1: rms_norm(dim, 1e-3, vb.pp("norm1"))?,
            min_gru: MinGRU::new(dim, config.exp_factor, vb.pp("mingru"))?,
            norm2: rms_norm(dim, 1e-3, vb.pp("norm2"))?,
            ffn: FeedForward::new(dim, config.ff_mult, vb.pp("ffn"))?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let out = self.min_gru.forward(&self.norm1.forward(x)?)?.add(x)?;
        self.ffn.forward(&self.norm2.forward(&out)?)?.add(&out)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LanguageModelConfig {
    pub vocab_size: usize,
    pub dim: usize,
    pub depth: usize,
    pub ff_mult: usize,
    pub exp_factor: f32,
}

impl Default for LanguageModelConfig {
    fn default() -> Self {
        Self {
            vocab_size: 256,
            dim: 256,
            depth: 2,
            ff_mult: 4,
            exp_factor: 1.5,
        }
    }
}

impl LanguageModelConfig {
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}

/// Next-token predictor: embedding, a stack of residual minGRU blocks and a
/// projection back onto the vocabulary.
pub struct LanguageModel {
    token_emb: Embedding,
    blocks: Vec<MinGRUBlock>,
    norm: RmsNorm,
    to_logits: Linear,
}

impl LanguageModel {
    pub fn new(config: &LanguageModelConfig, vb: VarBuilder) -> Result<Self> {
        let token_emb = embedding(config.vocab_size, config.dim, vb.pp("token_emb"))?;
        let blocks = (0..config.depth)
            .map(|i| MinGRUBlock::new(config, vb.pp(format!("block{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = rms_norm(config.dim, 1e-6, vb.pp("norm"))?;
        let to_logits = linear_no_bias(config.dim, config.vocab_size, vb.pp("to_logits"))?;
        Ok(Self {
            token_emb,
            blocks,
            norm,
            to_logits,
        })
    }

    /// Rebuild a model from its config and safetensors weights.
    pub fn load(
        config: &LanguageModelConfig,
        weights: impl AsRef<Path>,
        device: &Device,
    ) -> Result<Self> {
        let mut varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let model = Self::new(config, vb)?;
        varmap.load(weights)?;
        Ok(model)
    }

    /// `[b, L]` ids to `[b, L, vocab]` logits.
    pub fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let mut out = self.token_emb.forward(input)?;
        for block in self.blocks.iter() {
            out = block.forward(&out)?;
        }
        self.to_logits.forward(&self.norm.forward(&out)?)
    }

    /// Mean cross entropy over the target positions that are not `pad`.
    /// A `[b, L]` target scores every position; a `[b]` target scores only
    /// the last non-pad input position of each row.
    pub fn loss(&self, input: &Tensor, target: &Tensor, pad: u32) -> Result<Tensor> {
        let logits = self.forward(input)?;
        let vocab = logits.dim(D::Minus1)?;
        let (logits, target) = if target.rank() == 1 {
            (last_logits(&logits, input, pad)?, target.clone())
        } else {
            (logits.reshape(((), vocab))?, target.flatten_all()?)
        };
        let log_probs = ops::log_softmax(&logits, D::Minus1)?;
        let picked = log_probs
            .gather(&target.unsqueeze(1)?.contiguous()?, 1)?
            .squeeze(1)?;
        let mask = target.ne(pad)?.to_dtype(DType::F32)?;
        let count = mask.sum_all()?.maximum(1f64)?;
        picked.mul(&mask)?.sum_all()?.neg()?.div(&count)
    }
}

/// `[b, vocab]` logits at the last non-pad position of each right-padded row.
fn last_logits(logits: &Tensor, input: &Tensor, pad: u32) -> Result<Tensor> {
    let (b, _, vocab) = logits.dims3()?;
    let last = input
        .ne(pad)?
        .to_dtype(DType::U32)?
        .sum(1)?
        .to_dtype(DType::F32)?
        .affine(1.0, -1.0)?
        .maximum(0f64)?
        .to_dtype(DType::U32)?;
    let index = last.reshape((b, 1, 1))?.broadcast_as((b, 1, vocab))?.contiguous()?;
    logits.gather(&index, 1)?.squeeze(1)
}

/// Softmax over the logits of the last window position.
pub struct ModelPredictor<'a> {
    model: &'a LanguageModel,
    device: Device,
    temperature: f64,
}

impl<'a> ModelPredictor<'a> {
    pub fn new(model: &'a LanguageModel, device: Device, temperature: f64) -> Self {
        Self {
            model,
            device,
            temperature: temperature.max(1e-10),
        }
    }
}

impl Predictor for ModelPredictor<'_> {
    fn predict(&self, window: &[u32]) -> Result<Vec<f32>> {
        let input = Tensor::new(window, &self.device)?.unsqueeze(0)?;
        let logits = self.model.forward(&input)?;
        let last = logits.i((0, window.len() - 1))?;
        let probs = ops::softmax(&(last / self.temperature)?, D::Minus1)?;
        probs.to_dtype(DType::F32)?.to_vec1::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::check_distribution;

    fn tiny() -> LanguageModelConfig {
        LanguageModelConfig {
            vocab_size: 11,
            dim: 8,
            depth: 2,
            ff_mult: 2,
            exp_factor: 1.5,
        }
    }

    fn build(varmap: &VarMap) -> LanguageModel {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        LanguageModel::new(&tiny(), vb).unwrap()
    }

    #[test]
    fn forward_shape() {
        let varmap = VarMap::new();
        let model = build(&varmap);
        let input = Tensor::new(&[[1u32, 2, 3, 4], [5, 6, 0, 0]], &Device::Cpu).unwrap();
        let logits = model.forward(&input).unwrap();
        assert_eq!(logits.dims(), &[2, 4, 11]);
    }

    #[test]
    fn loss_is_finite_and_ignores_pad() {
        let varmap = VarMap::new();
        let model = build(&varmap);
        let input = Tensor::new(&[[1u32, 2, 3, 4]], &Device::Cpu).unwrap();
        let target = Tensor::new(&[[2u32, 3, 4, 5]], &Device::Cpu).unwrap();
        let loss = model.loss(&input, &target, 0).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite() && value > 0.0);

        let all_pad = Tensor::new(&[[0u32, 0, 0, 0]], &Device::Cpu).unwrap();
        let loss = model.loss(&input, &all_pad, 0).unwrap();
        assert_eq!(loss.to_scalar::<f32>().unwrap(), 0.0);
    }

    #[test]
    fn next_token_batches_train() {
        use crate::windower::{Shift, WindowConfig, Windower};

        let varmap = VarMap::new();
        let model = build(&varmap);
        let config = WindowConfig {
            batch_size: 4,
            sequence_length: 4,
            shift: Shift::NextToken,
            ..WindowConfig::default()
        };
        // second window is a short tail: input [5, 6, 0, 0], target 7
        let windower = Windower::new(vec![vec![1u32, 2, 3, 4, 5, 6, 7]], 0, config).unwrap();
        let batch = windower.batches().next().unwrap();
        let (input, target) = batch.to_tensors(&Device::Cpu).unwrap();
        assert_eq!(target.dims(), &[2]);
        let loss = model.loss(&input, &target, 0).unwrap();
        let value = loss.to_scalar::<f32>().unwrap();
        assert!(value.is_finite() && value > 0.0);

        // the tail row is scored at its last real token, not at the padding
        let logits = model.forward(&input).unwrap();
        let picked = last_logits(&logits, &input, 0).unwrap();
        let expected: Vec<f32> = logits.i((1, 1)).unwrap().to_vec1().unwrap();
        let got: Vec<f32> = picked.i(1).unwrap().to_vec1().unwrap();
        assert_eq!(got, expected);
    }

    #[test]
    fn predictor_returns_distribution() {
        let varmap = VarMap::new();
        let model = build(&varmap);
        let predictor = ModelPredictor::new(&model, Device::Cpu, 1.0);
        let probs = predictor.predict(&[0, 0, 3, 4]).unwrap();
        assert_eq!(probs.len(), 11);
        assert!(check_distribution(&probs).is_ok());
    }

    #[test]
    fn weights_round_trip() {
        let varmap = VarMap::new();
        let model = build(&varmap);
        let path = std::env::temp_dir().join("wikilm_model_roundtrip.safetensors");
        varmap.save(&path).unwrap();
        let loaded = LanguageModel::load(&tiny(), &path, &Device::Cpu);
        let _ = std::fs::remove_file(&path);
        let loaded = loaded.unwrap();

        let input = Tensor::new(&[[1u32, 2, 3]], &Device::Cpu).unwrap();
        let a: Vec<f32> = model.forward(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        let b: Vec<f32> = loaded.forward(&input).unwrap().flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn config_round_trip() {
        let path = std::env::temp_dir().join("wikilm_model_config.json");
        tiny().save(&path).unwrap();
        let loaded = LanguageModelConfig::load(&path);
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded.unwrap(), tiny());
    }
}
