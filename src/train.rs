use std::path::PathBuf;

use anyhow::{Context, Result};
use candle_core::{DType, Device};
use candle_nn::{AdamW, Optimizer, VarBuilder, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::data::{Split, TextSplits};
use crate::metrics::{EpochMetrics, MetricsLogger};
use crate::model::{LanguageModel, LanguageModelConfig, ModelPredictor};
use crate::preprocess::{Preprocessor, VocabularyConfig};
use crate::sampler::Sampler;
use crate::storage::Storage;
use crate::windower::{make_feed, WindowConfig, Windower};

const LOG_EVERY: usize = 100;

pub struct TrainConfig {
    pub batch_size: usize,
    pub sequence_length: usize,
    pub epochs: usize,
    pub learning_rate: f64,
    /// Let windows run across document boundaries.
    pub sequential: bool,
    /// Log a generated sample every this many epochs, 0 disables it.
    pub generate_every: usize,
    pub prompt: Option<String>,
    pub generate: GenerateConfig,
    pub seed: u64,
    pub model: LanguageModelConfig,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            sequence_length: 8,
            epochs: 50,
            learning_rate: 1e-3,
            sequential: false,
            generate_every: 1,
            prompt: None,
            generate: GenerateConfig::default(),
            seed: 0,
            model: LanguageModelConfig::default(),
        }
    }
}

impl TrainConfig {
    pub fn window_config(&self) -> WindowConfig {
        WindowConfig {
            batch_size: self.batch_size,
            sequence_length: self.sequence_length,
            sequential: self.sequential,
            ..WindowConfig::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct GenerateConfig {
    pub sequence_length: usize,
    pub iterations: usize,
    pub temperature: f64,
}

impl Default for GenerateConfig {
    fn default() -> Self {
        Self {
            sequence_length: 10,
            iterations: 20,
            temperature: 1.0,
        }
    }
}

/// Batch streams for one training run.
pub struct SplitFeeds {
    pub train: Windower,
    pub validation: Windower,
}

#[derive(Debug)]
pub struct TrainSummary {
    pub epochs: usize,
    pub best_val_loss: f64,
    pub model_path: PathBuf,
}

/// Drives vocabulary building, training and generation over a dataset.
pub struct Trainer<S> {
    storage: Storage,
    dataset: S,
    preprocessor_name: String,
    log_dir: String,
}

impl<S: TextSplits> Trainer<S> {
    pub fn new(
        storage: Storage,
        dataset: S,
        preprocessor_name: impl Into<String>,
        log_dir: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            dataset,
            preprocessor_name: preprocessor_name.into(),
            log_dir: log_dir.into(),
        }
    }

    pub fn dataset(&self) -> &S {
        &self.dataset
    }

    pub fn preprocessor_path(&self) -> PathBuf {
        self.storage.preprocessor_path(&self.preprocessor_name)
    }

    /// Fit the vocabulary on `split`, saving it when `save` is set.
    pub fn build(
        &self,
        split: Split,
        vocab: &VocabularyConfig,
        save: bool,
    ) -> Result<Preprocessor> {
        let docs = self.dataset.read(split)?;
        tracing::info!("Building dictionary from {split} data...");
        let preprocessor = Preprocessor::fit(&docs, vocab)?;
        if save {
            let path = self.preprocessor_path();
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)?;
            }
            preprocessor
                .save(&path)
                .with_context(|| format!("cannot save preprocessor to {}", path.display()))?;
            tracing::info!("Saved preprocessor to {}", path.display());
        }
        Ok(preprocessor)
    }

    pub fn load_preprocessor(&self) -> Result<Preprocessor> {
        let path = self.preprocessor_path();
        Preprocessor::load(&path)
            .with_context(|| format!("cannot load preprocessor from {}", path.display()))
    }

    /// The saved preprocessor, or a freshly built one when none exists or
    /// `rebuild` is set.
    pub fn preprocessor(
        &self,
        split: Split,
        vocab: &VocabularyConfig,
        rebuild: bool,
    ) -> Result<Preprocessor> {
        if !rebuild && self.preprocessor_path().exists() {
            return self.load_preprocessor();
        }
        self.build(split, vocab, true)
    }

    /// Training windows come from the train split (valid split for any
    /// other choice), validation windows from the test split.
    pub fn feeds(
        &self,
        preprocessor: &Preprocessor,
        split: Split,
        config: &WindowConfig,
    ) -> Result<SplitFeeds> {
        let train_split = match split {
            Split::Train => Split::Train,
            Split::Valid | Split::Test => Split::Valid,
        };
        let feed = |s: Split| -> Result<Windower> {
            let docs = self.dataset.read(s)?;
            let ids = preprocessor.transform(&docs)?;
            let (steps, windower) = make_feed(ids, preprocessor.pad_id(), config.clone())
                .with_context(|| format!("cannot window the {s} split"))?;
            tracing::info!(
                "{s} split: {} windows in {steps} steps",
                windower.window_count()
            );
            Ok(windower)
        };
        Ok(SplitFeeds {
            train: feed(train_split)?,
            validation: feed(Split::Test)?,
        })
    }

    pub fn train(
        &self,
        preprocessor: &Preprocessor,
        split: Split,
        cfg: &TrainConfig,
    ) -> Result<TrainSummary> {
        let feeds = self.feeds(preprocessor, split, &cfg.window_config())?;
        let log = self.storage.log_dir(&self.log_dir)?;
        let pad = preprocessor.pad_id();
        let dev = Device::cuda_if_available(0)?;

        let varmap = VarMap::new();
        let vs = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let model_cfg = LanguageModelConfig {
            vocab_size: preprocessor.vocab_size(),
            ..cfg.model.clone()
        };
        let model = LanguageModel::new(&model_cfg, vs)?;
        model_cfg.save(log.model_config_path())?;

        let mut optim = AdamW::new_lr(varmap.all_vars(), cfg.learning_rate)?;
        let metrics = MetricsLogger::new(log.metrics_path())?;
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut best_val_loss = f64::INFINITY;

        for epoch in 1..=cfg.epochs {
            let mut acc_loss = 0f64;
            let mut steps = 0usize;
            for batch in feeds.train.batches() {
                let (input, target) = batch.to_tensors(&dev)?;
                let loss = model.loss(&input, &target, pad)?;
                optim.backward_step(&loss)?;
                acc_loss += loss.to_scalar::<f32>()? as f64;
                steps += 1;
                if steps % LOG_EVERY == 0 {
                    tracing::debug!(
                        "epoch {epoch} step {steps}/{}: loss {:.4}",
                        feeds.train.steps(),
                        acc_loss / steps as f64
                    );
                }
            }
            let train_loss = acc_loss / steps.max(1) as f64;
            let val_loss = evaluate(&model, &feeds.validation, pad, &dev)?;

            // NaN never beats a later finite loss; the first epoch always saves
            let score = if val_loss.is_nan() { f64::INFINITY } else { val_loss };
            let improved = epoch == 1 || score < best_val_loss;
            if improved {
                best_val_loss = score;
                varmap.save(log.model_path())?;
                tracing::debug!("Saved checkpoint to {}", log.model_path().display());
            }
            tracing::info!(
                "Epoch {epoch}/{}: train loss {train_loss:.4}, validation loss {val_loss:.4}",
                cfg.epochs
            );
            metrics.log(&EpochMetrics {
                epoch,
                train_loss,
                val_loss,
                improved,
            })?;

            if let Some(prompt) = &cfg.prompt {
                if cfg.generate_every > 0 && epoch % cfg.generate_every == 0 {
                    let text =
                        generate_text(preprocessor, &model, &dev, prompt, &cfg.generate, &mut rng)?;
                    tracing::info!("Sample: {text}");
                }
            }
        }

        Ok(TrainSummary {
            epochs: cfg.epochs,
            best_val_loss,
            model_path: log.model_path(),
        })
    }

    /// Load the model saved by the last training run in this log directory.
    pub fn load_model(&self, device: &Device) -> Result<LanguageModel> {
        let log = self.storage.log_dir(&self.log_dir)?;
        let config = LanguageModelConfig::load(log.model_config_path())
            .context("cannot read model config, train a model first")?;
        let weights = log.model_path();
        if !weights.exists() {
            anyhow::bail!(
                "no checkpoint at {}, the last run saved no weights",
                weights.display()
            );
        }
        LanguageModel::load(&config, &weights, device)
            .with_context(|| format!("cannot load weights from {}", weights.display()))
    }
}

fn evaluate(model: &LanguageModel, feed: &Windower, pad: u32, dev: &Device) -> Result<f64> {
    let mut total = 0f64;
    let mut steps = 0usize;
    for batch in feed.batches() {
        let (input, target) = batch.to_tensors(dev)?;
        total += model.loss(&input, &target, pad)?.to_scalar::<f32>()? as f64;
        steps += 1;
    }
    Ok(total / steps.max(1) as f64)
}

/// Continue `seed_text` by sampling `iterations` words from `model`.
pub fn generate_text<R: Rng>(
    preprocessor: &Preprocessor,
    model: &LanguageModel,
    device: &Device,
    seed_text: &str,
    cfg: &GenerateConfig,
    rng: R,
) -> Result<String> {
    let seed = preprocessor
        .transform(&[seed_text])?
        .pop()
        .unwrap_or_default();
    let predictor = ModelPredictor::new(model, device.clone(), cfg.temperature);
    let mut sampler = Sampler::new(predictor, preprocessor.pad_id(), cfg.sequence_length, rng)?;
    let ids = sampler.generate(&seed, cfg.iterations)?;
    Ok(preprocessor.inverse_transform(&ids)?)
}
