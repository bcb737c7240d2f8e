use anyhow::Result;
use candle_core::Device;
use clap::{Args, Parser, Subcommand};
use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::data::{Split, WikiText2};
use crate::model::LanguageModelConfig;
use crate::preprocess::VocabularyConfig;
use crate::storage::Storage;
use crate::train::{generate_text, GenerateConfig, TrainConfig, Trainer};

#[derive(Parser, Debug)]
#[command(
    name = "wikilm",
    version,
    about = "Fit a vocabulary on WikiText-2, train a word-level language model and sample from it."
)]
pub struct Cli {
    /// Project root; files are kept under <root>/data
    #[arg(long, global = true, default_value = ".")]
    pub root: String,

    /// Subdirectory of data/log for checkpoints and metrics
    #[arg(long, global = true, default_value = "")]
    pub log_dir: String,

    /// File name (without extension) of the saved preprocessor in data/interim
    #[arg(long, global = true, default_value = "preprocessor")]
    pub preprocessor_name: String,

    /// Hugging Face dataset repository holding wiki.{train,valid,test}.tokens,
    /// used when the files are not under data/raw/wikitext-2
    #[arg(long, global = true)]
    pub hub_repo: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Fetch the three dataset splits
    Download,

    /// Fit the vocabulary on one split
    Build(BuildArgs),

    /// Train the language model
    Train(TrainArgs),

    /// Continue a seed text with a trained model
    Generate(GenerateArgs),
}

#[derive(Args, Debug, Clone)]
pub struct VocabArgs {
    /// Minimum document frequency of a vocabulary word
    #[arg(long, default_value_t = 5)]
    pub min_df: usize,

    /// Maximum document frequency of a vocabulary word
    #[arg(long, default_value_t = usize::MAX)]
    pub max_df: usize,

    #[arg(long, default_value = "<unk>")]
    pub unknown: String,
}

impl From<VocabArgs> for VocabularyConfig {
    fn from(a: VocabArgs) -> Self {
        VocabularyConfig {
            min_df: a.min_df,
            max_df: a.max_df,
            unknown: a.unknown,
            ..VocabularyConfig::default()
        }
    }
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Split to fit the vocabulary on (train, valid or test)
    #[arg(long, default_value = "train")]
    pub split: Split,

    /// Fit only, do not write the preprocessor to disk
    #[arg(long)]
    pub no_save: bool,

    #[command(flatten)]
    pub vocab: VocabArgs,
}

#[derive(Args, Debug)]
pub struct TrainArgs {
    /// train uses the train split; valid or test train on the valid split
    #[arg(long, default_value = "train")]
    pub split: Split,

    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 8)]
    pub sequence_length: usize,

    #[arg(long, default_value_t = 50)]
    pub epochs: usize,

    #[arg(long, default_value_t = 1e-3)]
    pub lr: f64,

    /// Let windows continue across document boundaries
    #[arg(long)]
    pub sequential: bool,

    /// Refit the vocabulary even if a saved preprocessor exists
    #[arg(long)]
    pub rebuild: bool,

    #[arg(long, default_value_t = 256)]
    pub dim: usize,

    #[arg(long, default_value_t = 2)]
    pub depth: usize,

    #[arg(long, default_value_t = 4)]
    pub ff_mult: usize,

    #[arg(long, default_value_t = 1.5)]
    pub exp_factor: f32,

    /// Text to continue after every `generate_every` epochs
    #[arg(long)]
    pub prompt: Option<String>,

    #[arg(long, default_value_t = 1)]
    pub generate_every: usize,

    /// Words to sample after the prompt
    #[arg(long, default_value_t = 20)]
    pub sample_iterations: usize,

    #[arg(long, default_value_t = 1.0)]
    pub temperature: f64,

    #[arg(long, default_value_t = 0)]
    pub seed: u64,

    #[command(flatten)]
    pub vocab: VocabArgs,
}

impl From<&TrainArgs> for TrainConfig {
    fn from(a: &TrainArgs) -> Self {
        TrainConfig {
            batch_size: a.batch_size,
            sequence_length: a.sequence_length,
            epochs: a.epochs,
            learning_rate: a.lr,
            sequential: a.sequential,
            generate_every: a.generate_every,
            prompt: a.prompt.clone(),
            generate: GenerateConfig {
                sequence_length: a.sequence_length,
                iterations: a.sample_iterations,
                temperature: a.temperature,
            },
            seed: a.seed,
            model: LanguageModelConfig {
                vocab_size: 0,
                dim: a.dim,
                depth: a.depth,
                ff_mult: a.ff_mult,
                exp_factor: a.exp_factor,
            },
        }
    }
}

#[derive(Args, Debug)]
pub struct GenerateArgs {
    #[arg(long)]
    pub seed_text: String,

    #[arg(long, default_value_t = 10)]
    pub sequence_length: usize,

    #[arg(long, default_value_t = 20)]
    pub iterations: usize,

    #[arg(long, default_value_t = 1.0)]
    pub temperature: f64,

    /// Seed for the sampler; random when omitted
    #[arg(long)]
    pub rng_seed: Option<u64>,
}

impl From<&GenerateArgs> for GenerateConfig {
    fn from(a: &GenerateArgs) -> Self {
        GenerateConfig {
            sequence_length: a.sequence_length,
            iterations: a.iterations,
            temperature: a.temperature,
        }
    }
}

impl Cli {
    pub fn run(self) -> Result<()> {
        let storage = Storage::new(&self.root);
        let dataset = WikiText2::new(storage.raw_dir(), self.hub_repo.clone());
        let trainer = Trainer::new(storage, dataset, &self.preprocessor_name, &self.log_dir);

        match self.command {
            Commands::Download => {
                for path in trainer.dataset().download_all()? {
                    tracing::info!("Found {}", path.display());
                }
            }
            Commands::Build(args) => {
                trainer.build(args.split, &args.vocab.into(), !args.no_save)?;
                tracing::info!("Done!");
            }
            Commands::Train(args) => {
                let vocab: VocabularyConfig = args.vocab.clone().into();
                let preprocessor = trainer.preprocessor(args.split, &vocab, args.rebuild)?;
                let summary = trainer.train(&preprocessor, args.split, &TrainConfig::from(&args))?;
                tracing::info!(
                    "Trained {} epochs, best validation loss {:.4}, model at {}",
                    summary.epochs,
                    summary.best_val_loss,
                    summary.model_path.display()
                );
            }
            Commands::Generate(args) => {
                let device = Device::cuda_if_available(0)?;
                let preprocessor = trainer.load_preprocessor()?;
                let model = trainer.load_model(&device)?;
                let rng = match args.rng_seed {
                    Some(seed) => StdRng::seed_from_u64(seed),
                    None => StdRng::from_entropy(),
                };
                let text = generate_text(
                    &preprocessor,
                    &model,
                    &device,
                    &args.seed_text,
                    &GenerateConfig::from(&args),
                    rng,
                )?;
                println!("{text}");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_train_flags_into_config() {
        let cli = Cli::parse_from([
            "wikilm",
            "--log-dir",
            "exp1",
            "train",
            "--split",
            "valid",
            "--batch-size",
            "16",
            "--sequence-length",
            "12",
            "--sequential",
            "--min-df",
            "2",
        ]);
        assert_eq!(cli.log_dir, "exp1");
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        assert_eq!(args.split, Split::Valid);
        let cfg = TrainConfig::from(&args);
        assert_eq!(cfg.batch_size, 16);
        assert_eq!(cfg.sequence_length, 12);
        assert!(cfg.sequential);
        assert_eq!(cfg.epochs, 50);
        let window = cfg.window_config();
        assert_eq!(window.batch_size, 16);
        assert_eq!(cfg.generate.sequence_length, 12);
        assert_eq!(cfg.generate.iterations, 20);
        let vocab = VocabularyConfig::from(args.vocab);
        assert_eq!(vocab.min_df, 2);
        assert_eq!(vocab.max_df, usize::MAX);
    }

    #[test]
    fn train_sample_flags() {
        let cli = Cli::parse_from([
            "wikilm",
            "train",
            "--prompt",
            "the game",
            "--sample-iterations",
            "5",
            "--temperature",
            "0.7",
        ]);
        let Commands::Train(args) = cli.command else {
            panic!("expected train");
        };
        let cfg = TrainConfig::from(&args);
        assert_eq!(cfg.prompt.as_deref(), Some("the game"));
        assert_eq!(cfg.generate.sequence_length, cfg.sequence_length);
        assert_eq!(cfg.generate.iterations, 5);
        assert_eq!(cfg.generate.temperature, 0.7);
    }

    #[test]
    fn generate_defaults() {
        let cli = Cli::parse_from(["wikilm", "generate", "--seed-text", "the game"]);
        let Commands::Generate(args) = cli.command else {
            panic!("expected generate");
        };
        let cfg = GenerateConfig::from(&args);
        assert_eq!(cfg.sequence_length, 10);
        assert_eq!(cfg.iterations, 20);
        assert_eq!(args.rng_seed, None);
    }

    #[test]
    fn rejects_unknown_split() {
        assert!(Cli::try_parse_from(["wikilm", "build", "--split", "dev"]).is_err());
    }
}
