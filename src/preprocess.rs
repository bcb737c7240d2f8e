use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde_json::json;
use thiserror::Error;
use tokenizers::normalizers::{Lowercase, NFKC};
use tokenizers::pre_tokenizers::whitespace::Whitespace;
use tokenizers::{
    NormalizedString, Normalizer, OffsetReferential, OffsetType, PreTokenizedString,
    PreTokenizer, Tokenizer,
};

/// Id of the pad token in every fitted vocabulary.
pub const PAD_ID: u32 = 0;
/// Id of the unknown token in every fitted vocabulary.
pub const UNK_ID: u32 = 1;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("tokenizer: {0}")]
    Tokenizer(String),

    #[error("invalid vocabulary configuration: {0}")]
    Configuration(String),

    #[error("no documents to fit a vocabulary on")]
    EmptyCorpus,

    #[error("preprocessor json: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, PreprocessError>;

fn tok_err(e: tokenizers::Error) -> PreprocessError {
    PreprocessError::Tokenizer(e.to_string())
}

#[derive(Debug, Clone)]
pub struct VocabularyConfig {
    /// Minimum number of documents a word must appear in.
    pub min_df: usize,
    /// Maximum number of documents a word may appear in.
    pub max_df: usize,
    pub unknown: String,
    pub pad: String,
}

impl Default for VocabularyConfig {
    fn default() -> Self {
        Self {
            min_df: 5,
            max_df: usize::MAX,
            unknown: "<unk>".to_string(),
            pad: "<pad>".to_string(),
        }
    }
}

impl VocabularyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.min_df > self.max_df {
            return Err(PreprocessError::Configuration(format!(
                "min_df {} is above max_df {}",
                self.min_df, self.max_df
            )));
        }
        if self.unknown == self.pad {
            return Err(PreprocessError::Configuration(
                "unknown and pad tokens must differ".to_string(),
            ));
        }
        Ok(())
    }
}

/// Text normalization, word tokenization and a fitted word vocabulary,
/// backed by a word-level `tokenizers` pipeline.
pub struct Preprocessor {
    tokenizer: Tokenizer,
}

impl Preprocessor {
    /// Fit a vocabulary on `docs`: NFKC + lowercase, split into words and
    /// punctuation, keep words whose document frequency lies within
    /// `[min_df, max_df]`, most frequent first.
    pub fn fit<S: AsRef<str>>(docs: &[S], config: &VocabularyConfig) -> Result<Self> {
        config.validate()?;
        if docs.is_empty() {
            return Err(PreprocessError::EmptyCorpus);
        }

        let markers = [config.pad.as_str(), config.unknown.as_str()];
        let mut df: HashMap<String, usize> = HashMap::new();
        for doc in docs {
            let words: HashSet<String> =
                split_words(doc.as_ref(), &markers)?.into_iter().collect();
            for word in words {
                *df.entry(word).or_insert(0) += 1;
            }
        }

        let mut kept: Vec<(String, usize)> = df
            .into_iter()
            .filter(|(_, n)| (config.min_df..=config.max_df).contains(n))
            .collect();
        kept.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        let mut vocab = serde_json::Map::new();
        vocab.insert(config.pad.clone(), json!(PAD_ID));
        vocab.insert(config.unknown.clone(), json!(UNK_ID));
        for (i, (word, _)) in kept.iter().enumerate() {
            vocab.insert(word.clone(), json!(i as u32 + 2));
        }
        tracing::info!(
            "Fitted vocabulary of {} words from {} documents",
            vocab.len(),
            docs.len()
        );

        let tokenizer_json = json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [
                {"id": PAD_ID, "content": config.pad, "single_word": false, "lstrip": false,
                 "rstrip": false, "normalized": false, "special": true},
                {"id": UNK_ID, "content": config.unknown, "single_word": false, "lstrip": false,
                 "rstrip": false, "normalized": false, "special": false}
            ],
            "normalizer": {
                "type": "Sequence",
                "normalizers": [{"type": "NFKC"}, {"type": "Lowercase"}]
            },
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {
                "type": "WordLevel",
                "vocab": vocab,
                "unk_token": config.unknown
            }
        });
        let tokenizer =
            Tokenizer::from_bytes(serde_json::to_vec(&tokenizer_json)?).map_err(tok_err)?;
        Ok(Self { tokenizer })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(path.as_ref()).map_err(tok_err)?;
        Ok(Self { tokenizer })
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.tokenizer.save(path.as_ref(), false).map_err(tok_err)
    }

    pub fn pad_id(&self) -> u32 {
        PAD_ID
    }

    pub fn vocab_size(&self) -> usize {
        self.tokenizer.get_vocab_size(false)
    }

    /// Encode each document into word ids.
    pub fn transform<S: AsRef<str>>(&self, docs: &[S]) -> Result<Vec<Vec<u32>>> {
        let inputs: Vec<&str> = docs.iter().map(|d| d.as_ref()).collect();
        let encodings = self.tokenizer.encode_batch(inputs, false).map_err(tok_err)?;
        Ok(encodings.iter().map(|e| e.get_ids().to_vec()).collect())
    }

    /// Words for `ids` joined by single spaces, pad tokens skipped.
    pub fn inverse_transform(&self, ids: &[u32]) -> Result<String> {
        self.tokenizer.decode(ids, true).map_err(tok_err)
    }
}

/// Normalized words of `text`. Literal `markers` are dropped before
/// pre-tokenization so they never enter the counts as punctuation pieces.
fn split_words(text: &str, markers: &[&str]) -> Result<Vec<String>> {
    let mut text = text.to_string();
    for marker in markers {
        text = text.replace(marker, " ");
    }
    let mut normalized = NormalizedString::from(text.as_str());
    NFKC.normalize(&mut normalized).map_err(tok_err)?;
    Lowercase.normalize(&mut normalized).map_err(tok_err)?;
    let mut pretokenized = PreTokenizedString::from(normalized);
    Whitespace::default()
        .pre_tokenize(&mut pretokenized)
        .map_err(tok_err)?;
    Ok(pretokenized
        .get_splits(OffsetReferential::Normalized, OffsetType::Char)
        .into_iter()
        .map(|(word, _, _)| word.to_string())
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_config(min_df: usize, max_df: usize) -> VocabularyConfig {
        VocabularyConfig {
            min_df,
            max_df,
            ..VocabularyConfig::default()
        }
    }

    fn corpus() -> Vec<String> {
        vec![
            "The cat sat".to_string(),
            "the CAT ran".to_string(),
            "A dog.".to_string(),
        ]
    }

    #[test]
    fn min_df_filters_rare_words() {
        let p = Preprocessor::fit(&corpus(), &small_config(2, usize::MAX)).unwrap();
        // <pad>, <unk>, cat, the
        assert_eq!(p.vocab_size(), 4);
        let ids = p.transform(&["the dog", "cat"]).unwrap();
        assert_eq!(ids, vec![vec![3, UNK_ID], vec![2]]);
    }

    #[test]
    fn max_df_filters_common_words() {
        let p = Preprocessor::fit(&corpus(), &small_config(1, 1)).unwrap();
        let ids = p.transform(&["the sat"]).unwrap();
        assert_eq!(ids[0][0], UNK_ID);
        assert_ne!(ids[0][1], UNK_ID);
    }

    #[test]
    fn normalizes_width_and_case() {
        let p = Preprocessor::fit(&corpus(), &small_config(2, usize::MAX)).unwrap();
        let ids = p.transform(&["ＣＡＴ"]).unwrap();
        assert_eq!(ids, vec![vec![2]]);
    }

    #[test]
    fn inverse_transform_skips_pad() {
        let p = Preprocessor::fit(&corpus(), &small_config(2, usize::MAX)).unwrap();
        assert_eq!(p.inverse_transform(&[3, 2, PAD_ID]).unwrap(), "the cat");
        assert_eq!(p.pad_id(), PAD_ID);
    }

    #[test]
    fn save_and_load_keep_encoding() {
        let p = Preprocessor::fit(&corpus(), &small_config(1, usize::MAX)).unwrap();
        let path = std::env::temp_dir().join("wikilm_preprocess_roundtrip.json");
        p.save(&path).unwrap();
        let loaded = Preprocessor::load(&path);
        let _ = std::fs::remove_file(&path);
        let loaded = loaded.unwrap();
        let text = ["a dog sat with the cat"];
        assert_eq!(loaded.transform(&text).unwrap(), p.transform(&text).unwrap());
        assert_eq!(loaded.vocab_size(), p.vocab_size());
    }

    #[test]
    fn dataset_unknown_marker_stays_one_token() {
        let docs = ["the <unk> sat", "a <unk> ran", "the <unk> dog"];
        let p = Preprocessor::fit(&docs, &small_config(1, usize::MAX)).unwrap();
        // <pad>, <unk>, the, a, dog, ran, sat
        assert_eq!(p.vocab_size(), 7);
        let ids = p.transform(&["the <unk> sat"]).unwrap();
        assert_eq!(ids[0].len(), 3);
        assert_eq!(ids[0][1], UNK_ID);
        assert_eq!(p.inverse_transform(&ids[0]).unwrap(), "the <unk> sat");
    }

    #[test]
    fn rejects_bad_configuration() {
        assert!(matches!(
            Preprocessor::fit(&corpus(), &small_config(3, 2)),
            Err(PreprocessError::Configuration(_))
        ));
        let empty: Vec<String> = Vec::new();
        assert!(matches!(
            Preprocessor::fit(&empty, &VocabularyConfig::default()),
            Err(PreprocessError::EmptyCorpus)
        ));
    }
}
