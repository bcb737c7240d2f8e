use flate2::bufread::GzDecoder;
use hf_hub::api::sync::{Api, ApiError};
use std::fmt;
use std::fs::File;
use std::io::prelude::*;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("{split} split not found in {}", .dir.display())]
    MissingSplit { split: Split, dir: PathBuf },

    #[error("dataset download failed: {0}")]
    Hub(#[from] ApiError),

    #[error("dataset io: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DatasetError>;

#[derive(Debug, Error)]
#[error("unknown split {0:?}, expected train, valid or test")]
pub struct ParseSplitError(String);

/// The three partitions of a language-modeling dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Split {
    Train,
    Valid,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Valid, Split::Test];

    pub fn file_name(self) -> &'static str {
        match self {
            Split::Train => "wiki.train.tokens",
            Split::Valid => "wiki.valid.tokens",
            Split::Test => "wiki.test.tokens",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Split::Train => "train",
            Split::Valid => "valid",
            Split::Test => "test",
        };
        f.write_str(name)
    }
}

impl FromStr for Split {
    type Err = ParseSplitError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "train" => Ok(Split::Train),
            "valid" | "validation" => Ok(Split::Valid),
            "test" => Ok(Split::Test),
            _ => Err(ParseSplitError(s.to_string())),
        }
    }
}

/// A source of raw text documents per split.
pub trait TextSplits {
    fn read(&self, split: Split) -> Result<Vec<String>>;
}

/// WikiText-2 as `wiki.{train,valid,test}.tokens`, plain or gzipped, under
/// `<raw>/wikitext-2`. Missing files are fetched from a Hugging Face
/// dataset repository when one is configured.
pub struct WikiText2 {
    dir: PathBuf,
    hub_repo: Option<String>,
}

impl WikiText2 {
    pub fn new(raw_dir: impl AsRef<Path>, hub_repo: Option<String>) -> Self {
        Self {
            dir: raw_dir.as_ref().join("wikitext-2"),
            hub_repo,
        }
    }

    /// Path of a split file, downloading it if needed.
    pub fn locate(&self, split: Split) -> Result<PathBuf> {
        let plain = self.dir.join(split.file_name());
        if plain.exists() {
            return Ok(plain);
        }
        let gz = self.dir.join(format!("{}.gz", split.file_name()));
        if gz.exists() {
            return Ok(gz);
        }
        match &self.hub_repo {
            Some(repo) => self.download(repo, split),
            None => Err(DatasetError::MissingSplit {
                split,
                dir: self.dir.clone(),
            }),
        }
    }

    /// Fetch every split up front.
    pub fn download_all(&self) -> Result<Vec<PathBuf>> {
        Split::ALL.iter().map(|&s| self.locate(s)).collect()
    }

    fn download(&self, repo: &str, split: Split) -> Result<PathBuf> {
        tracing::info!("Downloading {} from {repo}", split.file_name());
        let api = Api::new()?;
        let path = api.dataset(repo.to_string()).get(split.file_name())?;
        tracing::debug!("{split} split cached at {}", path.display());
        Ok(path)
    }
}

impl TextSplits for WikiText2 {
    fn read(&self, split: Split) -> Result<Vec<String>> {
        let path = self.locate(split)?;
        let text = extract_text(&path)?;
        let docs = documents(&text);
        tracing::debug!("Read {} documents from {}", docs.len(), path.display());
        Ok(docs)
    }
}

fn extract_text(path: &Path) -> std::io::Result<String> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);
    let mut text = String::new();
    if path.extension().is_some_and(|e| e == "gz") {
        GzDecoder::new(reader).read_to_string(&mut text)?;
    } else {
        reader.read_to_string(&mut text)?;
    }
    Ok(text)
}

/// One document per non-blank line.
fn documents(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
