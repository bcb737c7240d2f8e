use candle_core::{Device, Tensor};
use thiserror::Error;

use crate::sequence::{fit_length, PadSide};

#[derive(Debug, Error)]
pub enum WindowError {
    #[error("invalid window configuration: {0}")]
    Configuration(String),

    #[error("corpus is empty, nothing to window")]
    EmptyInput,
}

pub type Result<T> = std::result::Result<T, WindowError>;

/// How the target of a window relates to its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Shift {
    /// Target is the input moved forward by one position, same length.
    #[default]
    Sequence,
    /// Target is the single token following the input.
    NextToken,
}

#[derive(Debug, Clone)]
pub struct WindowConfig {
    pub batch_size: usize,
    pub sequence_length: usize,
    pub shift: Shift,
    /// Treat the corpus as one stream, windows continue across documents.
    pub sequential: bool,
    /// Drop the final batch of an epoch when it is shorter than `batch_size`.
    pub drop_last: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            sequence_length: 8,
            shift: Shift::Sequence,
            sequential: false,
            drop_last: false,
        }
    }
}

impl WindowConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(WindowError::Configuration(
                "batch_size must be positive".to_string(),
            ));
        }
        if self.sequence_length == 0 {
            return Err(WindowError::Configuration(
                "sequence_length must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Sequence(Vec<u32>),
    Token(u32),
}

/// One training example. `input` always holds exactly `sequence_length` ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub input: Vec<u32>,
    pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub windows: Vec<Window>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Stack the batch into `(input, target)` tensors: input is `[b, L]`,
    /// target is `[b, L]` for sequence targets and `[b]` for single tokens.
    pub fn to_tensors(&self, device: &Device) -> candle_core::Result<(Tensor, Tensor)> {
        let b = self.windows.len();
        let seq_len = self.windows.first().map_or(0, |w| w.input.len());
        let inputs: Vec<u32> = self
            .windows
            .iter()
            .flat_map(|w| w.input.iter().copied())
            .collect();
        let input = Tensor::from_vec(inputs, (b, seq_len), device)?;

        let mut targets: Vec<u32> = Vec::with_capacity(b * seq_len);
        let mut single = false;
        for w in self.windows.iter() {
            match &w.target {
                Target::Sequence(t) => targets.extend_from_slice(t),
                Target::Token(t) => {
                    single = true;
                    targets.push(*t);
                }
            }
        }
        let target = if single {
            Tensor::from_vec(targets, b, device)?
        } else {
            Tensor::from_vec(targets, (b, seq_len), device)?
        };
        Ok((input, target))
    }
}

/// Turns token sequences into fixed-length shift-by-one windows.
///
/// A window starting at offset `s` reads at most `L + 1` tokens from `s`;
/// the input is the first `min(L, n - 1)` of them and the target the same
/// span moved one position forward. Windows start `L` tokens apart. Short
/// windows are right-padded with the pad token. Without `sequential` each
/// document is windowed on its own; with it the documents form one stream.
#[derive(Debug, Clone)]
pub struct Windower {
    corpus: Vec<Vec<u32>>,
    pad: u32,
    config: WindowConfig,
    windows: usize,
}

impl Windower {
    pub fn new<I>(corpus: I, pad: u32, config: WindowConfig) -> Result<Self>
    where
        I: IntoIterator<Item = Vec<u32>>,
    {
        config.validate()?;
        let corpus: Vec<Vec<u32>> = corpus.into_iter().collect();
        if corpus.is_empty() {
            return Err(WindowError::EmptyInput);
        }

        let windows = if config.sequential {
            windows_in(corpus.iter().map(Vec::len).sum(), config.sequence_length)
        } else {
            corpus
                .iter()
                .map(|doc| windows_in(doc.len(), config.sequence_length))
                .sum()
        };
        if windows == 0 {
            return Err(WindowError::EmptyInput);
        }
        if config.drop_last && windows < config.batch_size {
            return Err(WindowError::Configuration(format!(
                "batch_size {} exceeds the {windows} available windows",
                config.batch_size
            )));
        }

        Ok(Self {
            corpus,
            pad,
            config,
            windows,
        })
    }

    /// Number of windows in one pass over the corpus.
    pub fn window_count(&self) -> usize {
        self.windows
    }

    /// Number of batches in one pass over the corpus.
    pub fn steps(&self) -> usize {
        let bs = self.config.batch_size;
        if self.config.drop_last {
            self.windows / bs
        } else {
            self.windows.div_ceil(bs)
        }
    }

    /// A fresh pass over the corpus, computed one window at a time.
    pub fn windows(&self) -> Windows<'_> {
        Windows {
            windower: self,
            doc: 0,
            offset: 0,
        }
    }

    /// A fresh pass over the corpus grouped into batches. Each call starts
    /// from the beginning of the corpus.
    pub fn batches(&self) -> Batches<'_> {
        Batches {
            windows: self.windows(),
            batch_size: self.config.batch_size,
            drop_last: self.config.drop_last,
        }
    }

    fn window(&self, span: &[u32]) -> Window {
        let len = self.config.sequence_length;
        let k = len.min(span.len() - 1);
        let input = fit_length(&span[..k], len, self.pad, PadSide::Right);
        let target = match self.config.shift {
            Shift::Sequence => {
                Target::Sequence(fit_length(&span[1..=k], len, self.pad, PadSide::Right))
            }
            Shift::NextToken => Target::Token(span[k]),
        };
        Window { input, target }
    }
}

/// Builds a windower and returns it along with its per-epoch step count.
pub fn make_feed<I>(corpus: I, pad: u32, config: WindowConfig) -> Result<(usize, Windower)>
where
    I: IntoIterator<Item = Vec<u32>>,
{
    let windower = Windower::new(corpus, pad, config)?;
    Ok((windower.steps(), windower))
}

fn windows_in(tokens: usize, sequence_length: usize) -> usize {
    if tokens < 2 {
        0
    } else {
        (tokens - 1).div_ceil(sequence_length)
    }
}

pub struct Windows<'a> {
    windower: &'a Windower,
    doc: usize,
    offset: usize,
}

impl Windows<'_> {
    fn span(&self) -> Vec<u32> {
        let corpus = &self.windower.corpus;
        let take = self.windower.config.sequence_length + 1;
        if self.windower.config.sequential {
            corpus[self.doc..]
                .iter()
                .enumerate()
                .flat_map(|(i, d)| if i == 0 { &d[self.offset..] } else { &d[..] })
                .copied()
                .take(take)
                .collect()
        } else {
            corpus[self.doc][self.offset..]
                .iter()
                .copied()
                .take(take)
                .collect()
        }
    }

    fn advance(&mut self) {
        let corpus = &self.windower.corpus;
        let mut remaining = self.windower.config.sequence_length;
        if !self.windower.config.sequential {
            self.offset += remaining;
            return;
        }
        while let Some(doc) = corpus.get(self.doc) {
            let left = doc.len() - self.offset;
            if remaining < left {
                self.offset += remaining;
                return;
            }
            remaining -= left;
            self.doc += 1;
            self.offset = 0;
        }
    }
}

impl Iterator for Windows<'_> {
    type Item = Window;

    fn next(&mut self) -> Option<Window> {
        loop {
            let doc = self.windower.corpus.get(self.doc)?;
            if self.offset >= doc.len() {
                self.doc += 1;
                self.offset = 0;
                continue;
            }
            let span = self.span();
            if span.len() < 2 {
                if self.windower.config.sequential {
                    return None;
                }
                self.doc += 1;
                self.offset = 0;
                continue;
            }
            self.advance();
            return Some(self.windower.window(&span));
        }
    }
}

pub struct Batches<'a> {
    windows: Windows<'a>,
    batch_size: usize,
    drop_last: bool,
}

impl Iterator for Batches<'_> {
    type Item = Batch;

    fn next(&mut self) -> Option<Batch> {
        let windows: Vec<Window> = self.windows.by_ref().take(self.batch_size).collect();
        if windows.is_empty() || (self.drop_last && windows.len() < self.batch_size) {
            return None;
        }
        Some(Batch { windows })
    }
}
