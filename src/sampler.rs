use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use thiserror::Error;

use crate::sequence::{fit_length, PadSide};

/// Largest accepted distance between the sum of a distribution and 1.0.
pub const DISTRIBUTION_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error)]
pub enum SampleError {
    #[error("invalid sampler configuration: {0}")]
    Configuration(String),

    #[error("invalid distribution: {0}")]
    InvalidDistribution(String),

    #[error("predictor failed: {0}")]
    Predictor(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, SampleError>;

/// Anything that maps a fixed-length window of ids to a probability
/// distribution over the vocabulary for the next id.
pub trait Predictor {
    fn predict(&self, window: &[u32]) -> candle_core::Result<Vec<f32>>;
}

impl<P: Predictor + ?Sized> Predictor for &P {
    fn predict(&self, window: &[u32]) -> candle_core::Result<Vec<f32>> {
        (**self).predict(window)
    }
}

/// Extends a seed one sampled token at a time.
pub struct Sampler<P, R> {
    predictor: P,
    pad: u32,
    sequence_length: usize,
    rng: R,
}

impl<P: Predictor, R: Rng> Sampler<P, R> {
    pub fn new(predictor: P, pad: u32, sequence_length: usize, rng: R) -> Result<Self> {
        if sequence_length == 0 {
            return Err(SampleError::Configuration(
                "sequence_length must be positive".to_string(),
            ));
        }
        Ok(Self {
            predictor,
            pad,
            sequence_length,
            rng,
        })
    }

    /// The predictor input for `tokens`: left-padded, or the last
    /// `sequence_length` ids.
    pub fn window(&self, tokens: &[u32]) -> Vec<u32> {
        fit_length(tokens, self.sequence_length, self.pad, PadSide::Left)
    }

    /// Returns `seed` followed by `iterations` sampled ids.
    pub fn generate(&mut self, seed: &[u32], iterations: usize) -> Result<Vec<u32>> {
        let mut tokens = Vec::with_capacity(seed.len() + iterations);
        tokens.extend_from_slice(seed);
        for _ in 0..iterations {
            let window = self.window(&tokens);
            let probs = self.predictor.predict(&window)?;
            let next = self.draw(&probs)?;
            tokens.push(next);
        }
        Ok(tokens)
    }

    fn draw(&mut self, probs: &[f32]) -> Result<u32> {
        check_distribution(probs)?;
        let dist = WeightedIndex::new(probs)
            .map_err(|e| SampleError::InvalidDistribution(e.to_string()))?;
        Ok(dist.sample(&mut self.rng) as u32)
    }
}

pub fn check_distribution(probs: &[f32]) -> Result<()> {
    if probs.is_empty() {
        return Err(SampleError::InvalidDistribution(
            "empty distribution".to_string(),
        ));
    }
    if let Some((i, p)) = probs
        .iter()
        .enumerate()
        .find(|(_, p)| !p.is_finite() || **p < 0.0)
    {
        return Err(SampleError::InvalidDistribution(format!(
            "entry {i} is {p}"
        )));
    }
    let total: f64 = probs.iter().map(|&p| p as f64).sum();
    if (total - 1.0).abs() > DISTRIBUTION_TOLERANCE {
        return Err(SampleError::InvalidDistribution(format!(
            "probabilities sum to {total}"
        )));
    }
    Ok(())
}
