use std::fmt::Debug;

use anyhow::Result;
use ndarray::{Array1, Array2};

/// The decoder bottom and top layers: transformations between target
/// symbols and the vector spaces the decoder computes in.
pub trait Modality: Debug {
    /// Width of the vocabulary distribution produced by `project`.
    fn vocab_size(&self) -> usize;

    /// Embeds one batch of symbols for decoding position `time`,
    /// one row per lane.
    fn embed(&self, symbols: &Array1<u32>, time: usize) -> Result<Array2<f32>>;

    /// Projects merged decoder top features onto the vocabulary, producing
    /// unnormalized logits, one row per lane.
    fn project(&self, features: &Array2<f32>) -> Result<Array2<f32>>;
}
