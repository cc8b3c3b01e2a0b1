use std::fmt::Debug;

use anyhow::{bail, Result};
use ndarray::{Array1, Array2};

mod beam_search;
mod greedy;
mod teacher_forcing;

pub use beam_search::*;
pub use greedy::*;
pub use teacher_forcing::*;

/// The outcome of one sampling step across all lanes.
#[derive(Debug, Clone)]
pub struct Sampled {
    /// Symbol chosen for each (reordered) lane.
    pub sample_ids: Array1<u32>,
    /// Previous-step lane each chosen symbol extends.
    pub beam_ids: Vec<usize>,
    /// Cumulative log-probabilities after this step.
    pub log_probs: Array1<f32>,
    /// Emitted symbol counts after this step, frozen for finished lanes.
    pub lengths: Array1<usize>,
}

/// Next-symbol policy driving the decoding loop: supplies start symbols,
/// samples from per-step logits during inference, and decides when each
/// lane is finished.
///
/// Termination is this policy's obligation: an inference decode only stops
/// once every lane is reported finished, so policies for open-ended
/// decoding must carry a maximum-length force-finish rule.
pub trait Feedback: Debug {
    /// Number of beam lanes tracked per input sequence. 1 for non-beam
    /// decoding.
    fn beam_width(&self) -> usize {
        1
    }

    /// Initial finished mask and start symbols, one entry per lane
    /// (batch size × beam width).
    fn init_symbols(&self) -> (Array1<bool>, Array1<u32>);

    /// Samples next symbols from this step's logits. Inference only.
    ///
    /// `log_probs`, `finished` and `lengths` describe the lanes *before*
    /// this step; the returned record describes the chosen lanes, with
    /// `beam_ids` pointing each chosen lane at its parent.
    fn sample_symbols(
        &self,
        logits: &Array2<f32>,
        log_probs: &Array1<f32>,
        finished: &Array1<bool>,
        lengths: &Array1<usize>,
        time: usize,
    ) -> Result<Sampled> {
        let _ = (logits, log_probs, finished, lengths, time);
        bail!("this feedback policy does not sample symbols");
    }

    /// Reports lanes finished after `time` and yields the input symbols
    /// for `time + 1`. `sample_ids` is the sampling outcome during
    /// inference, `None` in teacher-forced decoding.
    fn next_symbols(
        &self,
        time: usize,
        sample_ids: Option<&Array1<u32>>,
    ) -> (Array1<bool>, Array1<u32>);
}

/// log-softmax over the vocabulary axis, numerically stabilized.
pub(crate) fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut out = logits.clone();
    for mut row in out.rows_mut() {
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        row.mapv_inplace(|v| v - max);
        let norm = row.iter().map(|v| v.exp()).sum::<f32>().ln();
        row.mapv_inplace(|v| v - norm);
    }
    out
}
