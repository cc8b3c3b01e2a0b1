use std::fmt::Debug;

use anyhow::{ensure, Result};
use ndarray::Array2;

use super::BeamTrace;

mod max_likelihood;

pub use max_likelihood::*;

/// Given candidate sequences grouped per batch entry and their cumulative
/// log probabilities, returns the index of the winning candidate in each
/// group.
pub trait SequenceRanker: Debug {
    fn rank(&self, candidates: &[Vec<Vec<u32>>], sum_logprobs: &Array2<f32>) -> Vec<usize>;
}

/// Turns a finished beam trace into one symbol sequence per batch entry.
///
/// Backtracks every lane, trims each sequence at its first end-of-sequence
/// symbol, and lets `ranker` choose among the `beam` candidates of every
/// entry.
pub fn finalize_hypotheses(
    trace: &BeamTrace,
    beam: usize,
    eos_id: u32,
    ranker: &dyn SequenceRanker,
) -> Result<Vec<Vec<u32>>> {
    ensure!(beam > 0, "beam width must be positive");
    let lanes = trace.lanes();
    ensure!(
        lanes % beam == 0,
        "lane count {lanes} is not divisible by beam width {beam}"
    );
    let batch = lanes / beam;

    let mut sequences = trace.backtrack();
    for seq in &mut sequences {
        if let Some(end) = seq.iter().position(|&s| s == eos_id) {
            seq.truncate(end);
        }
    }

    let final_log_probs = if trace.steps() == 0 {
        Array2::zeros((batch, beam))
    } else {
        let last = trace.log_probs.row(trace.steps() - 1);
        Array2::from_shape_fn((batch, beam), |(b, k)| last[b * beam + k])
    };

    let candidates: Vec<Vec<Vec<u32>>> = sequences.chunks(beam).map(|c| c.to_vec()).collect();
    let picks = ranker.rank(&candidates, &final_log_probs);
    ensure!(
        picks.len() == candidates.len(),
        "ranker returned {} picks for {} groups",
        picks.len(),
        candidates.len()
    );

    Ok(candidates
        .into_iter()
        .zip(picks)
        .map(|(mut group, pick)| group.swap_remove(pick))
        .collect())
}
