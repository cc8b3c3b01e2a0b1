use std::cmp::Ordering;

use anyhow::{ensure, Result};
use ndarray::{Array1, Array2};

use super::{log_softmax, Feedback, Sampled};

/// Beam search over `vocabulary × beam width` candidate expansions per
/// batch entry.
///
/// Candidates are ranked by length-normalized score when a length penalty
/// is configured and by raw cumulative log-probability otherwise; the
/// log-probabilities reported back to the loop are always the raw sums.
/// Lanes are force-finished at `max_length`, which makes termination
/// unconditional.
#[derive(Debug)]
pub struct BeamSearchFeedback {
    batch_size: usize,
    beam_width: usize,
    start_id: u32,
    eos_id: u32,
    max_length: usize,
    length_penalty: Option<f64>,
}

impl BeamSearchFeedback {
    pub fn new(
        batch_size: usize,
        beam_width: usize,
        start_id: u32,
        eos_id: u32,
        max_length: usize,
    ) -> Result<Self> {
        ensure!(beam_width > 0, "beam width must be positive");
        ensure!(max_length > 0, "max length must be positive");
        Ok(Self {
            batch_size,
            beam_width,
            start_id,
            eos_id,
            max_length,
            length_penalty: None,
        })
    }

    /// Ranks candidates by the Google NMT length penalty with exponent
    /// `alpha` instead of raw cumulative log-probability.
    pub fn with_length_penalty(mut self, alpha: f64) -> Self {
        self.length_penalty = Some(alpha);
        self
    }

    fn lanes(&self) -> usize {
        self.batch_size * self.beam_width
    }

    fn score(&self, log_prob: f32, length: usize) -> f64 {
        match self.length_penalty {
            Some(alpha) => {
                f64::from(log_prob) / f64::powf((5. + length.max(1) as f64) / 6., alpha)
            }
            None => f64::from(log_prob),
        }
    }
}

/// One expansion candidate of a batch entry.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    score: f64,
    log_prob: f32,
    parent: usize,
    symbol: u32,
    length: usize,
}

impl Feedback for BeamSearchFeedback {
    fn beam_width(&self) -> usize {
        self.beam_width
    }

    fn init_symbols(&self) -> (Array1<bool>, Array1<u32>) {
        let lanes = self.lanes();
        (
            Array1::from_elem(lanes, false),
            Array1::from_elem(lanes, self.start_id),
        )
    }

    fn sample_symbols(
        &self,
        logits: &Array2<f32>,
        log_probs: &Array1<f32>,
        finished: &Array1<bool>,
        lengths: &Array1<usize>,
        time: usize,
    ) -> Result<Sampled> {
        let lanes = self.lanes();
        ensure!(
            logits.nrows() == lanes,
            "expected logits for {lanes} lanes, got {}",
            logits.nrows()
        );
        ensure!(
            logits.ncols() >= self.beam_width,
            "vocabulary of {} cannot fill a beam of {}",
            logits.ncols(),
            self.beam_width
        );
        let logprobs = log_softmax(logits);

        let mut sample_ids = Vec::with_capacity(lanes);
        let mut beam_ids = Vec::with_capacity(lanes);
        let mut next_log_probs = Vec::with_capacity(lanes);
        let mut next_lengths = Vec::with_capacity(lanes);

        for b in 0..self.batch_size {
            let mut candidates: Vec<Candidate> = Vec::new();
            for k in 0..self.beam_width {
                let lane = b * self.beam_width + k;
                if time == 0 && k > 0 {
                    // all lanes of an entry are identical at the first
                    // step; expanding more than one would fill the beam
                    // with duplicates
                    continue;
                }
                if finished[lane] {
                    // a finished lane only carries itself forward: the end
                    // symbol at unchanged score and frozen length
                    candidates.push(Candidate {
                        score: self.score(log_probs[lane], lengths[lane]),
                        log_prob: log_probs[lane],
                        parent: lane,
                        symbol: self.eos_id,
                        length: lengths[lane],
                    });
                    continue;
                }
                let row = logprobs.row(lane);
                for (symbol, &lp) in row.iter().enumerate() {
                    let log_prob = log_probs[lane] + lp;
                    let length = lengths[lane] + 1;
                    candidates.push(Candidate {
                        score: self.score(log_prob, length),
                        log_prob,
                        parent: lane,
                        symbol: symbol as u32,
                        length,
                    });
                }
            }
            candidates.sort_by(|x, y| y.score.partial_cmp(&x.score).unwrap_or(Ordering::Equal));
            ensure!(
                candidates.len() >= self.beam_width,
                "only {} candidates for a beam of {}",
                candidates.len(),
                self.beam_width
            );
            for c in candidates.iter().take(self.beam_width) {
                sample_ids.push(c.symbol);
                beam_ids.push(c.parent);
                next_log_probs.push(c.log_prob);
                next_lengths.push(c.length);
            }
        }

        Ok(Sampled {
            sample_ids: Array1::from_vec(sample_ids),
            beam_ids,
            log_probs: Array1::from_vec(next_log_probs),
            lengths: Array1::from_vec(next_lengths),
        })
    }

    fn next_symbols(
        &self,
        time: usize,
        sample_ids: Option<&Array1<u32>>,
    ) -> (Array1<bool>, Array1<u32>) {
        match sample_ids {
            Some(ids) => {
                let force = time + 1 >= self.max_length;
                (ids.mapv(|id| force || id == self.eos_id), ids.clone())
            }
            None => {
                let lanes = self.lanes();
                (
                    Array1::from_elem(lanes, true),
                    Array1::from_elem(lanes, self.start_id),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    fn zeros(n: usize) -> Array1<f32> {
        Array1::zeros(n)
    }

    #[test]
    fn first_step_expands_one_lane_per_entry() {
        let feedback = BeamSearchFeedback::new(1, 2, 0, 3, 10).unwrap();
        // both lanes carry identical logits, as after a tiled first step
        let logits = array![[0.0, 3.0, 2.0, 1.0], [0.0, 3.0, 2.0, 1.0]];
        let sampled = feedback
            .sample_symbols(
                &logits,
                &zeros(2),
                &array![false, false],
                &array![0, 0],
                0,
            )
            .unwrap();
        // top-2 symbols of the single expanded lane, not one symbol twice
        assert_eq!(sampled.sample_ids, array![1, 2]);
        assert_eq!(sampled.beam_ids, vec![0, 0]);
        assert_eq!(sampled.lengths, array![1, 1]);
        assert!(sampled.log_probs[0] > sampled.log_probs[1]);
    }

    #[test]
    fn later_steps_expand_all_lanes() {
        let feedback = BeamSearchFeedback::new(1, 2, 0, 3, 10).unwrap();
        // lane 1 holds the better continuation
        let logits = array![[0.0, 0.0, 0.0, 0.0], [0.0, 9.0, 0.0, 0.0]];
        let sampled = feedback
            .sample_symbols(
                &logits,
                &array![-1.0, -1.0],
                &array![false, false],
                &array![1, 1],
                1,
            )
            .unwrap();
        assert_eq!(sampled.beam_ids[0], 1);
        assert_eq!(sampled.sample_ids[0], 1);
    }

    #[test]
    fn finished_lane_carries_eos_at_unchanged_score() {
        let feedback = BeamSearchFeedback::new(1, 2, 0, 3, 10).unwrap();
        let logits = array![[0.0, 0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 0.0]];
        let sampled = feedback
            .sample_symbols(
                &logits,
                &array![-10.0, -0.5],
                &array![false, true],
                &array![4, 2],
                3,
            )
            .unwrap();
        // the finished lane outranks every fresh expansion of lane 0
        assert_eq!(sampled.sample_ids[0], 3);
        assert_eq!(sampled.beam_ids[0], 1);
        assert_eq!(sampled.log_probs[0], -0.5);
        assert_eq!(sampled.lengths[0], 2);
    }

    #[test]
    fn negative_infinity_candidates_are_pruned_not_faulted() {
        let feedback = BeamSearchFeedback::new(1, 2, 0, 3, 10).unwrap();
        let inf = f32::NEG_INFINITY;
        let logits = array![[0.0, 1.0, inf, inf], [0.0, 1.0, inf, inf]];
        let sampled = feedback
            .sample_symbols(
                &logits,
                &zeros(2),
                &array![false, false],
                &array![1, 1],
                1,
            )
            .unwrap();
        assert!(sampled.sample_ids.iter().all(|&id| id < 2));
    }

    #[test]
    fn raw_log_probs_survive_length_penalty_ranking() {
        let plain = BeamSearchFeedback::new(1, 1, 0, 3, 10).unwrap();
        let penalized = BeamSearchFeedback::new(1, 1, 0, 3, 10)
            .unwrap()
            .with_length_penalty(1.0);
        let logits = array![[0.0, 2.0, 1.0]];
        let a = plain
            .sample_symbols(&logits, &zeros(1), &array![false], &array![5], 5)
            .unwrap();
        let b = penalized
            .sample_symbols(&logits, &zeros(1), &array![false], &array![5], 5)
            .unwrap();
        assert_eq!(a.log_probs, b.log_probs);
    }

    #[test]
    fn max_length_forces_finish() {
        let feedback = BeamSearchFeedback::new(1, 2, 0, 3, 4).unwrap();
        let ids = array![1, 2];
        let (finished, _) = feedback.next_symbols(2, Some(&ids));
        assert!(!finished.iter().any(|&f| f));
        let (finished, _) = feedback.next_symbols(3, Some(&ids));
        assert!(finished.iter().all(|&f| f));
    }

    #[test]
    fn rejects_vocabulary_smaller_than_beam() {
        let feedback = BeamSearchFeedback::new(1, 3, 0, 1, 10).unwrap();
        let logits = array![[0.0, 1.0], [0.0, 1.0], [0.0, 1.0]];
        assert!(feedback
            .sample_symbols(
                &logits,
                &zeros(3),
                &array![false, false, false],
                &array![0, 0, 0],
                0,
            )
            .is_err());
    }
}
