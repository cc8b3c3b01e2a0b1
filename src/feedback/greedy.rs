use anyhow::{ensure, Result};
use ndarray::{Array1, Array2};

use super::{log_softmax, Feedback, Sampled};

/// Argmax sampling with a single lane per sequence.
///
/// Lanes finish on the end symbol or at `max_length`, whichever comes
/// first.
#[derive(Debug)]
pub struct GreedyFeedback {
    batch_size: usize,
    start_id: u32,
    eos_id: u32,
    max_length: usize,
}

impl GreedyFeedback {
    pub fn new(batch_size: usize, start_id: u32, eos_id: u32, max_length: usize) -> Self {
        Self {
            batch_size,
            start_id,
            eos_id,
            max_length,
        }
    }
}

impl Feedback for GreedyFeedback {
    fn init_symbols(&self) -> (Array1<bool>, Array1<u32>) {
        (
            Array1::from_elem(self.batch_size, false),
            Array1::from_elem(self.batch_size, self.start_id),
        )
    }

    fn sample_symbols(
        &self,
        logits: &Array2<f32>,
        log_probs: &Array1<f32>,
        finished: &Array1<bool>,
        lengths: &Array1<usize>,
        _time: usize,
    ) -> Result<Sampled> {
        ensure!(
            logits.nrows() == self.batch_size,
            "expected logits for {} lanes, got {}",
            self.batch_size,
            logits.nrows()
        );
        let logprobs = log_softmax(logits);

        let mut sample_ids = Vec::with_capacity(self.batch_size);
        let mut next_log_probs = Vec::with_capacity(self.batch_size);
        let mut next_lengths = Vec::with_capacity(self.batch_size);
        for lane in 0..self.batch_size {
            if finished[lane] {
                // finished lanes keep emitting the end symbol at no cost
                sample_ids.push(self.eos_id);
                next_log_probs.push(log_probs[lane]);
                next_lengths.push(lengths[lane]);
                continue;
            }
            let row = logprobs.row(lane);
            let (best, best_lp) = row.iter().copied().enumerate().fold(
                (0usize, f32::NEG_INFINITY),
                |(bi, bv), (i, v)| if v > bv { (i, v) } else { (bi, bv) },
            );
            sample_ids.push(best as u32);
            next_log_probs.push(log_probs[lane] + best_lp);
            next_lengths.push(lengths[lane] + 1);
        }

        Ok(Sampled {
            sample_ids: Array1::from_vec(sample_ids),
            beam_ids: (0..self.batch_size).collect(),
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
            // greedy decoding always samples; without an outcome there is
            // nothing left to feed
            None => (
                Array1::from_elem(self.batch_size, true),
                Array1::from_elem(self.batch_size, self.start_id),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn picks_the_argmax_symbol() {
        let feedback = GreedyFeedback::new(2, 0, 3, 10);
        let logits = array![[0.0, 5.0, 0.0, 0.0], [0.0, 0.0, 0.0, 9.0]];
        let sampled = feedback
            .sample_symbols(
                &logits,
                &array![0.0, 0.0],
                &array![false, false],
                &array![0, 0],
                0,
            )
            .unwrap();
        assert_eq!(sampled.sample_ids, array![1, 3]);
        assert_eq!(sampled.beam_ids, vec![0, 1]);
        assert_eq!(sampled.lengths, array![1, 1]);
        assert!(sampled.log_probs.iter().all(|&lp| lp < 0.0));
    }

    #[test]
    fn finished_lane_is_frozen() {
        let feedback = GreedyFeedback::new(2, 0, 3, 10);
        let logits = array![[9.0, 0.0], [9.0, 0.0]];
        let sampled = feedback
            .sample_symbols(
                &logits,
                &array![-1.5, -0.5],
                &array![false, true],
                &array![4, 2],
                5,
            )
            .unwrap();
        assert_eq!(sampled.sample_ids[1], 3);
        assert_eq!(sampled.log_probs[1], -0.5);
        assert_eq!(sampled.lengths[1], 2);
        assert_eq!(sampled.lengths[0], 5);
    }

    #[test]
    fn max_length_forces_finish() {
        let feedback = GreedyFeedback::new(1, 0, 3, 4);
        let ids = array![1];
        let (finished, _) = feedback.next_symbols(2, Some(&ids));
        assert_eq!(finished, array![false]);
        let (finished, _) = feedback.next_symbols(3, Some(&ids));
        assert_eq!(finished, array![true]);
    }
}
