use anyhow::{ensure, Result};
use ndarray::{Array1, Array2};

use super::Feedback;

/// Feeds gold target symbols regardless of model predictions, for
/// training and evaluation.
///
/// `targets` is batch-major with the start symbol in column 0; a lane is
/// finished once its gold sequence is exhausted, which is what terminates
/// the loop after exactly one step per target position.
#[derive(Debug)]
pub struct TeacherForcingFeedback {
    targets: Array2<u32>,
    lengths: Array1<usize>,
}

impl TeacherForcingFeedback {
    pub fn new(targets: Array2<u32>) -> Self {
        let steps = targets.ncols();
        let lengths = Array1::from_elem(targets.nrows(), steps);
        Self { targets, lengths }
    }

    /// Per-sequence lengths, for batches padded to a common width.
    pub fn with_lengths(targets: Array2<u32>, lengths: Array1<usize>) -> Result<Self> {
        ensure!(
            lengths.len() == targets.nrows(),
            "{} lengths for {} target sequences",
            lengths.len(),
            targets.nrows()
        );
        for &len in &lengths {
            ensure!(
                len <= targets.ncols(),
                "sequence length {len} exceeds target width {}",
                targets.ncols()
            );
        }
        Ok(Self { targets, lengths })
    }
}

impl Feedback for TeacherForcingFeedback {
    fn init_symbols(&self) -> (Array1<bool>, Array1<u32>) {
        let finished = self.lengths.mapv(|len| len == 0);
        let symbols = if self.targets.ncols() == 0 {
            Array1::zeros(self.targets.nrows())
        } else {
            self.targets.column(0).to_owned()
        };
        (finished, symbols)
    }

    fn next_symbols(
        &self,
        time: usize,
        _sample_ids: Option<&Array1<u32>>,
    ) -> (Array1<bool>, Array1<u32>) {
        let next = time + 1;
        let finished = self.lengths.mapv(|len| next >= len);
        let symbols = Array1::from_shape_fn(self.targets.nrows(), |b| {
            if next < self.lengths[b] {
                self.targets[[b, next]]
            } else {
                0
            }
        });
        (finished, symbols)
    }
}
