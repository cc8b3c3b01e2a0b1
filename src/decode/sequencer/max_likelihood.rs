use ndarray::Array2;

use super::SequenceRanker;

#[derive(Debug)]
pub struct MaxLikelihoodRanker {
    pub length_penalty: Option<f64>,
}

impl SequenceRanker for MaxLikelihoodRanker {
    /// Selects the candidate with the highest log probability, normalized by
    /// either plain sequence length or Google NMT paper's length penalty
    fn rank(&self, candidates: &[Vec<Vec<u32>>], sum_logprobs: &Array2<f32>) -> Vec<usize> {
        candidates
            .iter()
            .enumerate()
            .map(|(b, group)| {
                let mut best = 0;
                let mut best_score = f64::NEG_INFINITY;
                for (k, seq) in group.iter().enumerate() {
                    let length = seq.len().max(1) as f64;
                    let penalty = match self.length_penalty {
                        // from the Google NMT paper
                        Some(p) => f64::powf((5. + length) / 6., p),
                        None => length,
                    };
                    let score = f64::from(sum_logprobs[[b, k]]) / penalty;
                    if score > best_score {
                        best_score = score;
                        best = k;
                    }
                }
                best
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn prefers_highest_normalized_score() {
        let ranker = MaxLikelihoodRanker {
            length_penalty: None,
        };
        // same raw score, shorter sequence wins once length-normalized
        let candidates = vec![vec![vec![1, 2, 3, 4], vec![1, 2]]];
        let picks = ranker.rank(&candidates, &array![[-2.0, -2.0]]);
        assert_eq!(picks, vec![1]);
    }

    #[test]
    fn length_penalty_softens_normalization() {
        let ranker = MaxLikelihoodRanker {
            length_penalty: Some(0.0),
        };
        // zero alpha means raw log probability decides
        let candidates = vec![vec![vec![1, 2, 3, 4], vec![1, 2]]];
        let picks = ranker.rank(&candidates, &array![[-1.0, -2.0]]);
        assert_eq!(picks, vec![0]);
    }

    #[test]
    fn ranks_each_group_independently() {
        let ranker = MaxLikelihoodRanker {
            length_penalty: None,
        };
        let candidates = vec![
            vec![vec![1], vec![2]],
            vec![vec![3], vec![4]],
        ];
        let picks = ranker.rank(&candidates, &array![[-1.0, -3.0], [-3.0, -1.0]]);
        assert_eq!(picks, vec![0, 1]);
    }
}
