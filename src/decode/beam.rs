use anyhow::{ensure, Result};
use ndarray::{Array1, Array2, Array3, Axis};

use super::buffer::stack_rows;

/// Per-lane carried state that the loop can replicate across beam lanes
/// and reorder by parent index.
///
/// Lane order is batch-major: after `tile(beam)`, lane `b * beam + k`
/// holds beam `k` of batch entry `b`.
pub trait LaneMap: Sized {
    /// Replicates every lane `beam` times, keeping replicas adjacent.
    fn tile(&self, beam: usize) -> Self;

    /// Reorders lanes so that output lane `i` holds input lane `ids[i]`.
    /// Callers must have validated `ids`; see [`reorder`].
    fn gather(&self, ids: &[usize]) -> Self;
}

macro_rules! lane_map_array {
    ($ty:ty) => {
        impl<A: Clone> LaneMap for $ty {
            fn tile(&self, beam: usize) -> Self {
                let ids: Vec<usize> = (0..self.len_of(Axis(0)))
                    .flat_map(|i| std::iter::repeat(i).take(beam))
                    .collect();
                self.select(Axis(0), &ids)
            }

            fn gather(&self, ids: &[usize]) -> Self {
                self.select(Axis(0), ids)
            }
        }
    };
}

lane_map_array!(Array1<A>);
lane_map_array!(Array2<A>);
lane_map_array!(Array3<A>);

impl LaneMap for () {
    fn tile(&self, _beam: usize) -> Self {}

    fn gather(&self, _ids: &[usize]) -> Self {}
}

impl<T: LaneMap> LaneMap for Option<T> {
    fn tile(&self, beam: usize) -> Self {
        self.as_ref().map(|v| v.tile(beam))
    }

    fn gather(&self, ids: &[usize]) -> Self {
        self.as_ref().map(|v| v.gather(ids))
    }
}

impl<T: LaneMap> LaneMap for Vec<T> {
    fn tile(&self, beam: usize) -> Self {
        self.iter().map(|v| v.tile(beam)).collect()
    }

    fn gather(&self, ids: &[usize]) -> Self {
        self.iter().map(|v| v.gather(ids)).collect()
    }
}

impl<T: LaneMap, U: LaneMap> LaneMap for (T, U) {
    fn tile(&self, beam: usize) -> Self {
        (self.0.tile(beam), self.1.tile(beam))
    }

    fn gather(&self, ids: &[usize]) -> Self {
        (self.0.gather(ids), self.1.gather(ids))
    }
}

impl<T: LaneMap, U: LaneMap, V: LaneMap> LaneMap for (T, U, V) {
    fn tile(&self, beam: usize) -> Self {
        (self.0.tile(beam), self.1.tile(beam), self.2.tile(beam))
    }

    fn gather(&self, ids: &[usize]) -> Self {
        (self.0.gather(ids), self.1.gather(ids), self.2.gather(ids))
    }
}

/// Validates parent beam indices, then reorders `state` to follow them.
///
/// Consumes the old state and produces a fresh one; lanes are never
/// mutated in place. An index outside the previous step's lane set is a
/// feedback contract violation and fails the decode.
pub fn reorder<T: LaneMap>(state: T, beam_ids: &[usize], lanes: usize) -> Result<T> {
    ensure!(
        beam_ids.len() == lanes,
        "expected {lanes} parent beam indices, feedback produced {}",
        beam_ids.len()
    );
    for &id in beam_ids {
        ensure!(id < lanes, "parent beam index {id} out of range for {lanes} lanes");
    }
    Ok(state.gather(beam_ids))
}

/// Beam bookkeeping for one time step.
#[derive(Debug, Clone)]
pub struct BeamStep {
    /// Cumulative log-probability per lane after this step.
    pub log_probs: Array1<f32>,
    /// Symbol chosen for each lane at this step.
    pub predicted_ids: Array1<u32>,
    /// Previous-step lane each current lane descends from.
    pub beam_ids: Array1<usize>,
    /// Symbols emitted per lane so far, frozen once a lane finishes.
    pub lengths: Array1<usize>,
}

/// The stacked beam-search record of a whole decode, time-major.
#[derive(Debug, Clone)]
pub struct BeamTrace {
    pub log_probs: Array2<f32>,
    pub predicted_ids: Array2<u32>,
    pub beam_ids: Array2<usize>,
    pub lengths: Array2<usize>,
}

impl BeamTrace {
    pub(crate) fn from_steps(steps: Vec<BeamStep>) -> Result<Self> {
        let log_probs: Vec<_> = steps.iter().map(|s| s.log_probs.clone()).collect();
        let predicted_ids: Vec<_> = steps.iter().map(|s| s.predicted_ids.clone()).collect();
        let beam_ids: Vec<_> = steps.iter().map(|s| s.beam_ids.clone()).collect();
        let lengths: Vec<_> = steps.iter().map(|s| s.lengths.clone()).collect();
        Ok(Self {
            log_probs: stack_rows(&log_probs)?,
            predicted_ids: stack_rows(&predicted_ids)?,
            beam_ids: stack_rows(&beam_ids)?,
            lengths: stack_rows(&lengths)?,
        })
    }

    /// Number of executed time steps.
    pub fn steps(&self) -> usize {
        self.log_probs.nrows()
    }

    /// Number of lanes (batch size × beam width).
    pub fn lanes(&self) -> usize {
        self.log_probs.ncols()
    }

    /// Reconstructs the symbol sequence ending in each final lane by
    /// following parent pointers backwards through the trace.
    pub fn backtrack(&self) -> Vec<Vec<u32>> {
        let steps = self.steps();
        (0..self.lanes())
            .map(|lane| {
                let mut symbols = Vec::with_capacity(steps);
                let mut cur = lane;
                for t in (0..steps).rev() {
                    symbols.push(self.predicted_ids[[t, cur]]);
                    cur = self.beam_ids[[t, cur]];
                }
                symbols.reverse();
                symbols
            })
            .collect()
    }
}
