use anyhow::{bail, Result};
use ndarray::{Array1, Array2, Array3, Axis};

/// Append-only, time-indexed accumulation slots for one decoded quantity.
///
/// Each loop iteration writes exactly one slot; slots may arrive in any
/// order, but every index below the high-water mark must be filled before
/// `finalize`. The buffer is never read mid-loop, which is what allows
/// decoding to run for a step count unknown in advance.
#[derive(Debug)]
pub struct StepBuffer<T> {
    slots: Vec<Option<T>>,
}

impl<T> StepBuffer<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Number of slots written or reserved so far.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Writes the value for one time index. Writing the same index twice is
    /// a contract violation.
    pub fn write(&mut self, time: usize, value: T) -> Result<()> {
        if time >= self.slots.len() {
            self.slots.resize_with(time + 1, || None);
        }
        if self.slots[time].is_some() {
            bail!("step buffer slot {time} written twice");
        }
        self.slots[time] = Some(value);
        Ok(())
    }

    /// Consumes the buffer, yielding the values ordered by time. A gap
    /// below the highest written index is a contract violation.
    pub fn finalize(self) -> Result<Vec<T>> {
        self.slots
            .into_iter()
            .enumerate()
            .map(|(time, slot)| match slot {
                Some(value) => Ok(value),
                None => bail!("step buffer slot {time} never written"),
            })
            .collect()
    }
}

impl<T> Default for StepBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Stacks per-step lane matrices into one time-major tensor of shape
/// (time, lanes, dim). A zero-step decode yields an empty tensor.
pub(crate) fn stack_steps(steps: &[Array2<f32>]) -> Result<Array3<f32>> {
    if steps.is_empty() {
        return Ok(Array3::zeros((0, 0, 0)));
    }
    let views: Vec<_> = steps.iter().map(|s| s.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}

/// Stacks per-step lane vectors into one time-major matrix of shape
/// (time, lanes).
pub(crate) fn stack_rows<A: Clone>(steps: &[Array1<A>]) -> Result<Array2<A>> {
    if steps.is_empty() {
        return Ok(Array2::from_shape_vec((0, 0), Vec::new())?);
    }
    let views: Vec<_> = steps.iter().map(|s| s.view()).collect();
    Ok(ndarray::stack(Axis(0), &views)?)
}
