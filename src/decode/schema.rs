use anyhow::{bail, Result};
use ndarray::Array2;

use super::DecodeMode;

/// Declares the named fields a decoder emits at every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputSchema {
    fields: Vec<&'static str>,
}

impl OutputSchema {
    pub fn new(fields: &[&'static str]) -> Self {
        Self {
            fields: fields.to_vec(),
        }
    }

    pub fn fields(&self) -> &[&'static str] {
        &self.fields
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.iter().any(|f| *f == name)
    }
}

/// One decoding step's output record: named per-lane matrices, in schema
/// order.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    fields: Vec<(&'static str, Array2<f32>)>,
}

impl StepOutput {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn with_field(mut self, name: &'static str, values: Array2<f32>) -> Self {
        self.push(name, values);
        self
    }

    pub fn push(&mut self, name: &'static str, values: Array2<f32>) {
        self.fields.push((name, values));
    }

    pub fn get(&self, name: &str) -> Option<&Array2<f32>> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Array2<f32>)> + '_ {
        self.fields.iter().map(|(n, v)| (*n, v))
    }

    pub fn into_pairs(self) -> Vec<(&'static str, Array2<f32>)> {
        self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Precomputed set of output fields that survive into the accumulation
/// buffers.
///
/// Ignored fields are dropped only during inference; training and
/// evaluation keep the full record for the loss computation. The retained
/// set is derived once per decode call, not per step.
#[derive(Debug, Clone)]
pub struct OutputFilter {
    retained: Vec<&'static str>,
}

impl OutputFilter {
    pub fn new(mode: DecodeMode, schema: &OutputSchema, ignore: &[&'static str]) -> Self {
        let retained = if mode.is_infer() {
            retain_fields(schema.fields(), ignore)
        } else {
            schema.fields().to_vec()
        };
        Self { retained }
    }

    pub fn retained(&self) -> &[&'static str] {
        &self.retained
    }

    /// Filters one step record down to the retained fields. A missing
    /// retained field is a contract violation on the decoder's side.
    pub fn apply(&self, output: &StepOutput) -> Result<StepOutput> {
        let mut kept = StepOutput::new();
        for &name in &self.retained {
            match output.get(name) {
                Some(values) => kept.push(name, values.clone()),
                None => bail!("decoder output is missing declared field `{name}`"),
            }
        }
        Ok(kept)
    }
}

/// The retained subset: declared fields minus the ignore list, in
/// declaration order.
fn retain_fields(fields: &[&'static str], ignore: &[&'static str]) -> Vec<&'static str> {
    fields
        .iter()
        .copied()
        .filter(|f| !ignore.contains(f))
        .collect()
}

#[cfg(test)]
mod tests {
    use ndarray::array;

    use super::*;

    #[test]
    fn retained_set_drops_ignored_fields() {
        let schema = OutputSchema::new(&["hidden", "attention", "context"]);
        let filter = OutputFilter::new(DecodeMode::Infer, &schema, &["attention"]);
        assert_eq!(filter.retained(), &["hidden", "context"]);
    }

    #[test]
    fn retained_set_is_idempotent() {
        let once = retain_fields(&["hidden", "attention", "context"], &["attention"]);
        let twice = retain_fields(&once, &["attention"]);
        assert_eq!(once, twice);
    }

    #[test]
    fn training_keeps_ignored_fields() {
        let schema = OutputSchema::new(&["hidden", "attention"]);
        let filter = OutputFilter::new(DecodeMode::Train, &schema, &["attention"]);
        assert_eq!(filter.retained(), schema.fields());
    }

    #[test]
    fn apply_keeps_retained_values() {
        let schema = OutputSchema::new(&["hidden", "attention"]);
        let filter = OutputFilter::new(DecodeMode::Infer, &schema, &["attention"]);
        let record = StepOutput::new()
            .with_field("hidden", array![[1.0, 2.0]])
            .with_field("attention", array![[0.5]]);

        let kept = filter.apply(&record).unwrap();
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.get("hidden"), record.get("hidden"));
        assert!(kept.get("attention").is_none());
    }

    #[test]
    fn apply_rejects_missing_field() {
        let schema = OutputSchema::new(&["hidden", "attention"]);
        let filter = OutputFilter::new(DecodeMode::Infer, &schema, &[]);
        let record = StepOutput::new().with_field("hidden", array![[1.0]]);

        let err = filter.apply(&record).unwrap_err();
        assert!(err.to_string().contains("attention"));
    }
}
