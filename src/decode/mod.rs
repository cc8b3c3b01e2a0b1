use anyhow::{ensure, Context, Result};
use ndarray::{Array1, Array2, Array3};
use tracing::{debug, trace};

use crate::feedback::Feedback;
use crate::modality::Modality;

mod beam;
mod buffer;
mod schema;
mod sequencer;

pub use beam::{reorder, BeamStep, BeamTrace, LaneMap};
pub use buffer::StepBuffer;
pub use schema::{OutputFilter, OutputSchema, StepOutput};
pub use sequencer::{finalize_hypotheses, MaxLikelihoodRanker, SequenceRanker};

/// Execution mode of the decoding loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Train,
    Eval,
    Infer,
}

impl DecodeMode {
    pub fn is_infer(self) -> bool {
        matches!(self, DecodeMode::Infer)
    }
}

/// Loop execution knobs.
#[derive(Debug, Clone, Copy)]
pub struct DecodeOptions {
    pub mode: DecodeMode,
    /// Step-parallelism hint. Performance pass-through with no effect on
    /// results; kept for parity with graph-executed decoders.
    pub parallel_iterations: usize,
    /// Trade device memory for speed on very long sequences. Performance
    /// pass-through with no effect on results.
    pub swap_memory: bool,
}

impl DecodeOptions {
    pub fn new(mode: DecodeMode) -> Self {
        Self {
            mode,
            parallel_iterations: 32,
            swap_memory: false,
        }
    }
}

/// Architecture-specific transition function driven by the decoding loop.
///
/// The loop owns the state between steps: `step` consumes the previous
/// state and must produce a replacement rather than mutate shared
/// structure, and no implementation may retain the state beyond the step
/// it receives it for.
pub trait Decoder {
    /// Encoded source representation, as produced by the encoder.
    type Encoded;
    /// Encoder-to-decoder state initialization.
    type Bridge;
    /// Hidden state carried across steps, laid out lane-major.
    type State: LaneMap;
    /// Side context computed once by `prepare`, read-only afterwards.
    type Params: LaneMap;

    /// Declares the named fields of every step's output record.
    fn output_schema(&self) -> OutputSchema;

    /// Output fields that inference drops before accumulation, to save
    /// memory.
    fn output_ignore_fields(&self) -> &'static [&'static str] {
        &[]
    }

    /// Computes the initial state and the read-only decoding params.
    fn prepare(
        &self,
        encoded: &Self::Encoded,
        bridge: &Self::Bridge,
        feedback: &dyn Feedback,
    ) -> Result<(Self::State, Self::Params)>;

    /// Runs one decoding step: consumes the inputs embedded for this time
    /// and the previous state, produces this step's output record and the
    /// next state.
    fn step(
        &self,
        input: &Array2<f32>,
        state: Self::State,
        params: &Self::Params,
    ) -> Result<(StepOutput, Self::State)>;

    /// Merges decoder top-layer features into the matrix the modality
    /// projects onto the vocabulary.
    fn merge_top_features(&self, output: &StepOutput) -> Result<Array2<f32>>;

    /// Hook applied to the input matrix right before `step`.
    fn preprocess_input(&self, _time: usize, input: Array2<f32>) -> Array2<f32> {
        input
    }

    /// Hook applied to freshly embedded inputs before they enter the next
    /// step. `prev` is the previous step's input in post-reorder lane
    /// order, `None` ahead of the first step.
    fn postprocess_input(&self, _prev: Option<&Array2<f32>>, input: Array2<f32>) -> Array2<f32> {
        input
    }
}

/// Finalized decoder outputs: one time-major tensor per retained field,
/// shape (time, lanes, dim).
#[derive(Debug)]
pub struct DecodedOutput {
    fields: Vec<(&'static str, Array3<f32>)>,
}

impl DecodedOutput {
    pub fn get(&self, name: &str) -> Option<&Array3<f32>> {
        self.fields.iter().find(|(n, _)| *n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.fields.iter().map(|(n, _)| *n)
    }

    /// Number of executed time steps, as recorded by the first field.
    pub fn steps(&self) -> usize {
        self.fields.first().map_or(0, |(_, v)| v.shape()[0])
    }

    pub fn into_pairs(self) -> Vec<(&'static str, Array3<f32>)> {
        self.fields
    }
}

/// Mode-dependent companion result of a decode.
#[derive(Debug)]
pub enum DecodeStatus {
    /// Per-step vocabulary logits, shape (time, lanes, vocab).
    /// Train/eval only.
    Logits(Array3<f32>),
    /// Stacked beam-search bookkeeping. Inference only.
    Beam(BeamTrace),
}

/// A reusable decoding entry point borrowing the decoder.
#[derive(Debug)]
pub struct DecodeTask<'a, D> {
    decoder: &'a D,
    options: DecodeOptions,
}

impl<'a, D: Decoder> DecodeTask<'a, D> {
    pub fn new(decoder: &'a D, options: DecodeOptions) -> Self {
        Self { decoder, options }
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    /// Decodes one batch. See [`dynamic_decode`].
    pub fn run(
        &self,
        encoded: &D::Encoded,
        bridge: &D::Bridge,
        feedback: &dyn Feedback,
        modality: &dyn Modality,
    ) -> Result<(DecodedOutput, DecodeStatus)> {
        dynamic_decode(self.decoder, self.options, encoded, bridge, feedback, modality)
    }
}

/// Projects one step's output record to vocabulary logits.
fn compute_logits<D: Decoder>(
    decoder: &D,
    modality: &dyn Modality,
    output: &StepOutput,
) -> Result<Array2<f32>> {
    let features = decoder
        .merge_top_features(output)
        .context("merging decoder top features")?;
    modality
        .project(&features)
        .context("projecting features to logits")
}

/// Runs the decoding loop: `prepare` once, then `step` repeatedly until
/// every lane is finished.
///
/// In TRAIN/EVAL mode the feedback supplies teacher-forced inputs, beam
/// logic stays off and the status carries the per-step logits. In INFER
/// mode the feedback samples symbols and parent beams each step and the
/// status carries the stacked beam trace.
///
/// Termination is the feedback's obligation: the loop itself imposes no
/// step cap, so an inference policy must eventually report every lane
/// finished (for open-ended decoding, via a maximum-length force-finish).
pub fn dynamic_decode<D: Decoder>(
    decoder: &D,
    options: DecodeOptions,
    encoded: &D::Encoded,
    bridge: &D::Bridge,
    feedback: &dyn Feedback,
    modality: &dyn Modality,
) -> Result<(DecodedOutput, DecodeStatus)> {
    let infer = options.mode.is_infer();
    let schema = decoder.output_schema();
    let filter = OutputFilter::new(options.mode, &schema, decoder.output_ignore_fields());

    let (mut finished, start_symbols) = feedback.init_symbols();
    let lanes = finished.len();
    ensure!(
        start_symbols.len() == lanes,
        "feedback produced {} start symbols for {lanes} lanes",
        start_symbols.len()
    );
    if infer {
        ensure!(
            feedback.beam_width() > 0 && lanes % feedback.beam_width() == 0,
            "lane count {lanes} does not match beam width {}",
            feedback.beam_width()
        );
    }
    debug!(
        "decoding {} lanes (mode {:?}, beam width {})",
        lanes,
        options.mode,
        feedback.beam_width()
    );

    let embedded = modality
        .embed(&start_symbols, 0)
        .context("embedding start symbols")?;
    ensure_lanes(&embedded, lanes, "embedded start symbols")?;
    let mut inputs = decoder.postprocess_input(None, embedded);

    let (state, params) = decoder
        .prepare(encoded, bridge, feedback)
        .context("preparing decoder state")?;
    let (mut state, params) = if infer {
        (
            state.tile(feedback.beam_width()),
            params.tile(feedback.beam_width()),
        )
    } else {
        (state, params)
    };

    let mut output_buffers: Vec<(&'static str, StepBuffer<Array2<f32>>)> = filter
        .retained()
        .iter()
        .map(|name| (*name, StepBuffer::new()))
        .collect();
    let mut status_buffer: StepBuffer<BeamStep> = StepBuffer::new();
    let mut logits_buffer: StepBuffer<Array2<f32>> = StepBuffer::new();

    let mut log_probs = Array1::<f32>::zeros(lanes);
    let mut lengths = Array1::<usize>::zeros(lanes);
    let mut time = 0usize;

    while !finished.iter().all(|&f| f) {
        let step_inputs = decoder.preprocess_input(time, inputs);
        let (record, new_state) = decoder
            .step(&step_inputs, state, &params)
            .with_context(|| format!("decoder step at time {time}"))?;
        check_record(&schema, &record, lanes)?;

        let kept = filter.apply(&record)?;
        for ((_, buf), (name, values)) in output_buffers.iter_mut().zip(kept.into_pairs()) {
            buf.write(time, values)
                .with_context(|| format!("recording output field `{name}`"))?;
        }

        let mut prev_inputs = step_inputs;
        let mut next_state = new_state;
        let mut sample_ids = None;

        if infer {
            let logits = compute_logits(decoder, modality, &record)?;
            ensure_lanes(&logits, lanes, "logits")?;
            let sampled = feedback
                .sample_symbols(&logits, &log_probs, &finished, &lengths, time)
                .with_context(|| format!("sampling symbols at time {time}"))?;
            ensure!(
                sampled.sample_ids.len() == lanes
                    && sampled.log_probs.len() == lanes
                    && sampled.lengths.len() == lanes,
                "feedback changed the lane count at time {time}"
            );
            next_state = reorder(next_state, &sampled.beam_ids, lanes)?;
            prev_inputs = reorder(prev_inputs, &sampled.beam_ids, lanes)?;
            status_buffer.write(
                time,
                BeamStep {
                    log_probs: sampled.log_probs.clone(),
                    predicted_ids: sampled.sample_ids.clone(),
                    beam_ids: Array1::from_vec(sampled.beam_ids.clone()),
                    lengths: sampled.lengths.clone(),
                },
            )?;
            log_probs = sampled.log_probs;
            lengths = sampled.lengths;
            sample_ids = Some(sampled.sample_ids);
        } else {
            let logits = compute_logits(decoder, modality, &record)?;
            ensure_lanes(&logits, lanes, "logits")?;
            logits_buffer.write(time, logits)?;
        }

        let (new_finished, next_symbols) = feedback.next_symbols(time, sample_ids.as_ref());
        ensure!(
            new_finished.len() == lanes && next_symbols.len() == lanes,
            "feedback changed the lane count at time {time}"
        );
        let embedded = modality
            .embed(&next_symbols, time + 1)
            .with_context(|| format!("embedding symbols for time {}", time + 1))?;
        ensure_lanes(&embedded, lanes, "embedded symbols")?;
        let next_inputs = decoder.postprocess_input(Some(&prev_inputs), embedded);

        // finished is monotonic: a lane never reopens
        finished = Array1::from_shape_fn(lanes, |i| finished[i] || new_finished[i]);
        inputs = next_inputs;
        state = next_state;
        time += 1;
        trace!(
            "step {time} done, {}/{lanes} lanes finished",
            finished.iter().filter(|&&f| f).count()
        );
    }

    debug!("decode finished after {time} steps");

    let mut fields = Vec::with_capacity(output_buffers.len());
    for (name, buf) in output_buffers {
        let steps = buf
            .finalize()
            .with_context(|| format!("finalizing output field `{name}`"))?;
        fields.push((name, buffer::stack_steps(&steps)?));
    }
    let outputs = DecodedOutput { fields };

    let status = if infer {
        DecodeStatus::Beam(BeamTrace::from_steps(status_buffer.finalize()?)?)
    } else {
        DecodeStatus::Logits(buffer::stack_steps(&logits_buffer.finalize()?)?)
    };

    Ok((outputs, status))
}

fn ensure_lanes(values: &Array2<f32>, lanes: usize, what: &str) -> Result<()> {
    ensure!(
        values.nrows() == lanes,
        "{what}: expected {lanes} lanes, got {}",
        values.nrows()
    );
    Ok(())
}

fn check_record(schema: &OutputSchema, record: &StepOutput, lanes: usize) -> Result<()> {
    ensure!(
        record.len() == schema.fields().len(),
        "decoder produced {} output fields, schema declares {}",
        record.len(),
        schema.fields().len()
    );
    for (name, values) in record.iter() {
        ensure!(
            schema.contains(name),
            "decoder produced undeclared output field `{name}`"
        );
        ensure!(
            values.nrows() == lanes,
            "output field `{name}`: expected {lanes} lanes, got {}",
            values.nrows()
        );
    }
    Ok(())
}
