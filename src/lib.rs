//! Autoregressive sequence decoding for neural machine translation.
//!
//! The crate provides the mode-agnostic decoding loop ([`dynamic_decode`]),
//! beam-search bookkeeping, and the collaborator contracts that concrete
//! architectures plug into: transition ([`Decoder`]), symbol feedback
//! ([`Feedback`]) and symbol/vector modality ([`Modality`]).

pub mod decode;
pub mod feedback;
pub mod modality;

pub use decode::{
    dynamic_decode, finalize_hypotheses, BeamStep, BeamTrace, DecodeMode, DecodeOptions,
    DecodeStatus, DecodeTask, DecodedOutput, Decoder, LaneMap, MaxLikelihoodRanker, OutputFilter,
    OutputSchema, SequenceRanker, StepBuffer, StepOutput,
};
pub use feedback::{BeamSearchFeedback, Feedback, GreedyFeedback, Sampled, TeacherForcingFeedback};
pub use modality::Modality;
