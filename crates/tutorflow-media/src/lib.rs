//! Sentence extraction from streamed text and progressive speech synthesis.

pub mod dispatcher;
pub mod sentence;

pub use dispatcher::{OrderedAudio, ProgressiveAborted, SynthesisDispatcher};
pub use sentence::{Extracted, SentenceExtractor};
