//! The tutorflow response pipeline.
//!
//! [`TurnPipeline::run_turn`] takes one user utterance through the whole
//! path: the [`router`] picks a responder, its answer streams through
//! sentence extraction into progressive synthesis, the [`validation`] gate
//! approves or regenerates it, and [`delivery`] emits the ordered event
//! sequence before the session's router state is advanced.

pub mod background;
pub mod delivery;
pub mod metrics;
pub mod policy;
pub mod router;
pub mod session_lock;
pub mod setup;
pub mod turn;
pub mod validation;

pub use turn::{PipelineComponents, TurnError, TurnPipeline};
