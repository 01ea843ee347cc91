//! Pipeline engine: the claim loop and outcome recording.

pub mod pipeline;
pub mod recorder;

pub use pipeline::Pipeline;
pub use recorder::OutcomeRecorder;
