mod samples;
mod typed;

pub use samples::{SampleBuffer, SampleFlusher};
pub use typed::{KindQueue, TypedBuffer};
