//! Signal-specific worker implementations. Only traces carry verification
//! semantics today; the worker capability admits logs and metrics variants.

pub mod traces;

pub use traces::TracesWorker;
