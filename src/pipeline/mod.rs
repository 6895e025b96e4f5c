//! Pipeline plumbing: stage messages, the interrupt signal, the barge-in
//! coordinator and the [`Session`] that wires every stage together.

pub mod barge_in;
pub mod interrupt;
pub mod messages;
pub mod session;

pub use barge_in::BargeInCoordinator;
pub use interrupt::{InterruptListener, InterruptSignal};
pub use messages::{AudioChunk, ControlEvent, PipelineEvent, TranscriptSegment};
pub use session::{Backends, Session};
