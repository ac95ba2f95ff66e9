pub mod buffers;
pub mod commit;
pub mod display;
pub mod errors;
pub mod frame;
pub mod import;
pub mod perf;
pub mod producer;
pub mod render;

// Re-export key types
pub use commit::{CommitOutcome, CommitProtocol};
pub use display::DisplayTarget;
pub use errors::PipelineError;
pub use frame::{FrameBudget, FrameLoop, LoopExit};
pub use import::FrameBuffers;
pub use render::{EglSetup, RenderContext};
