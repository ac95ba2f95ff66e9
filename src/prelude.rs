//! Common imports for pipeline consumers.

pub use crate::config::{ModeRequest, Options};
pub use crate::core::errors::{PipelineError, Result};
pub use crate::core::frame::{FrameBudget, FrameLoop, LoopExit};
pub use crate::core::perf::{NullSampler, PerfSampler};
pub use crate::core::producer::{ColorSweep, FrameProducer};
pub use crate::device::Card;
