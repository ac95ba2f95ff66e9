//! Pipeline error types.
//!
//! One enum per component concern, collected under [`PipelineError`]. The
//! core performs no retries: apart from the two one-step fallbacks inside
//! allocation and framebuffer import, every error here is fatal and
//! terminates the frame loop.

use std::io;

use thiserror::Error;

/// Failures while resolving KMS display objects.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("no connected display connector found")]
    NoDisplayFound,

    #[error("connector reports no usable display mode")]
    NoModeFound,

    #[error("no CRTC available for the selected connector")]
    NoCrtcFound,

    #[error("no scanout-capable plane matches the selected CRTC")]
    NoSuitablePlane,

    #[error("atomic modesetting is not supported by this device: {0}")]
    AtomicUnsupported(#[source] io::Error),

    #[error("{what}: {source}")]
    Os {
        what: &'static str,
        #[source]
        source: io::Error,
    },
}

/// Failures while creating GPU pixel buffers.
#[derive(Debug, Error)]
pub enum AllocError {
    #[error("storage-layout modifiers were requested but the allocator cannot honor them")]
    ModifierUnsupported,

    #[error("buffer creation returned no buffer: {0}")]
    AllocationFailed(#[source] io::Error),
}

/// Failures while importing buffers into the GPU or display pipelines.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("required GPU capability {0} is unavailable")]
    MissingCapability(&'static str),

    #[error("zero-copy image import from dma-buf failed")]
    ImageImportFailed,

    #[error("could not export buffer as dma-buf: {0}")]
    BufferExportFailed(#[source] io::Error),

    #[error("kernel framebuffer creation failed after single-plane fallback: {0}")]
    FramebufferCreateFailed(#[source] io::Error),

    #[error("offscreen render target is incomplete (status {0:#x})")]
    FramebufferIncomplete(u32),

    #[error("GL object creation failed: {0}")]
    GlObjectCreate(String),
}

/// Failures while applying a buffer to the display.
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("display object has no property named {name:?}")]
    UnknownProperty { name: &'static str },

    #[error("kernel rejected the commit: {0}")]
    Rejected(#[source] io::Error),

    #[error("waiting for page-flip completion failed: {0}")]
    EventWait(#[source] io::Error),
}

/// OS- and GPU-level failures outside the KMS object model.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("{what}: {source}")]
    Os {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{what}: {source}")]
    Egl {
        what: &'static str,
        #[source]
        source: khronos_egl::Error,
    },

    #[error("could not load libEGL: {0}")]
    EglLoad(String),

    #[error("{0}")]
    Gpu(String),
}

/// Any fatal pipeline failure.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("display discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("buffer allocation failed: {0}")]
    Allocation(#[from] AllocError),

    #[error("buffer import failed: {0}")]
    Import(#[from] ImportError),

    #[error("display commit failed: {0}")]
    Commit(#[from] CommitError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// Result type for pipeline operations.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
