//! GPU pixel buffer allocation.
//!
//! Two shapes, chosen once at setup: a GBM swap-chain surface the renderer
//! presents into, or a fixed pool of buffer objects for the surfaceless
//! path. Allocation is modifier-qualified when a negotiated layout set
//! exists; the only fallback is the single step down to plain creation,
//! and that step is refused when it would silently discard a non-linear
//! layout the caller asked for.

use drm_fourcc::{DrmFourcc, DrmModifier};
use gbm::{BufferObject, BufferObjectFlags, Surface};
use tracing::{debug, warn};

use crate::core::errors::AllocError;
use crate::core::import::ImportedFramebuffer;
use crate::device::Card;

/// Number of buffers in the surfaceless pool.
pub const POOL_SIZE: usize = 2;

/// Buffers created by the allocator, before import.
pub enum Allocation {
    /// Swap-chain surface; buffers are owned by GBM's internal ring and
    /// surface here only through lock/release.
    Swapchain(Surface<ImportedFramebuffer>),
    /// Fixed pool owned by this process for its lifetime.
    Pool(Vec<BufferObject<()>>),
}

impl Allocation {
    /// Raw GBM surface pointer for EGL window-surface creation; `None` on
    /// the surfaceless path.
    pub fn surface_ptr(&self) -> Option<*mut std::ffi::c_void> {
        use gbm::AsRaw;
        match self {
            Allocation::Swapchain(surface) => Some(surface.as_raw() as *mut _),
            Allocation::Pool(_) => None,
        }
    }
}

/// Pool slot for frame `frame`: fixed modulo-N rotation.
pub(crate) fn slot_for_frame(frame: u64, pool_len: usize) -> usize {
    (frame % pool_len as u64) as usize
}

/// The modifier list a creation attempt will carry: a forced modifier wins
/// outright, otherwise the negotiated set is passed whole.
pub fn modifier_candidates(
    forced: Option<DrmModifier>,
    negotiated: &[DrmModifier],
) -> Vec<DrmModifier> {
    match forced {
        Some(modifier) => vec![modifier],
        None => negotiated.to_vec(),
    }
}

/// Whether plain (modifier-free) creation may stand in after the
/// modifier-qualified attempt was rejected. Substituting linear for an
/// explicitly non-linear layout is never allowed.
pub(crate) fn fallback_allowed(candidates: &[DrmModifier]) -> bool {
    candidates
        .first()
        .is_none_or(|&m| m == DrmModifier::Linear)
}

const USAGE: BufferObjectFlags = BufferObjectFlags::SCANOUT.union(BufferObjectFlags::RENDERING);

/// Create the frame buffers for this run.
pub fn allocate(
    gbm: &gbm::Device<Card>,
    width: u32,
    height: u32,
    format: DrmFourcc,
    candidates: &[DrmModifier],
    surfaceless: bool,
) -> Result<Allocation, AllocError> {
    if surfaceless {
        let mut pool = Vec::with_capacity(POOL_SIZE);
        for _ in 0..POOL_SIZE {
            pool.push(create_buffer_object(gbm, width, height, format, candidates)?);
        }
        debug!("Allocated fixed pool of {POOL_SIZE} buffer objects");
        Ok(Allocation::Pool(pool))
    } else {
        create_surface(gbm, width, height, format, candidates).map(Allocation::Swapchain)
    }
}

fn create_surface(
    gbm: &gbm::Device<Card>,
    width: u32,
    height: u32,
    format: DrmFourcc,
    candidates: &[DrmModifier],
) -> Result<Surface<ImportedFramebuffer>, AllocError> {
    if !candidates.is_empty() {
        match gbm.create_surface_with_modifiers2::<ImportedFramebuffer>(
            width,
            height,
            format,
            candidates.iter().copied(),
            USAGE,
        ) {
            Ok(surface) => return Ok(surface),
            Err(err) => {
                if !fallback_allowed(candidates) {
                    warn!("Modifiers requested but support isn't available");
                    return Err(AllocError::ModifierUnsupported);
                }
                debug!("Modifier-qualified surface creation failed ({err}), using plain creation");
            }
        }
    }

    gbm.create_surface::<ImportedFramebuffer>(width, height, format, USAGE)
        .map_err(AllocError::AllocationFailed)
}

fn create_buffer_object(
    gbm: &gbm::Device<Card>,
    width: u32,
    height: u32,
    format: DrmFourcc,
    candidates: &[DrmModifier],
) -> Result<BufferObject<()>, AllocError> {
    if !candidates.is_empty() {
        match gbm.create_buffer_object_with_modifiers2::<()>(
            width,
            height,
            format,
            candidates.iter().copied(),
            USAGE,
        ) {
            Ok(bo) => return Ok(bo),
            Err(err) => {
                if !fallback_allowed(candidates) {
                    warn!("Modifiers requested but support isn't available");
                    return Err(AllocError::ModifierUnsupported);
                }
                debug!("Modifier-qualified buffer creation failed ({err}), using plain creation");
            }
        }
    }

    gbm.create_buffer_object::<()>(width, height, format, USAGE)
        .map_err(AllocError::AllocationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_rotation_is_modulo_n() {
        for frame in 0..32u64 {
            assert_eq!(
                slot_for_frame(frame, POOL_SIZE),
                slot_for_frame(frame + POOL_SIZE as u64, POOL_SIZE)
            );
        }
        assert_eq!(slot_for_frame(0, 2), 0);
        assert_eq!(slot_for_frame(1, 2), 1);
        assert_eq!(slot_for_frame(2, 2), 0);
    }

    #[test]
    fn test_forced_modifier_wins() {
        let tiled = DrmModifier::from(0x0100_0000_0000_0001);
        let negotiated = [DrmModifier::Linear];
        assert_eq!(
            modifier_candidates(Some(tiled), &negotiated),
            vec![tiled]
        );
        assert_eq!(
            modifier_candidates(None, &negotiated),
            vec![DrmModifier::Linear]
        );
    }

    #[test]
    fn test_no_silent_substitution_of_nonlinear_layouts() {
        // A layout set containing only non-linear modifiers must not fall
        // back to plain linear creation.
        let tiled = [DrmModifier::from(0x0100_0000_0000_0001)];
        assert!(!fallback_allowed(&tiled));
    }

    #[test]
    fn test_linear_and_unrequested_layouts_may_fall_back() {
        assert!(fallback_allowed(&[DrmModifier::Linear]));
        assert!(fallback_allowed(&[]));
    }
}
