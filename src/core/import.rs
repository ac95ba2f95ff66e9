//! Zero-copy buffer import.
//!
//! Bridges each allocated pixel buffer into the two pipelines that consume
//! it: the GPU (dma-buf export -> EGLImage -> external texture -> offscreen
//! render target, surfaceless path only) and the display (kernel
//! framebuffer object). Imports are idempotent: the result is cached on the
//! buffer, and at most one kernel framebuffer is ever created per buffer.

use std::io;

use drm::control::{framebuffer, Device as ControlDevice, FbCmd2Flags};
use drm_fourcc::{DrmFourcc, DrmModifier};
use gbm::{BufferObject, Surface};
use glow::HasContext;
use tracing::{debug, warn};

use crate::core::errors::{ImportError, PipelineError};
use crate::core::render::{EglImageRaw, RenderContext};
use crate::device::Card;

// EGL_EXT_image_dma_buf_import tokens, passed to the resolved
// eglCreateImageKHR entry point.
const EGL_WIDTH: i32 = 0x3057;
const EGL_HEIGHT: i32 = 0x3056;
const EGL_NONE: i32 = 0x3038;
const EGL_LINUX_DMA_BUF_EXT: u32 = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: i32 = 0x3271;
const EGL_DMA_BUF_PLANE0_FD_EXT: i32 = 0x3272;
const EGL_DMA_BUF_PLANE0_OFFSET_EXT: i32 = 0x3273;
const EGL_DMA_BUF_PLANE0_PITCH_EXT: i32 = 0x3274;
const EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT: i32 = 0x3443;
const EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT: i32 = 0x3444;

/// A zero-copy EGLImage wrapping a buffer's dma-buf.
#[derive(Clone, Copy)]
pub struct EglImage(pub EglImageRaw);

/// Offscreen GL render target backed by an imported buffer.
pub struct RenderTarget {
    pub image: EglImage,
    pub texture: glow::Texture,
    pub fbo: glow::Framebuffer,
}

/// Per-buffer import state, created once on first use.
pub struct ImportedFramebuffer {
    /// Kernel framebuffer id for display commits.
    pub fb: framebuffer::Handle,
    /// GPU-side render target; only populated on the surfaceless path.
    pub render: Option<RenderTarget>,
}

// ============================================================================
// Kernel framebuffer import
// ============================================================================

/// Legacy AddFB depth/bpp for the formats we scan out.
pub(crate) fn depth_bpp(format: DrmFourcc) -> (u32, u32) {
    match format {
        DrmFourcc::Argb8888 | DrmFourcc::Abgr8888 => (32, 32),
        DrmFourcc::Rgb565 => (16, 16),
        _ => (24, 32),
    }
}

/// Wrap a buffer object as a kernel framebuffer.
///
/// Tries the planar, modifier-qualified call first and falls back exactly
/// once to the legacy single-plane call.
pub fn kernel_framebuffer<T: 'static>(
    card: &Card,
    bo: &BufferObject<T>,
    format: DrmFourcc,
) -> Result<framebuffer::Handle, ImportError> {
    let modifier = bo.modifier();
    let flags = if modifier != DrmModifier::Invalid && modifier != DrmModifier::Linear {
        FbCmd2Flags::MODIFIERS
    } else {
        FbCmd2Flags::empty()
    };

    match card.add_planar_framebuffer(bo, flags) {
        Ok(fb) => Ok(fb),
        Err(err) => {
            if flags.contains(FbCmd2Flags::MODIFIERS) {
                warn!("Modifier-qualified framebuffer creation failed: {err}");
            }
            let (depth, bpp) = depth_bpp(format);
            card.add_framebuffer(bo, depth, bpp)
                .map_err(ImportError::FramebufferCreateFailed)
        }
    }
}

/// Cache-or-import decision: a cached id is returned as-is, otherwise the
/// import runs and the second tuple field reports that it did.
pub(crate) fn fetch_or_import(
    cached: Option<framebuffer::Handle>,
    import: impl FnOnce() -> Result<framebuffer::Handle, ImportError>,
) -> Result<(framebuffer::Handle, bool), ImportError> {
    match cached {
        Some(fb) => Ok((fb, false)),
        None => import().map(|fb| (fb, true)),
    }
}

/// Kernel framebuffer id for a swap-chain buffer, imported on first sight
/// and cached as buffer user data thereafter.
pub fn framebuffer_for_front(
    card: &Card,
    bo: &mut BufferObject<ImportedFramebuffer>,
    format: DrmFourcc,
) -> Result<framebuffer::Handle, ImportError> {
    let cached = bo.userdata().map(|imported| imported.fb);
    let (fb, fresh) = fetch_or_import(cached, || kernel_framebuffer(card, &*bo, format))?;
    if fresh {
        debug!("Imported swap-chain buffer as framebuffer {fb:?}");
        bo.set_userdata(ImportedFramebuffer { fb, render: None });
    }
    Ok(fb)
}

// ============================================================================
// GPU texture import (surfaceless path)
// ============================================================================

/// EGLImage attribute list for a single-plane dma-buf import.
pub(crate) fn image_attributes(
    width: u32,
    height: u32,
    fourcc: u32,
    fd: i32,
    stride: u32,
    modifier: Option<DrmModifier>,
) -> Vec<i32> {
    let mut attrs = vec![
        EGL_WIDTH,
        width as i32,
        EGL_HEIGHT,
        height as i32,
        EGL_LINUX_DRM_FOURCC_EXT,
        fourcc as i32,
        EGL_DMA_BUF_PLANE0_FD_EXT,
        fd,
        EGL_DMA_BUF_PLANE0_OFFSET_EXT,
        0,
        EGL_DMA_BUF_PLANE0_PITCH_EXT,
        stride as i32,
    ];
    // Only a real, non-default layout is spelled out; linear stays
    // implicit for drivers without modifier support.
    if let Some(modifier) = modifier {
        if modifier != DrmModifier::Linear && modifier != DrmModifier::Invalid {
            let raw = u64::from(modifier);
            attrs.push(EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT);
            attrs.push((raw & 0xffff_ffff) as i32);
            attrs.push(EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT);
            attrs.push((raw >> 32) as i32);
        }
    }
    attrs.push(EGL_NONE);
    attrs
}

/// Import a buffer object as an offscreen GL render target.
pub fn render_target(
    ctx: &RenderContext,
    bo: &BufferObject<()>,
    format: DrmFourcc,
) -> Result<RenderTarget, ImportError> {
    let Some(create_image) = ctx.caps.create_image else {
        return Err(ImportError::MissingCapability("EGL_KHR_image_base"));
    };
    let Some(image_target) = ctx.caps.image_target_texture_2d else {
        return Err(ImportError::MissingCapability("GL_OES_EGL_image"));
    };

    let fd = bo
        .fd()
        .map_err(|e| ImportError::BufferExportFailed(io::Error::other(e)))?;

    let modifier = ctx.modifiers_supported.then(|| bo.modifier());
    let attrs = image_attributes(
        bo.width(),
        bo.height(),
        format as u32,
        std::os::fd::AsRawFd::as_raw_fd(&fd),
        bo.stride(),
        modifier,
    );

    let image = unsafe {
        create_image(
            ctx.display_ptr(),
            std::ptr::null_mut(),
            EGL_LINUX_DMA_BUF_EXT,
            std::ptr::null_mut(),
            attrs.as_ptr(),
        )
    };
    if image.is_null() {
        return Err(ImportError::ImageImportFailed);
    }
    // The image owns its own reference to the buffer storage now; the
    // exported descriptor is closed here.
    drop(fd);

    let gl = &ctx.gl;
    unsafe {
        let texture = gl.create_texture().map_err(ImportError::GlObjectCreate)?;
        gl.bind_texture(glow::TEXTURE_2D, Some(texture));
        image_target(glow::TEXTURE_2D, image);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MIN_FILTER, glow::LINEAR as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_MAG_FILTER, glow::LINEAR as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_S, glow::CLAMP_TO_EDGE as i32);
        gl.tex_parameter_i32(glow::TEXTURE_2D, glow::TEXTURE_WRAP_T, glow::CLAMP_TO_EDGE as i32);
        gl.bind_texture(glow::TEXTURE_2D, None);

        let fbo = gl.create_framebuffer().map_err(ImportError::GlObjectCreate)?;
        gl.bind_framebuffer(glow::FRAMEBUFFER, Some(fbo));
        gl.framebuffer_texture_2d(
            glow::FRAMEBUFFER,
            glow::COLOR_ATTACHMENT0,
            glow::TEXTURE_2D,
            Some(texture),
            0,
        );
        let status = gl.check_framebuffer_status(glow::FRAMEBUFFER);
        if status != glow::FRAMEBUFFER_COMPLETE {
            gl.delete_framebuffer(fbo);
            gl.delete_texture(texture);
            return Err(ImportError::FramebufferIncomplete(status));
        }

        Ok(RenderTarget {
            image: EglImage(image),
            texture,
            fbo,
        })
    }
}

// ============================================================================
// Prepared frame buffers
// ============================================================================

/// A fixed-pool buffer and its imports, owned together so they are
/// released together.
pub struct PoolSlot {
    pub bo: BufferObject<()>,
    pub imported: ImportedFramebuffer,
}

/// The frame buffers the loop rotates through, fully imported.
pub enum FrameBuffers {
    /// Surfaced path: buffers surface through lock/release, imports are
    /// cached lazily per buffer.
    Swapchain { surface: Surface<ImportedFramebuffer> },
    /// Surfaceless path: a fixed pool, imported eagerly at setup.
    Pool { slots: Vec<PoolSlot>, card: Card },
}

impl FrameBuffers {
    /// Run every allocated buffer through the import bridge.
    pub fn prepare(
        card: &Card,
        ctx: &RenderContext,
        allocation: crate::core::buffers::Allocation,
        format: DrmFourcc,
    ) -> Result<Self, PipelineError> {
        match allocation {
            crate::core::buffers::Allocation::Swapchain(surface) => {
                Ok(FrameBuffers::Swapchain { surface })
            }
            crate::core::buffers::Allocation::Pool(buffers) => {
                let mut slots = Vec::with_capacity(buffers.len());
                for bo in buffers {
                    let render = render_target(ctx, &bo, format)?;
                    let fb = kernel_framebuffer(card, &bo, format)?;
                    debug!("Imported pool buffer as framebuffer {fb:?}");
                    slots.push(PoolSlot {
                        bo,
                        imported: ImportedFramebuffer {
                            fb,
                            render: Some(render),
                        },
                    });
                }
                Ok(FrameBuffers::Pool {
                    slots,
                    card: card.clone(),
                })
            }
        }
    }
}

impl Drop for FrameBuffers {
    fn drop(&mut self) {
        if let FrameBuffers::Pool { slots, card } = self {
            for slot in slots {
                let _ = card.destroy_framebuffer(slot.imported.fb);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn fb(id: u32) -> framebuffer::Handle {
        framebuffer::Handle::from(NonZeroU32::new(id).unwrap())
    }

    #[test]
    fn test_fetch_or_import_is_idempotent() {
        let mut imports = 0;
        let mut import = || -> Result<framebuffer::Handle, ImportError> {
            imports += 1;
            Ok(fb(7))
        };

        let (first, fresh) = fetch_or_import(None, &mut import).unwrap();
        assert!(fresh);
        let (second, fresh) = fetch_or_import(Some(first), &mut import).unwrap();
        assert!(!fresh);

        assert_eq!(first, second);
        assert_eq!(imports, 1);
    }

    #[test]
    fn test_fetch_or_import_propagates_failure() {
        let result = fetch_or_import(None, || Err(ImportError::ImageImportFailed));
        assert!(result.is_err());
    }

    #[test]
    fn test_image_attributes_without_modifier() {
        let attrs = image_attributes(1920, 1080, 0x34325258, 5, 7680, None);
        assert_eq!(attrs.last(), Some(&EGL_NONE));
        assert!(!attrs.contains(&EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT));

        // An implicit linear layout is not spelled out either.
        let attrs = image_attributes(1920, 1080, 0x34325258, 5, 7680, Some(DrmModifier::Linear));
        assert!(!attrs.contains(&EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT));
    }

    #[test]
    fn test_image_attributes_with_modifier_split() {
        let modifier = DrmModifier::from(0x0100_0000_0000_0002);
        let attrs = image_attributes(64, 64, 0x34325258, 3, 256, Some(modifier));

        let lo_at = attrs
            .iter()
            .position(|&a| a == EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT)
            .unwrap();
        let hi_at = attrs
            .iter()
            .position(|&a| a == EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT)
            .unwrap();
        assert_eq!(attrs[lo_at + 1], 0x2);
        assert_eq!(attrs[hi_at + 1], 0x0100_0000);
        assert_eq!(attrs.last(), Some(&EGL_NONE));
    }

    #[test]
    fn test_depth_bpp_per_format() {
        assert_eq!(depth_bpp(DrmFourcc::Xrgb8888), (24, 32));
        assert_eq!(depth_bpp(DrmFourcc::Argb8888), (32, 32));
        assert_eq!(depth_bpp(DrmFourcc::Rgb565), (16, 16));
    }
}
