//! GPU rendering context.
//!
//! Brings up EGL on top of the GBM device, negotiates the set of storage
//! layouts the renderer can import, and resolves the optional vendor
//! extension entry points into an explicit capability table. All
//! negotiation happens once, here; the frame loop only consumes the
//! resulting immutable [`RenderContext`].
//!
//! EGL is loaded dynamically at runtime, so absence of a GPU stack is an
//! ordinary reported error rather than a link failure.

use std::ffi::c_void;

use drm_fourcc::{DrmFourcc, DrmModifier};
use glow::HasContext;
use khronos_egl as egl;
use tracing::{info, warn};

use crate::core::buffers::Allocation;
use crate::core::display::StorageLayoutSet;
use crate::core::errors::RuntimeError;

/// Dynamically loaded EGL entry points (EGL 1.4 baseline).
pub type Egl = egl::DynamicInstance<egl::EGL1_4>;

/// Raw EGLImageKHR handle.
pub type EglImageRaw = *const c_void;

// EGL_KHR_platform_gbm
const EGL_PLATFORM_GBM_KHR: u32 = 0x31D7;

type PfnGetPlatformDisplayExt =
    unsafe extern "system" fn(platform: u32, native_display: *mut c_void, attrib_list: *const i32) -> *mut c_void;
type PfnCreateImageKhr = unsafe extern "system" fn(
    dpy: *mut c_void,
    ctx: *mut c_void,
    target: u32,
    client_buffer: *mut c_void,
    attrib_list: *const i32,
) -> EglImageRaw;
type PfnDestroyImageKhr = unsafe extern "system" fn(dpy: *mut c_void, image: EglImageRaw) -> u32;
type PfnImageTargetTexture2DOes = unsafe extern "system" fn(target: u32, image: EglImageRaw);
type PfnQueryDmaBufModifiersExt = unsafe extern "system" fn(
    dpy: *mut c_void,
    format: i32,
    max_modifiers: i32,
    modifiers: *mut u64,
    external_only: *mut u32,
    num_modifiers: *mut i32,
) -> u32;

// ============================================================================
// Capability table
// ============================================================================

/// Optional vendor extension entry points, resolved once at setup.
///
/// A `None` entry means the extension is absent; every call site checks
/// before use. The table is never re-queried after setup.
#[derive(Clone, Copy, Default)]
pub struct ExtensionTable {
    pub get_platform_display: Option<PfnGetPlatformDisplayExt>,
    pub create_image: Option<PfnCreateImageKhr>,
    pub destroy_image: Option<PfnDestroyImageKhr>,
    pub image_target_texture_2d: Option<PfnImageTargetTexture2DOes>,
    pub query_dmabuf_modifiers: Option<PfnQueryDmaBufModifiersExt>,
}

/// Exact-token membership test over an EGL/GL extension string.
pub(crate) fn has_ext(extension_list: &str, name: &str) -> bool {
    extension_list.split_whitespace().any(|e| e == name)
}

fn resolve_proc<F: Copy>(instance: &Egl, extensions: &str, extension: &str, name: &str) -> Option<F> {
    if !has_ext(extensions, extension) {
        return None;
    }
    let f = instance.get_proc_address(name)?;
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of_val(&f));
    Some(unsafe { std::mem::transmute_copy(&f) })
}

// ============================================================================
// EGL setup (pre-allocation phase)
// ============================================================================

/// EGL display and context, before the window surface exists.
///
/// The allocator needs the negotiated layout set from this phase; the
/// window surface in turn needs the allocator's GBM surface, so context
/// completion is split into [`EglSetup::into_context`].
pub struct EglSetup {
    instance: Egl,
    display: egl::Display,
    config: egl::Config,
    context: egl::Context,
    caps: ExtensionTable,
    modifiers_supported: bool,
}

impl EglSetup {
    /// Load EGL, create a display on the GBM device, pick a config and
    /// create an ES2 context.
    pub fn new(gbm_device: *mut c_void, format: DrmFourcc) -> Result<Self, RuntimeError> {
        let instance =
            unsafe { Egl::load_required() }.map_err(|e| RuntimeError::EglLoad(e.to_string()))?;

        let client_extensions = instance
            .query_string(None, egl::EXTENSIONS)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut caps = ExtensionTable {
            get_platform_display: resolve_proc(
                &instance,
                &client_extensions,
                "EGL_EXT_platform_base",
                "eglGetPlatformDisplayEXT",
            ),
            ..ExtensionTable::default()
        };

        let display = match caps.get_platform_display {
            Some(get_platform_display) => {
                let ptr = unsafe {
                    get_platform_display(EGL_PLATFORM_GBM_KHR, gbm_device, std::ptr::null())
                };
                if ptr.is_null() {
                    return Err(RuntimeError::Gpu("no EGL display for GBM platform".into()));
                }
                unsafe { egl::Display::from_ptr(ptr) }
            }
            None => unsafe { instance.get_display(gbm_device) }
                .ok_or_else(|| RuntimeError::Gpu("no EGL display for GBM device".into()))?,
        };

        let (major, minor) = instance
            .initialize(display)
            .map_err(|source| RuntimeError::Egl {
                what: "failed to initialize EGL",
                source,
            })?;
        info!("Initialized EGL {major}.{minor}");
        if let Ok(vendor) = instance.query_string(Some(display), egl::VENDOR) {
            info!("EGL vendor: {}", vendor.to_string_lossy());
        }

        let display_extensions = instance
            .query_string(Some(display), egl::EXTENSIONS)
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();

        caps.create_image = resolve_proc(
            &instance,
            &display_extensions,
            "EGL_KHR_image_base",
            "eglCreateImageKHR",
        );
        caps.destroy_image = resolve_proc(
            &instance,
            &display_extensions,
            "EGL_KHR_image_base",
            "eglDestroyImageKHR",
        );
        caps.query_dmabuf_modifiers = resolve_proc(
            &instance,
            &display_extensions,
            "EGL_EXT_image_dma_buf_import_modifiers",
            "eglQueryDmaBufModifiersEXT",
        );
        let modifiers_supported =
            has_ext(&display_extensions, "EGL_EXT_image_dma_buf_import_modifiers");

        instance
            .bind_api(egl::OPENGL_ES_API)
            .map_err(|source| RuntimeError::Egl {
                what: "failed to bind the OpenGL ES API",
                source,
            })?;

        let config = choose_config(&instance, display, format)?;

        let context_attribs = [egl::CONTEXT_CLIENT_VERSION, 2, egl::NONE];
        let context = instance
            .create_context(display, config, None, &context_attribs)
            .map_err(|source| RuntimeError::Egl {
                what: "failed to create EGL context",
                source,
            })?;

        Ok(Self {
            instance,
            display,
            config,
            context,
            caps,
            modifiers_supported,
        })
    }

    /// Storage layouts usable for allocation: the EGL-importable modifiers
    /// for `format`, minus external-only ones, intersected with what the
    /// display plane accepts.
    ///
    /// An empty result (or absent extension) downgrades the context to
    /// modifier-free operation.
    pub fn negotiate_layouts(
        &mut self,
        plane_layouts: &StorageLayoutSet,
        format: DrmFourcc,
    ) -> Vec<DrmModifier> {
        if !self.modifiers_supported {
            return Vec::new();
        }
        let Some(query) = self.caps.query_dmabuf_modifiers else {
            self.modifiers_supported = false;
            return Vec::new();
        };

        let dpy = self.display.as_ptr();
        let mut count = 0i32;
        let ok = unsafe {
            query(
                dpy,
                format as u32 as i32,
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut count,
            )
        };
        if ok == 0 || count <= 0 {
            warn!("Failed to query dma-buf modifiers for {format:?}, not using modifiers");
            self.modifiers_supported = false;
            return Vec::new();
        }

        let mut raw = vec![0u64; count as usize];
        let mut external_only = vec![0u32; count as usize];
        let ok = unsafe {
            query(
                dpy,
                format as u32 as i32,
                count,
                raw.as_mut_ptr(),
                external_only.as_mut_ptr(),
                &mut count,
            )
        };
        if ok == 0 {
            warn!("Failed to query dma-buf modifiers for {format:?}, not using modifiers");
            self.modifiers_supported = false;
            return Vec::new();
        }

        let mut layouts = Vec::new();
        for i in 0..count as usize {
            if external_only[i] != 0 {
                continue;
            }
            let modifier = DrmModifier::from(raw[i]);
            if !plane_layouts.is_empty() && !plane_layouts.contains(modifier) {
                continue;
            }
            layouts.push(modifier);
        }

        if layouts.is_empty() {
            warn!("No usable format modifiers found for {format:?}, not using modifiers");
            self.modifiers_supported = false;
        }
        layouts
    }

    /// Create the window surface (surfaced path), make the context
    /// current and resolve the GL entry points.
    pub fn into_context(self, allocation: &Allocation) -> Result<RenderContext, RuntimeError> {
        let surface = match allocation.surface_ptr() {
            Some(window) => Some(
                unsafe {
                    self.instance
                        .create_window_surface(self.display, self.config, window, None)
                }
                .map_err(|source| RuntimeError::Egl {
                    what: "failed to create EGL window surface",
                    source,
                })?,
            ),
            None => None,
        };

        self.instance
            .make_current(self.display, surface, surface, Some(self.context))
            .map_err(|source| RuntimeError::Egl {
                what: "failed to make EGL context current",
                source,
            })?;

        let gl = unsafe {
            glow::Context::from_loader_function(|name| {
                self.instance
                    .get_proc_address(name)
                    .map_or(std::ptr::null(), |f| f as *const c_void)
            })
        };
        unsafe {
            info!("OpenGL ES version: {}", gl.get_parameter_string(glow::VERSION));
            info!("OpenGL ES renderer: {}", gl.get_parameter_string(glow::RENDERER));
        }

        let mut caps = self.caps;
        caps.image_target_texture_2d = if gl.supported_extensions().contains("GL_OES_EGL_image") {
            self.instance
                .get_proc_address("glEGLImageTargetTexture2DOES")
                .map(|f| unsafe { std::mem::transmute::<extern "system" fn(), PfnImageTargetTexture2DOes>(f) })
        } else {
            None
        };

        Ok(RenderContext {
            instance: self.instance,
            display: self.display,
            context: self.context,
            surface,
            gl,
            caps,
            modifiers_supported: self.modifiers_supported,
        })
    }
}

fn choose_config(
    instance: &Egl,
    display: egl::Display,
    format: DrmFourcc,
) -> Result<egl::Config, RuntimeError> {
    let attribs = [
        egl::SURFACE_TYPE,
        egl::WINDOW_BIT,
        egl::RED_SIZE,
        1,
        egl::GREEN_SIZE,
        1,
        egl::BLUE_SIZE,
        1,
        egl::ALPHA_SIZE,
        0,
        egl::RENDERABLE_TYPE,
        egl::OPENGL_ES2_BIT,
        egl::NONE,
    ];

    let mut configs = Vec::with_capacity(64);
    instance
        .choose_config(display, &attribs, &mut configs)
        .map_err(|source| RuntimeError::Egl {
            what: "failed to choose an EGL config",
            source,
        })?;
    if configs.is_empty() {
        return Err(RuntimeError::Gpu(
            "no EGL configs with appropriate attributes".into(),
        ));
    }

    // Prefer the config whose native visual matches the scanout format;
    // GBM encodes the fourcc as the visual id.
    let matching = configs.iter().copied().find(|&config| {
        instance
            .get_config_attrib(display, config, egl::NATIVE_VISUAL_ID)
            .map(|id| id as u32 == format as u32)
            .unwrap_or(false)
    });
    Ok(matching.unwrap_or(configs[0]))
}

// ============================================================================
// Completed context
// ============================================================================

/// The GPU rendering context the frame loop drives.
pub struct RenderContext {
    instance: Egl,
    pub display: egl::Display,
    context: egl::Context,
    /// On-screen surface; absent in surfaceless mode.
    pub surface: Option<egl::Surface>,
    pub gl: glow::Context,
    pub caps: ExtensionTable,
    /// Whether dma-buf import may carry explicit modifiers.
    pub modifiers_supported: bool,
}

impl RenderContext {
    /// Present the swap-chain back buffer. Only meaningful on the
    /// surfaced path.
    pub fn swap_buffers(&self) -> Result<(), RuntimeError> {
        let Some(surface) = self.surface else {
            return Ok(());
        };
        self.instance
            .swap_buffers(self.display, surface)
            .map_err(|source| RuntimeError::Egl {
                what: "eglSwapBuffers failed",
                source,
            })
    }

    pub(crate) fn display_ptr(&self) -> *mut c_void {
        self.display.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_ext_matches_whole_tokens() {
        let list = "EGL_KHR_image_base EGL_EXT_image_dma_buf_import_modifiers";
        assert!(has_ext(list, "EGL_KHR_image_base"));
        assert!(has_ext(list, "EGL_EXT_image_dma_buf_import_modifiers"));
        assert!(!has_ext(list, "EGL_KHR_image"));
        assert!(!has_ext(list, "EGL_EXT_image_dma_buf_import"));
        assert!(!has_ext("", "EGL_KHR_image_base"));
    }
}
