//! Runtime configuration for the scanout pipeline.
//!
//! Everything here is an opaque input to the core: the pixel format and
//! modifier are parsed up front so the rest of the pipeline only ever sees
//! typed values.

use std::path::PathBuf;

use drm_fourcc::{DrmFourcc, DrmModifier};

/// A requested display mode, matched against the connector's mode list by
/// name and (optionally) vertical refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeRequest {
    /// Mode name as reported by the driver, e.g. "1920x1080".
    pub name: String,
    /// Vertical refresh in Hz; 0 accepts any refresh for the named mode.
    pub vrefresh: u32,
}

/// Configuration consumed by the pipeline.
#[derive(Debug, Clone)]
pub struct Options {
    /// DRM device node; `None` scans for the first KMS-capable node.
    pub device: Option<PathBuf>,
    /// Scanout pixel format.
    pub format: DrmFourcc,
    /// Caller-forced storage-layout modifier, bypassing negotiation.
    pub modifier: Option<DrmModifier>,
    /// Connector index into the kernel's connector list.
    pub connector: Option<usize>,
    /// Requested mode; `None` takes the driver-preferred or biggest mode.
    pub mode: Option<ModeRequest>,
    /// Number of frames to render; 0 runs until interrupted.
    pub frames: u32,
    /// Use the atomic commit protocol instead of the legacy one.
    pub atomic: bool,
    /// Render into a fixed pool of buffer objects instead of a swap chain.
    pub surfaceless: bool,
    /// Request asynchronous (non-vsynced) page flips.
    pub async_flip: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            device: None,
            format: DrmFourcc::Xrgb8888,
            modifier: None,
            connector: None,
            mode: None,
            frames: 0,
            atomic: false,
            surfaceless: false,
            async_flip: false,
        }
    }
}

/// Parse a pixel format given as a fourcc code ("XR24") or a common alias.
pub fn parse_fourcc(s: &str) -> Result<DrmFourcc, String> {
    match s {
        "xrgb8888" | "XRGB8888" => return Ok(DrmFourcc::Xrgb8888),
        "argb8888" | "ARGB8888" => return Ok(DrmFourcc::Argb8888),
        "xbgr8888" | "XBGR8888" => return Ok(DrmFourcc::Xbgr8888),
        "abgr8888" | "ABGR8888" => return Ok(DrmFourcc::Abgr8888),
        "rgb565" | "RGB565" => return Ok(DrmFourcc::Rgb565),
        _ => {}
    }

    let bytes = s.as_bytes();
    if bytes.len() != 4 {
        return Err(format!("'{s}' is not a fourcc code"));
    }
    let raw = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    DrmFourcc::try_from(raw).map_err(|e| e.to_string())
}

/// Parse a storage-layout modifier: "linear" or a (hex) 64-bit value.
pub fn parse_modifier(s: &str) -> Result<DrmModifier, String> {
    if s.eq_ignore_ascii_case("linear") {
        return Ok(DrmModifier::Linear);
    }
    let raw = if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).map_err(|e| e.to_string())?
    } else {
        s.parse::<u64>().map_err(|e| e.to_string())?
    };
    Ok(DrmModifier::from(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_fourcc_code() {
        assert_eq!(parse_fourcc("XR24").unwrap(), DrmFourcc::Xrgb8888);
        assert_eq!(parse_fourcc("AR24").unwrap(), DrmFourcc::Argb8888);
    }

    #[test]
    fn test_parse_fourcc_alias() {
        assert_eq!(parse_fourcc("xrgb8888").unwrap(), DrmFourcc::Xrgb8888);
        assert_eq!(parse_fourcc("RGB565").unwrap(), DrmFourcc::Rgb565);
    }

    #[test]
    fn test_parse_fourcc_rejects_garbage() {
        assert!(parse_fourcc("not-a-format").is_err());
        assert!(parse_fourcc("").is_err());
    }

    #[test]
    fn test_parse_modifier() {
        assert_eq!(parse_modifier("linear").unwrap(), DrmModifier::Linear);
        assert_eq!(parse_modifier("0").unwrap(), DrmModifier::Linear);
        // I915_FORMAT_MOD_X_TILED
        let tiled = parse_modifier("0x100000000000001").unwrap();
        assert_eq!(u64::from(tiled), 0x0100_0000_0000_0001);
    }
}
