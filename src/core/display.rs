//! KMS display object resolution.
//!
//! Walks the kernel's display resources once at startup and pins down
//! exactly one connector, one mode, one CRTC and (on the atomic path) one
//! primary-capable plane, together with a snapshot of each object's mutable
//! property table. The result is immutable for the life of the process;
//! later property writes go through the commit protocol, never back through
//! these snapshots.

use drm::control::{connector, crtc, plane, property, Device as ControlDevice, Mode, ModeTypeFlags, PlaneType};
use drm::{ClientCapability, Device as _};
use drm_fourcc::DrmModifier;
use tracing::{debug, info, warn};

use crate::config::{ModeRequest, Options};
use crate::core::errors::DiscoveryError;
use crate::device::Card;

// ============================================================================
// Property snapshots
// ============================================================================

/// Snapshot of one display object's property table: name, property id and
/// the value at resolve time.
///
/// Property counts per object are tens, not thousands, so lookups are a
/// linear scan over the snapshot.
#[derive(Debug, Default, Clone)]
pub struct PropertyTable {
    entries: Vec<PropertyEntry>,
}

#[derive(Debug, Clone)]
struct PropertyEntry {
    name: String,
    handle: property::Handle,
    value: property::RawValue,
}

impl PropertyTable {
    /// Read the full property table of a display object.
    pub fn snapshot(
        card: &Card,
        object: impl drm::control::ResourceHandle,
    ) -> Result<Self, DiscoveryError> {
        let props = card
            .get_properties(object)
            .map_err(|source| DiscoveryError::Os {
                what: "could not get object properties",
                source,
            })?;

        let mut entries = Vec::new();
        for (handle, value) in props {
            let Ok(info) = card.get_property(handle) else {
                continue;
            };
            entries.push(PropertyEntry {
                name: info.name().to_string_lossy().into_owned(),
                handle,
                value,
            });
        }
        Ok(Self { entries })
    }

    /// Property id for `name`, if the object has such a property.
    pub fn id(&self, name: &str) -> Option<property::Handle> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.handle)
    }

    /// Value of the property `name` at snapshot time.
    pub fn value(&self, name: &str) -> Option<property::RawValue> {
        self.entries
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value)
    }

    #[cfg(test)]
    pub(crate) fn for_tests(entries: &[(&str, u32)]) -> Self {
        Self {
            entries: entries
                .iter()
                .map(|&(name, id)| PropertyEntry {
                    name: name.to_string(),
                    handle: property::Handle::from(std::num::NonZeroU32::new(id).unwrap()),
                    value: 0,
                })
                .collect(),
        }
    }
}

// ============================================================================
// Storage layouts
// ============================================================================

/// Ordered set of storage-layout modifiers the display plane accepts for
/// the chosen pixel format.
///
/// Empty means modifiers are unsupported or unfiltered; downstream code
/// then falls back to the implicit linear layout.
#[derive(Debug, Default, Clone)]
pub struct StorageLayoutSet(Vec<DrmModifier>);

impl StorageLayoutSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn modifiers(&self) -> &[DrmModifier] {
        &self.0
    }

    pub fn contains(&self, modifier: DrmModifier) -> bool {
        self.0.contains(&modifier)
    }
}

// ============================================================================
// Resolved display target
// ============================================================================

/// The one connector/CRTC/plane triple this process drives, resolved once
/// at startup and never mutated.
#[derive(Debug)]
pub struct DisplayTarget {
    pub connector: connector::Handle,
    pub crtc: crtc::Handle,
    /// Index of the CRTC among all CRTCs, used for plane compatibility
    /// bitmasks.
    pub crtc_index: usize,
    pub mode: Mode,
    /// Scanout plane; only resolved on the atomic path.
    pub plane: Option<plane::Handle>,
    pub connector_props: PropertyTable,
    pub crtc_props: PropertyTable,
    pub plane_props: PropertyTable,
    /// Plane-accepted storage layouts for the configured pixel format.
    pub layouts: StorageLayoutSet,
}

impl DisplayTarget {
    pub fn width(&self) -> u32 {
        self.mode.size().0 as u32
    }

    pub fn height(&self) -> u32 {
        self.mode.size().1 as u32
    }
}

/// Resolve the display objects for this run.
///
/// Fails immediately on the first missing object; there are no retries and
/// no hot-plug waiting.
pub fn resolve(card: &Card, opts: &Options) -> Result<DisplayTarget, DiscoveryError> {
    if opts.atomic {
        // Plane enumeration needs universal planes; the transaction API
        // needs the atomic capability.
        card.set_client_capability(ClientCapability::UniversalPlanes, true)
            .map_err(|source| DiscoveryError::Os {
                what: "no universal planes support",
                source,
            })?;
        card.set_client_capability(ClientCapability::Atomic, true)
            .map_err(DiscoveryError::AtomicUnsupported)?;
    }

    let resources = card
        .resource_handles()
        .map_err(|source| DiscoveryError::Os {
            what: "could not get display resources",
            source,
        })?;

    let connector = find_connector(card, &resources, opts.connector)?;
    let mode = select_connector_mode(&connector, opts.mode.as_ref())?;
    info!(
        "Using connector {:?}, mode {}@{}",
        connector.handle(),
        mode.name().to_string_lossy(),
        mode.vrefresh()
    );

    let crtc = find_crtc(card, &resources, &connector)?;
    let crtc_index = resources
        .crtcs()
        .iter()
        .position(|&c| c == crtc)
        .ok_or(DiscoveryError::NoCrtcFound)?;
    info!("Using CRTC {crtc:?} (index {crtc_index})");

    let plane = if opts.atomic {
        Some(find_plane(card, &resources, crtc)?)
    } else {
        None
    };

    let connector_props = PropertyTable::snapshot(card, connector.handle())?;
    let crtc_props = PropertyTable::snapshot(card, crtc)?;
    let plane_props = match plane {
        Some(plane) => PropertyTable::snapshot(card, plane)?,
        None => PropertyTable::default(),
    };

    let layouts = match plane {
        Some(_) => plane_layouts(card, &plane_props, opts.format as u32),
        None => StorageLayoutSet::default(),
    };
    if !layouts.is_empty() {
        debug!(
            "Plane accepts {} storage layouts for {:?}",
            layouts.modifiers().len(),
            opts.format
        );
    }

    Ok(DisplayTarget {
        connector: connector.handle(),
        crtc,
        crtc_index,
        mode,
        plane,
        connector_props,
        crtc_props,
        plane_props,
        layouts,
    })
}

// ============================================================================
// Connector and mode
// ============================================================================

fn find_connector(
    card: &Card,
    resources: &drm::control::ResourceHandles,
    requested: Option<usize>,
) -> Result<connector::Info, DiscoveryError> {
    let handles = resources.connectors();

    if let Some(index) = requested {
        let handle = *handles.get(index).ok_or(DiscoveryError::NoDisplayFound)?;
        let info = card
            .get_connector(handle, false)
            .map_err(|_| DiscoveryError::NoDisplayFound)?;
        if info.state() != connector::State::Connected {
            return Err(DiscoveryError::NoDisplayFound);
        }
        return Ok(info);
    }

    for &handle in handles {
        if let Ok(info) = card.get_connector(handle, false) {
            if info.state() == connector::State::Connected {
                return Ok(info);
            }
        }
    }
    Err(DiscoveryError::NoDisplayFound)
}

fn select_connector_mode(
    connector: &connector::Info,
    requested: Option<&ModeRequest>,
) -> Result<Mode, DiscoveryError> {
    let modes = connector.modes();
    let views: Vec<ModeView> = modes
        .iter()
        .map(|m| ModeView {
            name: m.name().to_string_lossy().into_owned(),
            vrefresh: m.vrefresh(),
            area: m.size().0 as u32 * m.size().1 as u32,
            preferred: m.mode_type().contains(ModeTypeFlags::PREFERRED),
        })
        .collect();

    if let Some(req) = requested {
        if select_requested_mode(&views, req).is_none() {
            warn!("Requested mode {:?} not found, using default mode", req.name);
        }
    }

    select_mode(&views, requested)
        .map(|i| modes[i])
        .ok_or(DiscoveryError::NoModeFound)
}

/// Flat view of a display mode, kept separate from the kernel type so the
/// selection rules can be exercised directly.
#[derive(Debug, Clone)]
pub(crate) struct ModeView {
    pub name: String,
    pub vrefresh: u32,
    pub area: u32,
    pub preferred: bool,
}

fn select_requested_mode(modes: &[ModeView], req: &ModeRequest) -> Option<usize> {
    modes
        .iter()
        .position(|m| m.name == req.name && (req.vrefresh == 0 || m.vrefresh == req.vrefresh))
}

/// Mode selection: exact name+refresh match if requested, else the
/// driver-preferred mode, else the mode with the largest pixel area.
pub(crate) fn select_mode(modes: &[ModeView], requested: Option<&ModeRequest>) -> Option<usize> {
    if let Some(req) = requested {
        if let Some(i) = select_requested_mode(modes, req) {
            return Some(i);
        }
    }
    if let Some(i) = modes.iter().position(|m| m.preferred) {
        return Some(i);
    }
    modes
        .iter()
        .enumerate()
        .max_by_key(|(_, m)| m.area)
        .map(|(i, _)| i)
}

// ============================================================================
// CRTC and plane
// ============================================================================

fn find_crtc(
    card: &Card,
    resources: &drm::control::ResourceHandles,
    connector: &connector::Info,
) -> Result<crtc::Handle, DiscoveryError> {
    // Prefer the CRTC already driven by the connector's bound encoder.
    if let Some(enc) = connector.current_encoder() {
        if let Ok(info) = card.get_encoder(enc) {
            if let Some(crtc) = info.crtc() {
                return Ok(crtc);
            }
        }
    }

    // Otherwise take any CRTC an encoder of this connector can reach.
    for &enc in connector.encoders() {
        let Ok(info) = card.get_encoder(enc) else {
            continue;
        };
        if let Some(&crtc) = resources.filter_crtcs(info.possible_crtcs()).first() {
            return Ok(crtc);
        }
    }
    Err(DiscoveryError::NoCrtcFound)
}

/// Flat view of a plane candidate for the selection rule below.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PlaneView {
    pub compatible: bool,
    pub primary: bool,
}

/// Plane selection: among CRTC-compatible planes prefer the primary one,
/// else accept the first compatible match.
pub(crate) fn select_plane(planes: &[PlaneView]) -> Option<usize> {
    planes
        .iter()
        .position(|p| p.compatible && p.primary)
        .or_else(|| planes.iter().position(|p| p.compatible))
}

fn find_plane(
    card: &Card,
    resources: &drm::control::ResourceHandles,
    crtc: crtc::Handle,
) -> Result<plane::Handle, DiscoveryError> {
    let handles = card
        .plane_handles()
        .map_err(|source| DiscoveryError::Os {
            what: "could not get plane resources",
            source,
        })?;

    let mut views = Vec::with_capacity(handles.len());
    for &handle in handles.iter() {
        let Ok(info) = card.get_plane(handle) else {
            views.push(PlaneView {
                compatible: false,
                primary: false,
            });
            continue;
        };
        let compatible = resources
            .filter_crtcs(info.possible_crtcs())
            .contains(&crtc);
        let primary = compatible && plane_is_primary(card, handle);
        views.push(PlaneView { compatible, primary });
    }

    select_plane(&views)
        .map(|i| handles[i])
        .ok_or(DiscoveryError::NoSuitablePlane)
}

fn plane_is_primary(card: &Card, plane: plane::Handle) -> bool {
    let Ok(table) = PropertyTable::snapshot(card, plane) else {
        return false;
    };
    table.value("type") == Some(PlaneType::Primary as u64)
}

// ============================================================================
// IN_FORMATS decoding
// ============================================================================

/// Header of the kernel's IN_FORMATS property blob.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct FormatModifierBlobHeader {
    version: u32,
    flags: u32,
    count_formats: u32,
    formats_offset: u32,
    count_modifiers: u32,
    modifiers_offset: u32,
}

/// One modifier entry; `formats` is a bitmask of format indices relative
/// to `offset`.
#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct FormatModifierEntry {
    formats: u64,
    offset: u32,
    pad: u32,
    modifier: u64,
}

fn plane_layouts(card: &Card, plane_props: &PropertyTable, fourcc: u32) -> StorageLayoutSet {
    let Some(blob_id) = plane_props.value("IN_FORMATS") else {
        debug!("Plane has no IN_FORMATS property, not using modifiers");
        return StorageLayoutSet::default();
    };
    match card.get_property_blob(blob_id) {
        Ok(blob) => StorageLayoutSet(modifiers_for_format(&blob, fourcc)),
        Err(err) => {
            warn!("Could not read IN_FORMATS blob: {err}");
            StorageLayoutSet::default()
        }
    }
}

/// Decode the modifiers an IN_FORMATS blob declares for one pixel format.
pub(crate) fn modifiers_for_format(blob: &[u8], fourcc: u32) -> Vec<DrmModifier> {
    let header_len = std::mem::size_of::<FormatModifierBlobHeader>();
    let Some(header_bytes) = blob.get(..header_len) else {
        return Vec::new();
    };
    let header: FormatModifierBlobHeader = bytemuck::pod_read_unaligned(header_bytes);

    let format_index = (0..header.count_formats as usize).position(|i| {
        let at = header.formats_offset as usize + i * 4;
        blob.get(at..at + 4)
            .map(|b| u32::from_le_bytes(b.try_into().unwrap()))
            == Some(fourcc)
    });
    let Some(format_index) = format_index else {
        return Vec::new();
    };

    let entry_len = std::mem::size_of::<FormatModifierEntry>();
    let mut modifiers = Vec::new();
    for i in 0..header.count_modifiers as usize {
        let at = header.modifiers_offset as usize + i * entry_len;
        let Some(bytes) = blob.get(at..at + entry_len) else {
            break;
        };
        let entry: FormatModifierEntry = bytemuck::pod_read_unaligned(bytes);
        let relative = format_index as i64 - entry.offset as i64;
        if (0..64).contains(&relative) && (entry.formats >> relative) & 1 == 1 {
            modifiers.push(DrmModifier::from(entry.modifier));
        }
    }
    modifiers
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn mode(name: &str, vrefresh: u32, area: u32, preferred: bool) -> ModeView {
        ModeView {
            name: name.to_string(),
            vrefresh,
            area,
            preferred,
        }
    }

    #[test]
    fn test_select_mode_exact_name_and_refresh() {
        // One connected connector carrying 1920x1080 at both 60 and 75 Hz;
        // a request for 60 must pick the 60 Hz entry.
        let modes = vec![
            mode("1920x1080", 75, 1920 * 1080, false),
            mode("1920x1080", 60, 1920 * 1080, false),
        ];
        let req = ModeRequest {
            name: "1920x1080".into(),
            vrefresh: 60,
        };
        assert_eq!(select_mode(&modes, Some(&req)), Some(1));
    }

    #[test]
    fn test_select_mode_any_refresh() {
        let modes = vec![
            mode("1024x768", 60, 1024 * 768, false),
            mode("1920x1080", 75, 1920 * 1080, false),
        ];
        let req = ModeRequest {
            name: "1920x1080".into(),
            vrefresh: 0,
        };
        assert_eq!(select_mode(&modes, Some(&req)), Some(1));
    }

    #[test]
    fn test_select_mode_falls_back_to_preferred() {
        let modes = vec![
            mode("3840x2160", 30, 3840 * 2160, false),
            mode("1920x1080", 60, 1920 * 1080, true),
        ];
        let req = ModeRequest {
            name: "640x480".into(),
            vrefresh: 0,
        };
        // Unknown request falls through to the preferred mode.
        assert_eq!(select_mode(&modes, Some(&req)), Some(1));
        assert_eq!(select_mode(&modes, None), Some(1));
    }

    #[test]
    fn test_select_mode_biggest_area_without_preferred() {
        let modes = vec![
            mode("1280x720", 60, 1280 * 720, false),
            mode("1920x1080", 60, 1920 * 1080, false),
            mode("1024x768", 60, 1024 * 768, false),
        ];
        assert_eq!(select_mode(&modes, None), Some(1));
    }

    #[test]
    fn test_select_mode_empty_list() {
        assert_eq!(select_mode(&[], None), None);
    }

    #[test]
    fn test_select_plane_prefers_primary() {
        let planes = vec![
            PlaneView {
                compatible: true,
                primary: false,
            },
            PlaneView {
                compatible: true,
                primary: true,
            },
        ];
        assert_eq!(select_plane(&planes), Some(1));
    }

    #[test]
    fn test_select_plane_accepts_first_compatible() {
        let planes = vec![
            PlaneView {
                compatible: false,
                primary: false,
            },
            PlaneView {
                compatible: true,
                primary: false,
            },
        ];
        assert_eq!(select_plane(&planes), Some(1));
    }

    #[test]
    fn test_select_plane_none_compatible() {
        let planes = vec![PlaneView {
            compatible: false,
            primary: false,
        }];
        assert_eq!(select_plane(&planes), None);
    }

    fn in_formats_blob(formats: &[u32], entries: &[(u64, u32, u64)]) -> Vec<u8> {
        // entries: (formats bitmask, offset, modifier)
        let header_len = 24usize;
        let formats_offset = header_len;
        let modifiers_offset = formats_offset + formats.len() * 4;
        let mut blob = Vec::new();
        blob.extend_from_slice(&1u32.to_le_bytes()); // version
        blob.extend_from_slice(&0u32.to_le_bytes()); // flags
        blob.extend_from_slice(&(formats.len() as u32).to_le_bytes());
        blob.extend_from_slice(&(formats_offset as u32).to_le_bytes());
        blob.extend_from_slice(&(entries.len() as u32).to_le_bytes());
        blob.extend_from_slice(&(modifiers_offset as u32).to_le_bytes());
        for f in formats {
            blob.extend_from_slice(&f.to_le_bytes());
        }
        for (mask, offset, modifier) in entries {
            blob.extend_from_slice(&mask.to_le_bytes());
            blob.extend_from_slice(&offset.to_le_bytes());
            blob.extend_from_slice(&0u32.to_le_bytes());
            blob.extend_from_slice(&modifier.to_le_bytes());
        }
        blob
    }

    #[test]
    fn test_in_formats_filters_by_format() {
        const XRGB: u32 = 0x34325258;
        const NV12: u32 = 0x3231564e;
        // Modifier 7 covers both formats, modifier 9 covers only NV12.
        let blob = in_formats_blob(&[XRGB, NV12], &[(0b11, 0, 7), (0b10, 0, 9)]);
        let mods = modifiers_for_format(&blob, XRGB);
        assert_eq!(mods, vec![DrmModifier::from(7)]);
        let mods = modifiers_for_format(&blob, NV12);
        assert_eq!(
            mods,
            vec![DrmModifier::from(7), DrmModifier::from(9)]
        );
    }

    #[test]
    fn test_in_formats_respects_entry_offset() {
        const XRGB: u32 = 0x34325258;
        const ARGB: u32 = 0x34325241;
        // Bitmask is relative to the entry's base index.
        let blob = in_formats_blob(&[ARGB, XRGB], &[(0b1, 1, 42)]);
        assert_eq!(modifiers_for_format(&blob, XRGB), vec![DrmModifier::from(42)]);
        assert!(modifiers_for_format(&blob, ARGB).is_empty());
    }

    #[test]
    fn test_in_formats_unknown_format_is_empty() {
        const XRGB: u32 = 0x34325258;
        let blob = in_formats_blob(&[XRGB], &[(0b1, 0, 7)]);
        assert!(modifiers_for_format(&blob, 0xdead_beef).is_empty());
    }

    #[test]
    fn test_in_formats_truncated_blob() {
        assert!(modifiers_for_format(&[0u8; 4], 0x34325258).is_empty());
    }
}
