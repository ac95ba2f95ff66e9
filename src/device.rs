//! DRM device access.
//!
//! The core never discovers devices on its own beyond this thin glue: a
//! caller either names a device node or we scan the primary nodes and take
//! the first one that speaks KMS. A leased descriptor handed over by a
//! compositor would enter the pipeline the same way, as an already-open fd.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use drm::control::Device as ControlDevice;
use drm::Device;
use tracing::{debug, info};

use crate::core::errors::DiscoveryError;

/// An open DRM device node.
///
/// Cloning shares the underlying descriptor, which both the KMS side and
/// the GBM allocator need for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Card(Arc<File>);

impl AsFd for Card {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl Device for Card {}
impl ControlDevice for Card {}

impl Card {
    /// Open a specific device node.
    pub fn open(path: &Path) -> Result<Self, DiscoveryError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| DiscoveryError::Os {
                what: "could not open DRM device",
                source,
            })?;
        info!("Opened DRM device {}", path.display());
        Ok(Self(Arc::new(file)))
    }

    /// Open the given device node, or scan for the first KMS-capable one.
    pub fn open_or_scan(path: Option<&Path>) -> Result<Self, DiscoveryError> {
        match path {
            Some(path) => Self::open(path),
            None => Self::scan(),
        }
    }

    /// Probe /dev/dri/card* in order and return the first node whose
    /// resource enumeration succeeds. Render nodes never qualify.
    fn scan() -> Result<Self, DiscoveryError> {
        for path in candidate_nodes() {
            let Ok(card) = Self::open(&path) else {
                continue;
            };
            match card.resource_handles() {
                Ok(_) => {
                    info!("Using KMS device {}", path.display());
                    return Ok(card);
                }
                Err(err) => {
                    debug!("{} is not KMS-capable: {err}", path.display());
                }
            }
        }
        Err(DiscoveryError::NoDisplayFound)
    }
}

fn candidate_nodes() -> Vec<PathBuf> {
    let mut nodes: Vec<PathBuf> = std::fs::read_dir("/dev/dri")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with("card"))
                })
                .collect()
        })
        .unwrap_or_default();
    nodes.sort();
    nodes
}
