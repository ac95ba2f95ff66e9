//! Display commit protocols.
//!
//! Two mutually exclusive state machines behind one `commit` call, chosen
//! once at setup and never branched on again per frame:
//!
//! - **Legacy**: one blocking mode-set on the first commit, then a
//!   non-blocking page flip per frame, waiting on the kernel's completion
//!   event (unless async flips were requested). Input readiness during the
//!   wait short-circuits it as a user interrupt.
//! - **Atomic**: one property transaction per commit. Mode binding,
//!   CRTC activation and connector routing ride along on the first commit
//!   only; plane geometry and the framebuffer binding are set every time.
//!
//! Atomic transactions are built as a plan of (object, property name,
//! value) writes and resolved against the property snapshots afterwards;
//! any name that fails to resolve aborts the commit before submission.

use drm::control::atomic::AtomicModeReq;
use drm::control::{
    connector, crtc, framebuffer, plane, property, AtomicCommitFlags, Device as ControlDevice,
    Event, PageFlipFlags,
};
use rustix::event::{poll, PollFd, PollFlags};
use rustix::time::Timespec;
use tracing::{debug, info};

use crate::core::display::{DisplayTarget, PropertyTable};
use crate::core::errors::CommitError;
use crate::device::Card;

/// Result of a successful commit call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// The buffer reached the display (or its flip was queued, on the
    /// async path).
    Displayed,
    /// The user interrupted the flip wait; nothing further should be
    /// committed.
    Interrupted,
}

/// Non-blocking readiness check on the control input stream.
pub(crate) fn input_pending() -> std::io::Result<bool> {
    let stdin = rustix::stdio::stdin();
    let mut fds = [PollFd::new(&stdin, PollFlags::IN)];
    let n = poll(&mut fds, Some(&Timespec::default()))?;
    Ok(n > 0 && fds[0].revents().contains(PollFlags::IN))
}

// ============================================================================
// Protocol selection
// ============================================================================

/// The commit state machine driving this run.
pub enum CommitProtocol {
    Legacy(LegacyCommit),
    Atomic(AtomicCommit),
}

impl CommitProtocol {
    pub fn new_legacy(async_flip: bool) -> Self {
        Self::Legacy(LegacyCommit {
            async_flip,
            mode_set: false,
        })
    }

    pub fn new_atomic(plane: plane::Handle, async_flip: bool) -> Self {
        Self::Atomic(AtomicCommit {
            plane,
            async_flip,
            mode_blob: None,
        })
    }

    /// Apply `fb` to the display.
    ///
    /// `allow_modeset` must be true for the first call and cleared by the
    /// caller after the first success.
    pub fn commit(
        &mut self,
        card: &Card,
        target: &DisplayTarget,
        fb: framebuffer::Handle,
        allow_modeset: bool,
    ) -> Result<CommitOutcome, CommitError> {
        match self {
            Self::Legacy(legacy) => legacy.commit(card, target, fb),
            Self::Atomic(atomic) => atomic.commit(card, target, fb, allow_modeset),
        }
    }
}

// ============================================================================
// Legacy protocol
// ============================================================================

pub struct LegacyCommit {
    async_flip: bool,
    mode_set: bool,
}

impl LegacyCommit {
    fn commit(
        &mut self,
        card: &Card,
        target: &DisplayTarget,
        fb: framebuffer::Handle,
    ) -> Result<CommitOutcome, CommitError> {
        if !self.mode_set {
            // The blocking mode-set must succeed once before any flip.
            card.set_crtc(
                target.crtc,
                Some(fb),
                (0, 0),
                &[target.connector],
                Some(target.mode),
            )
            .map_err(CommitError::Rejected)?;
            self.mode_set = true;
            debug!("Initial mode set on CRTC {:?}", target.crtc);
            return Ok(CommitOutcome::Displayed);
        }

        let flags = if self.async_flip {
            PageFlipFlags::ASYNC
        } else {
            PageFlipFlags::EVENT
        };
        card.page_flip(target.crtc, fb, flags, None)
            .map_err(CommitError::Rejected)?;

        if self.async_flip {
            return Ok(CommitOutcome::Displayed);
        }
        wait_for_flip(card)
    }
}

/// Block until the kernel reports the queued flip done, demultiplexing
/// input readiness into a user interrupt.
fn wait_for_flip(card: &Card) -> Result<CommitOutcome, CommitError> {
    loop {
        let stdin = rustix::stdio::stdin();
        let drm_fd = std::os::fd::AsFd::as_fd(card);
        let mut fds = [
            PollFd::new(&stdin, PollFlags::IN),
            PollFd::new(&drm_fd, PollFlags::IN),
        ];
        poll(&mut fds, None).map_err(|e| CommitError::EventWait(e.into()))?;

        if fds[0].revents().contains(PollFlags::IN) {
            info!("user interrupted!");
            return Ok(CommitOutcome::Interrupted);
        }
        if fds[1].revents().contains(PollFlags::IN) {
            let events = card.receive_events().map_err(CommitError::EventWait)?;
            for event in events {
                if matches!(event, Event::PageFlip(_)) {
                    return Ok(CommitOutcome::Displayed);
                }
            }
        }
    }
}

// ============================================================================
// Atomic protocol
// ============================================================================

pub struct AtomicCommit {
    plane: plane::Handle,
    async_flip: bool,
    /// Serialized-mode blob, created on the first commit and kept alive
    /// for the life of the process.
    mode_blob: Option<property::Value<'static>>,
}

impl AtomicCommit {
    fn commit(
        &mut self,
        card: &Card,
        target: &DisplayTarget,
        fb: framebuffer::Handle,
        allow_modeset: bool,
    ) -> Result<CommitOutcome, CommitError> {
        let modeset_blob = if allow_modeset {
            let blob = match self.mode_blob {
                Some(blob) => blob,
                None => {
                    let blob = card
                        .create_property_blob(&target.mode)
                        .map_err(CommitError::Rejected)?;
                    self.mode_blob = Some(blob);
                    blob
                }
            };
            Some(blob)
        } else {
            None
        };

        let writes = plan_writes(
            target.width(),
            target.height(),
            fb,
            target.crtc,
            modeset_blob,
        );
        let req = materialize(
            &writes,
            target.connector,
            &target.connector_props,
            target.crtc,
            &target.crtc_props,
            self.plane,
            &target.plane_props,
        )?;

        let mut flags = AtomicCommitFlags::NONBLOCK;
        if self.async_flip {
            flags |= AtomicCommitFlags::PAGE_FLIP_ASYNC;
        } else {
            flags |= AtomicCommitFlags::PAGE_FLIP_EVENT;
        }
        if allow_modeset {
            flags |= AtomicCommitFlags::ALLOW_MODESET;
        }

        card.atomic_commit(flags, req)
            .map_err(CommitError::Rejected)?;

        if !self.async_flip {
            // The payload is not needed, but the event must be pumped once
            // per frame to bound the kernel's event queue.
            drain_flip_event(card)?;
        }
        Ok(CommitOutcome::Displayed)
    }
}

fn drain_flip_event(card: &Card) -> Result<(), CommitError> {
    let drm_fd = std::os::fd::AsFd::as_fd(card);
    let mut fds = [PollFd::new(&drm_fd, PollFlags::IN)];
    poll(&mut fds, None).map_err(|e| CommitError::EventWait(e.into()))?;
    let events = card.receive_events().map_err(CommitError::EventWait)?;
    for _event in events {}
    Ok(())
}

// ============================================================================
// Transaction planning
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObjectKind {
    Connector,
    Crtc,
    Plane,
}

/// One property write of a planned transaction, still by name.
pub(crate) struct PlannedWrite {
    pub object: ObjectKind,
    pub name: &'static str,
    pub value: property::Value<'static>,
}

fn write(object: ObjectKind, name: &'static str, value: property::Value<'static>) -> PlannedWrite {
    PlannedWrite {
        object,
        name,
        value,
    }
}

/// Plan one commit: the optional first-commit modeset writes, then the
/// plane's framebuffer binding and full-screen geometry (source rectangle
/// in 16.16 fixed point; no scaling or cropping).
pub(crate) fn plan_writes(
    width: u32,
    height: u32,
    fb: framebuffer::Handle,
    crtc: crtc::Handle,
    modeset_blob: Option<property::Value<'static>>,
) -> Vec<PlannedWrite> {
    use property::Value;

    let mut writes = Vec::with_capacity(13);
    if let Some(blob) = modeset_blob {
        writes.push(write(ObjectKind::Connector, "CRTC_ID", Value::CRTC(Some(crtc))));
        writes.push(write(ObjectKind::Crtc, "MODE_ID", blob));
        writes.push(write(ObjectKind::Crtc, "ACTIVE", Value::Boolean(true)));
    }

    writes.push(write(ObjectKind::Plane, "FB_ID", Value::Framebuffer(Some(fb))));
    writes.push(write(ObjectKind::Plane, "CRTC_ID", Value::CRTC(Some(crtc))));
    writes.push(write(ObjectKind::Plane, "SRC_X", Value::UnsignedRange(0)));
    writes.push(write(ObjectKind::Plane, "SRC_Y", Value::UnsignedRange(0)));
    writes.push(write(
        ObjectKind::Plane,
        "SRC_W",
        Value::UnsignedRange((width as u64) << 16),
    ));
    writes.push(write(
        ObjectKind::Plane,
        "SRC_H",
        Value::UnsignedRange((height as u64) << 16),
    ));
    writes.push(write(ObjectKind::Plane, "CRTC_X", Value::SignedRange(0)));
    writes.push(write(ObjectKind::Plane, "CRTC_Y", Value::SignedRange(0)));
    writes.push(write(
        ObjectKind::Plane,
        "CRTC_W",
        Value::UnsignedRange(width as u64),
    ));
    writes.push(write(
        ObjectKind::Plane,
        "CRTC_H",
        Value::UnsignedRange(height as u64),
    ));
    writes
}

/// Resolve a plan against the property snapshots into a kernel request.
///
/// Any unresolvable name is fatal to the commit attempt; nothing is
/// partially applied.
pub(crate) fn materialize(
    writes: &[PlannedWrite],
    connector: connector::Handle,
    connector_props: &PropertyTable,
    crtc: crtc::Handle,
    crtc_props: &PropertyTable,
    plane: plane::Handle,
    plane_props: &PropertyTable,
) -> Result<AtomicModeReq, CommitError> {
    let mut req = AtomicModeReq::new();
    for planned in writes {
        let table = match planned.object {
            ObjectKind::Connector => connector_props,
            ObjectKind::Crtc => crtc_props,
            ObjectKind::Plane => plane_props,
        };
        let prop = table.id(planned.name).ok_or(CommitError::UnknownProperty {
            name: planned.name,
        })?;
        match planned.object {
            ObjectKind::Connector => req.add_property(connector, prop, planned.value),
            ObjectKind::Crtc => req.add_property(crtc, prop, planned.value),
            ObjectKind::Plane => req.add_property(plane, prop, planned.value),
        }
    }
    Ok(req)
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn fb(id: u32) -> framebuffer::Handle {
        framebuffer::Handle::from(NonZeroU32::new(id).unwrap())
    }

    fn crtc_handle(id: u32) -> crtc::Handle {
        crtc::Handle::from(NonZeroU32::new(id).unwrap())
    }

    fn count(writes: &[PlannedWrite], object: ObjectKind, name: &str) -> usize {
        writes
            .iter()
            .filter(|w| w.object == object && w.name == name)
            .count()
    }

    #[test]
    fn test_modeset_writes_emitted_exactly_once_across_commits() {
        // First commit with allow_modeset, three steady-state commits.
        let blob = property::Value::Unknown(99);
        let plans = [
            plan_writes(1920, 1080, fb(1), crtc_handle(4), Some(blob)),
            plan_writes(1920, 1080, fb(2), crtc_handle(4), None),
            plan_writes(1920, 1080, fb(1), crtc_handle(4), None),
            plan_writes(1920, 1080, fb(2), crtc_handle(4), None),
        ];

        let mode_id: usize = plans.iter().map(|p| count(p, ObjectKind::Crtc, "MODE_ID")).sum();
        let active: usize = plans.iter().map(|p| count(p, ObjectKind::Crtc, "ACTIVE")).sum();
        let conn_crtc: usize = plans
            .iter()
            .map(|p| count(p, ObjectKind::Connector, "CRTC_ID"))
            .sum();
        assert_eq!(mode_id, 1);
        assert_eq!(active, 1);
        assert_eq!(conn_crtc, 1);

        // Every commit binds the plane and its full geometry.
        for plan in &plans {
            assert_eq!(count(plan, ObjectKind::Plane, "FB_ID"), 1);
            assert_eq!(count(plan, ObjectKind::Plane, "CRTC_ID"), 1);
            assert_eq!(count(plan, ObjectKind::Plane, "SRC_W"), 1);
            assert_eq!(count(plan, ObjectKind::Plane, "CRTC_H"), 1);
        }
    }

    #[test]
    fn test_source_rectangle_is_16_16_fixed_point() {
        let plan = plan_writes(1920, 1080, fb(1), crtc_handle(4), None);
        let src_w = plan
            .iter()
            .find(|w| w.name == "SRC_W")
            .map(|w| w.value)
            .unwrap();
        let crtc_w = plan
            .iter()
            .find(|w| w.name == "CRTC_W")
            .map(|w| w.value)
            .unwrap();
        assert!(matches!(src_w, property::Value::UnsignedRange(v) if v == (1920u64) << 16));
        assert!(matches!(crtc_w, property::Value::UnsignedRange(1920)));
    }

    fn full_tables() -> (PropertyTable, PropertyTable, PropertyTable) {
        let connector = PropertyTable::for_tests(&[("CRTC_ID", 20)]);
        let crtc = PropertyTable::for_tests(&[("MODE_ID", 21), ("ACTIVE", 22)]);
        let plane = PropertyTable::for_tests(&[
            ("FB_ID", 30),
            ("CRTC_ID", 31),
            ("SRC_X", 32),
            ("SRC_Y", 33),
            ("SRC_W", 34),
            ("SRC_H", 35),
            ("CRTC_X", 36),
            ("CRTC_Y", 37),
            ("CRTC_W", 38),
            ("CRTC_H", 39),
        ]);
        (connector, crtc, plane)
    }

    #[test]
    fn test_materialize_resolves_complete_tables() {
        let (connector_props, crtc_props, plane_props) = full_tables();
        let plan = plan_writes(
            1920,
            1080,
            fb(1),
            crtc_handle(4),
            Some(property::Value::Unknown(99)),
        );
        let req = materialize(
            &plan,
            connector::Handle::from(NonZeroU32::new(10).unwrap()),
            &connector_props,
            crtc_handle(4),
            &crtc_props,
            plane::Handle::from(NonZeroU32::new(11).unwrap()),
            &plane_props,
        );
        assert!(req.is_ok());
    }

    #[test]
    fn test_materialize_fails_on_unknown_property() {
        let (connector_props, crtc_props, _) = full_tables();
        let empty_plane = PropertyTable::default();
        let plan = plan_writes(1920, 1080, fb(1), crtc_handle(4), None);
        let err = materialize(
            &plan,
            connector::Handle::from(NonZeroU32::new(10).unwrap()),
            &connector_props,
            crtc_handle(4),
            &crtc_props,
            plane::Handle::from(NonZeroU32::new(11).unwrap()),
            &empty_plane,
        )
        .unwrap_err();
        assert!(matches!(err, CommitError::UnknownProperty { name: "FB_ID" }));
    }
}
