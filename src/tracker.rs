//! Open-resource bookkeeping
//!
//! [`OpenResourceTracker`] subscribes to lifecycle events and maintains, per
//! resource kind, the set of currently-open handles together with when and
//! where each was opened. It is the answer to "what is open right now?" —
//! deciding whether any of it constitutes a leak (age thresholds, reporting)
//! belongs to the hosting application.
//!
//! # Examples
//!
//! ```
//! use spillway::testing::MemorySource;
//! use spillway::{Connection, OpenResourceTracker, ProxyFactory, ResourceKind, Source};
//! use std::sync::Arc;
//!
//! let factory = ProxyFactory::new();
//! let tracker = Arc::new(OpenResourceTracker::new());
//! factory.add_listener(tracker.clone());
//!
//! let source = factory.wrap_source(MemorySource::new("primary"));
//! let conn = source.connect()?;
//! assert_eq!(tracker.open_count(ResourceKind::Connection), 1);
//!
//! conn.close()?;
//! assert_eq!(tracker.open_count(ResourceKind::Connection), 0);
//! # Ok::<(), spillway::testing::MemoryError>(())
//! ```

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant, SystemTime};

use dashmap::DashMap;
use tracing::trace;

use crate::capture::{CaptureFilter, Frame};
use crate::handle::{CommandRole, HandleId, HandleRef, ResourceKind};
use crate::sink::ResourceLifecycleListener;

/// Where and when a tracked resource was opened.
///
/// Immutable once built. Holds a non-owning [`HandleRef`] to the resource:
/// the tracker observes lifetimes, it never controls them.
#[derive(Debug, Clone)]
pub struct CreationInfo {
    handle: HandleRef,
    created_at: SystemTime,
    opened: Instant,
    frames: Vec<Frame>,
    role: Option<CommandRole>,
}

impl CreationInfo {
    fn new(handle: HandleRef, frames: Vec<Frame>, role: Option<CommandRole>) -> Self {
        CreationInfo {
            handle,
            created_at: SystemTime::now(),
            opened: Instant::now(),
            frames,
            role,
        }
    }

    /// The resource this record describes.
    pub fn handle(&self) -> &HandleRef {
        &self.handle
    }

    /// Wall-clock time of creation.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// How long the resource has been open.
    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }

    /// Filtered call-site frames, outermost caller first. May be empty.
    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The command sub-role, for command records.
    pub fn role(&self) -> Option<CommandRole> {
        self.role
    }
}

impl PartialEq for CreationInfo {
    fn eq(&self, other: &Self) -> bool {
        self.handle.id() == other.handle.id()
            && self.created_at == other.created_at
            && self.frames == other.frames
            && self.role == other.role
    }
}

impl fmt::Display for CreationInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}, opened {}ms ago",
            self.handle.id(),
            self.age().as_millis()
        )?;
        if let Some(role) = self.role {
            write!(f, " ({role})")?;
        }
        for frame in &self.frames {
            write!(f, "\n\t{frame}")?;
        }
        Ok(())
    }
}

/// A live inventory of open resources, keyed by handle identity.
///
/// Register one as a listener on a
/// [`ProxyFactory`](crate::ProxyFactory) and query it at any time. All
/// bookkeeping happens inline on the thread performing the wrapped call;
/// the per-kind maps are internally synchronized, so the tracker is shared
/// freely across threads. Its event handlers never panic and never error:
/// bookkeeping must not break the caller's resource usage.
#[derive(Debug, Default)]
pub struct OpenResourceTracker {
    connections: DashMap<HandleId, CreationInfo>,
    commands: DashMap<HandleId, CreationInfo>,
    row_streams: DashMap<HandleId, CreationInfo>,
    capture: CaptureFilter,
}

impl OpenResourceTracker {
    /// A tracker capturing the default number of call-site frames.
    pub fn new() -> Self {
        Self::default()
    }

    /// A tracker keeping up to `max_frames` call-site frames per creation.
    /// `0` disables capture.
    pub fn with_max_frames(max_frames: usize) -> Self {
        OpenResourceTracker {
            capture: CaptureFilter::new(max_frames),
            ..Self::default()
        }
    }

    /// The configured call-site frame limit.
    pub fn max_frames(&self) -> usize {
        self.capture.max_frames()
    }

    fn record(
        &self,
        map: &DashMap<HandleId, CreationInfo>,
        kind: ResourceKind,
        handle: &HandleRef,
        role: Option<CommandRole>,
    ) {
        let info = CreationInfo::new(handle.clone(), self.capture.capture(), role);
        trace!(
            target: "spillway::tracker",
            kind = %kind,
            id = %handle.id(),
            "resource now tracked as open"
        );
        map.insert(handle.id(), info);
    }

    fn forget(&self, map: &DashMap<HandleId, CreationInfo>, kind: ResourceKind, handle: &HandleRef) {
        // Absent entries are benign: a close for something never tracked
        // (or already removed) must not error.
        if map.remove(&handle.id()).is_some() {
            trace!(
                target: "spillway::tracker",
                kind = %kind,
                id = %handle.id(),
                "resource no longer tracked"
            );
        }
    }

    fn copy(map: &DashMap<HandleId, CreationInfo>) -> HashMap<HandleId, CreationInfo> {
        map.iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// A point-in-time copy of the open set for `kind`.
    ///
    /// The copy is immutable and safe to iterate while the live maps keep
    /// mutating. Sources are never tracked, so
    /// `snapshot(ResourceKind::Source)` is always empty.
    pub fn snapshot(&self, kind: ResourceKind) -> HashMap<HandleId, CreationInfo> {
        match kind {
            ResourceKind::Source => HashMap::new(),
            ResourceKind::Connection => Self::copy(&self.connections),
            ResourceKind::Command => Self::copy(&self.commands),
            ResourceKind::RowStream => Self::copy(&self.row_streams),
        }
    }

    /// Currently open connections.
    pub fn open_connections(&self) -> HashMap<HandleId, CreationInfo> {
        self.snapshot(ResourceKind::Connection)
    }

    /// Currently open commands.
    pub fn open_commands(&self) -> HashMap<HandleId, CreationInfo> {
        self.snapshot(ResourceKind::Command)
    }

    /// Currently open row-streams.
    pub fn open_row_streams(&self) -> HashMap<HandleId, CreationInfo> {
        self.snapshot(ResourceKind::RowStream)
    }

    /// Number of currently open resources of `kind`.
    pub fn open_count(&self, kind: ResourceKind) -> usize {
        match kind {
            ResourceKind::Source => 0,
            ResourceKind::Connection => self.connections.len(),
            ResourceKind::Command => self.commands.len(),
            ResourceKind::RowStream => self.row_streams.len(),
        }
    }
}

impl ResourceLifecycleListener for OpenResourceTracker {
    fn connection_created(&self, connection: &HandleRef) {
        self.record(&self.connections, ResourceKind::Connection, connection, None);
    }

    fn connection_closed(&self, connection: &HandleRef) {
        self.forget(&self.connections, ResourceKind::Connection, connection);
    }

    fn command_created(&self, command: &HandleRef, role: CommandRole) {
        self.record(&self.commands, ResourceKind::Command, command, Some(role));
    }

    fn command_closed(&self, command: &HandleRef) {
        self.forget(&self.commands, ResourceKind::Command, command);
    }

    fn row_stream_created(&self, rows: &HandleRef) {
        self.record(&self.row_streams, ResourceKind::RowStream, rows, None);
    }

    fn row_stream_closed(&self, rows: &HandleRef) {
        self.forget(&self.row_streams, ResourceKind::RowStream, rows);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn handle() -> (Arc<u32>, HandleRef) {
        let h = Arc::new(0u32);
        let r = HandleRef::new(&h);
        (h, r)
    }

    #[test]
    fn created_then_closed_leaves_no_entry() {
        let tracker = OpenResourceTracker::with_max_frames(0);
        let (_h, r) = handle();

        tracker.connection_created(&r);
        assert_eq!(tracker.open_count(ResourceKind::Connection), 1);
        assert!(tracker.open_connections().contains_key(&r.id()));

        tracker.connection_closed(&r);
        assert_eq!(tracker.open_count(ResourceKind::Connection), 0);
    }

    #[test]
    fn closing_an_untracked_handle_is_benign() {
        let tracker = OpenResourceTracker::new();
        let (_h, r) = handle();
        tracker.connection_closed(&r);
        tracker.command_closed(&r);
        tracker.row_stream_closed(&r);
        assert!(tracker.open_connections().is_empty());
    }

    #[test]
    fn kinds_are_tracked_independently() {
        let tracker = OpenResourceTracker::with_max_frames(0);
        let (_hc, conn) = handle();
        let (_hm, cmd) = handle();
        let (_hr, rows) = handle();

        tracker.connection_created(&conn);
        tracker.command_created(&cmd, CommandRole::Parameterized);
        tracker.row_stream_created(&rows);

        assert_eq!(tracker.open_count(ResourceKind::Connection), 1);
        assert_eq!(tracker.open_count(ResourceKind::Command), 1);
        assert_eq!(tracker.open_count(ResourceKind::RowStream), 1);
        assert_eq!(tracker.open_count(ResourceKind::Source), 0);

        // Closing a command does not disturb the other kinds.
        tracker.command_closed(&cmd);
        assert_eq!(tracker.open_count(ResourceKind::Command), 0);
        assert_eq!(tracker.open_count(ResourceKind::Connection), 1);
        assert_eq!(tracker.open_count(ResourceKind::RowStream), 1);
    }

    #[test]
    fn command_records_carry_their_role() {
        let tracker = OpenResourceTracker::with_max_frames(0);
        let (_h, r) = handle();
        tracker.command_created(&r, CommandRole::Callable);
        let snapshot = tracker.open_commands();
        assert_eq!(snapshot[&r.id()].role(), Some(CommandRole::Callable));
    }

    #[test]
    fn source_snapshot_is_always_empty() {
        let tracker = OpenResourceTracker::new();
        assert!(tracker.snapshot(ResourceKind::Source).is_empty());
    }

    #[test]
    fn back_to_back_snapshots_are_equal() {
        let tracker = OpenResourceTracker::with_max_frames(0);
        let (_ha, a) = handle();
        let (_hb, b) = handle();
        tracker.connection_created(&a);
        tracker.connection_created(&b);

        let first = tracker.open_connections();
        let second = tracker.open_connections();
        assert_eq!(first.len(), 2);
        assert_eq!(first, second);
    }

    #[test]
    fn snapshot_is_detached_from_the_live_map() {
        let tracker = OpenResourceTracker::with_max_frames(0);
        let (_h, r) = handle();
        tracker.connection_created(&r);

        let snapshot = tracker.open_connections();
        tracker.connection_closed(&r);
        assert!(snapshot.contains_key(&r.id()));
        assert!(tracker.open_connections().is_empty());
    }

    #[test]
    fn creation_time_brackets_the_producing_call() {
        let before = SystemTime::now();
        let tracker = OpenResourceTracker::with_max_frames(0);
        let (_h, r) = handle();
        tracker.connection_created(&r);
        let after = SystemTime::now();

        let info = &tracker.open_connections()[&r.id()];
        assert!(info.created_at() >= before);
        assert!(info.created_at() <= after);
    }

    #[test]
    fn display_mentions_id_and_age() {
        let tracker = OpenResourceTracker::with_max_frames(0);
        let (_h, r) = handle();
        tracker.connection_created(&r);
        let info = tracker.open_connections()[&r.id()].clone();
        let rendered = info.to_string();
        assert!(rendered.contains(&r.id().to_string()));
        assert!(rendered.contains("opened"));
    }
}
