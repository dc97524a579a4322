//! In-memory driver and test listeners
//!
//! A minimal driver whose handles satisfy the capability contracts without
//! any real I/O, plus a listener that records every event it sees. Used by
//! this crate's own tests and available to hosting applications for theirs.
//!
//! # Examples
//!
//! ```
//! use spillway::testing::{MemorySource, RecordingListener};
//! use spillway::{Connection, ProxyFactory, Source};
//! use std::sync::Arc;
//!
//! let factory = ProxyFactory::new();
//! let listener = Arc::new(RecordingListener::new());
//! factory.add_listener(listener.clone());
//!
//! let source = factory.wrap_source(MemorySource::new("test"));
//! let conn = source.connect()?;
//! let cmd = conn.command("select 1")?;
//! assert_eq!(listener.events().len(), 2); // connection + command created
//! # drop(cmd);
//! # Ok::<(), spillway::testing::MemoryError>(())
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::handle::{
    Command, CommandRole, Connection, HandleId, HandleRef, ResourceKind, RowStream, Source,
};
use crate::sink::ResourceLifecycleListener;

/// Errors the in-memory driver can produce.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    /// An operation was attempted on a closed connection.
    #[error("connection is closed")]
    ConnectionClosed,
    /// An operation was attempted on a closed command.
    #[error("command is closed")]
    CommandClosed,
    /// An operation was attempted on a closed row-stream.
    #[error("row-stream is closed")]
    RowStreamClosed,
    /// Close was rigged to fail for this handle.
    #[error("close failed")]
    CloseFailed,
}

/// An in-memory [`Source`] producing [`MemoryConnection`]s.
#[derive(Debug)]
pub struct MemorySource {
    label: String,
    connects: AtomicUsize,
}

impl MemorySource {
    /// A source with the given display label.
    pub fn new(label: impl Into<String>) -> Self {
        MemorySource {
            label: label.into(),
            connects: AtomicUsize::new(0),
        }
    }

    /// How many connections this source has produced.
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::Relaxed)
    }
}

impl Source for MemorySource {
    type Conn = MemoryConnection;
    type Error = MemoryError;

    fn connect(&self) -> Result<MemoryConnection, MemoryError> {
        self.connects.fetch_add(1, Ordering::Relaxed);
        Ok(MemoryConnection::new())
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// An in-memory [`Connection`].
#[derive(Debug)]
pub struct MemoryConnection {
    open: AtomicBool,
    fail_close: bool,
    fail_command_close: bool,
    fail_rows_close: bool,
}

impl MemoryConnection {
    /// An open connection whose close succeeds.
    pub fn new() -> Self {
        MemoryConnection {
            open: AtomicBool::new(true),
            fail_close: false,
            fail_command_close: false,
            fail_rows_close: false,
        }
    }

    /// An open connection whose close always fails.
    pub fn with_failing_close() -> Self {
        MemoryConnection {
            fail_close: true,
            ..Self::new()
        }
    }

    /// Make every command this connection produces fail its close.
    pub fn with_failing_command_close(mut self) -> Self {
        self.fail_command_close = true;
        self
    }

    /// Make every row-stream produced below this connection fail its close.
    pub fn with_failing_rows_close(mut self) -> Self {
        self.fail_rows_close = true;
        self
    }

    fn build_command(&self, text: &str, role: CommandRole) -> MemoryCommand {
        let mut cmd = MemoryCommand::new(text, role);
        if self.fail_command_close {
            cmd = cmd.with_failing_close();
        }
        if self.fail_rows_close {
            cmd = cmd.with_failing_rows_close();
        }
        cmd
    }
}

impl Default for MemoryConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl Connection for MemoryConnection {
    type Cmd = MemoryCommand;
    type Error = MemoryError;

    fn command(&self, text: &str) -> Result<MemoryCommand, MemoryError> {
        if !self.is_open() {
            return Err(MemoryError::ConnectionClosed);
        }
        Ok(self.build_command(text, CommandRole::Plain))
    }

    fn prepare(&self, text: &str) -> Result<MemoryCommand, MemoryError> {
        if !self.is_open() {
            return Err(MemoryError::ConnectionClosed);
        }
        Ok(self.build_command(text, CommandRole::Parameterized))
    }

    fn close(&self) -> Result<(), MemoryError> {
        if self.fail_close {
            return Err(MemoryError::CloseFailed);
        }
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

/// An in-memory [`Command`].
#[derive(Debug)]
pub struct MemoryCommand {
    text: String,
    role: CommandRole,
    rows: usize,
    open: AtomicBool,
    fail_close: bool,
    fail_rows_close: bool,
}

impl MemoryCommand {
    /// A command over `text` with the given role, yielding three rows.
    pub fn new(text: impl Into<String>, role: CommandRole) -> Self {
        MemoryCommand {
            text: text.into(),
            role,
            rows: 3,
            open: AtomicBool::new(true),
            fail_close: false,
            fail_rows_close: false,
        }
    }

    /// Set the number of rows each query yields.
    pub fn with_rows(mut self, rows: usize) -> Self {
        self.rows = rows;
        self
    }

    /// Make every close attempt fail.
    pub fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }

    /// Make every row-stream this command produces fail its close.
    pub fn with_failing_rows_close(mut self) -> Self {
        self.fail_rows_close = true;
        self
    }

    /// The command text.
    pub fn text(&self) -> &str {
        &self.text
    }
}

impl Command for MemoryCommand {
    type Rows = MemoryRows;
    type Error = MemoryError;

    fn role(&self) -> CommandRole {
        self.role
    }

    fn query(&self) -> Result<MemoryRows, MemoryError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(MemoryError::CommandClosed);
        }
        let rows = MemoryRows::new(self.rows);
        if self.fail_rows_close {
            Ok(rows.with_failing_close())
        } else {
            Ok(rows)
        }
    }

    fn execute(&self) -> Result<u64, MemoryError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(MemoryError::CommandClosed);
        }
        Ok(self.text.len() as u64)
    }

    fn close(&self) -> Result<(), MemoryError> {
        if self.fail_close {
            return Err(MemoryError::CloseFailed);
        }
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

/// An in-memory [`RowStream`] yielding a fixed number of rows.
#[derive(Debug)]
pub struct MemoryRows {
    remaining: AtomicUsize,
    open: AtomicBool,
    fail_close: bool,
}

impl MemoryRows {
    /// A stream of `rows` rows.
    pub fn new(rows: usize) -> Self {
        MemoryRows {
            remaining: AtomicUsize::new(rows),
            open: AtomicBool::new(true),
            fail_close: false,
        }
    }

    /// Make every close attempt fail.
    pub fn with_failing_close(mut self) -> Self {
        self.fail_close = true;
        self
    }
}

impl RowStream for MemoryRows {
    type Error = MemoryError;

    fn advance(&self) -> Result<bool, MemoryError> {
        if !self.open.load(Ordering::Acquire) {
            return Err(MemoryError::RowStreamClosed);
        }
        let advanced = self
            .remaining
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        Ok(advanced)
    }

    fn close(&self) -> Result<(), MemoryError> {
        if self.fail_close {
            return Err(MemoryError::CloseFailed);
        }
        self.open.store(false, Ordering::Release);
        Ok(())
    }
}

/// Which side of a resource's lifecycle an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The resource was produced and wrapped.
    Created,
    /// The resource's close call completed successfully.
    Closed,
}

/// One observed lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// The kind of resource the event concerns.
    pub kind: ResourceKind,
    /// Created or closed.
    pub phase: Phase,
    /// Identity of the underlying handle.
    pub id: HandleId,
    /// The declared sub-role, on command-created events.
    pub role: Option<CommandRole>,
}

/// A listener that records every event it receives, in order.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingListener {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events observed so far, in delivery order.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Events of the given kind and phase.
    pub fn of(&self, kind: ResourceKind, phase: Phase) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind == kind && e.phase == phase)
            .cloned()
            .collect()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(
        &self,
        kind: ResourceKind,
        phase: Phase,
        handle: &HandleRef,
        role: Option<CommandRole>,
    ) {
        self.events.lock().push(RecordedEvent {
            kind,
            phase,
            id: handle.id(),
            role,
        });
    }
}

impl ResourceLifecycleListener for RecordingListener {
    fn connection_created(&self, connection: &HandleRef) {
        self.push(ResourceKind::Connection, Phase::Created, connection, None);
    }

    fn connection_closed(&self, connection: &HandleRef) {
        self.push(ResourceKind::Connection, Phase::Closed, connection, None);
    }

    fn command_created(&self, command: &HandleRef, role: CommandRole) {
        self.push(ResourceKind::Command, Phase::Created, command, Some(role));
    }

    fn command_closed(&self, command: &HandleRef) {
        self.push(ResourceKind::Command, Phase::Closed, command, None);
    }

    fn row_stream_created(&self, rows: &HandleRef) {
        self.push(ResourceKind::RowStream, Phase::Created, rows, None);
    }

    fn row_stream_closed(&self, rows: &HandleRef) {
        self.push(ResourceKind::RowStream, Phase::Closed, rows, None);
    }
}
