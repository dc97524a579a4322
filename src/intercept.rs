//! Transparent interception of resource hierarchies
//!
//! [`ProxyFactory::wrap_source`] wraps a [`Source`] once at the boundary;
//! from then on every connection it yields, every command those yield, and
//! every row-stream those yield comes back wrapped, with a created event
//! published at each production and a closed event published after each
//! successful close. Nothing else about the calls changes: arguments,
//! return values, and errors pass through exactly as the underlying driver
//! produced them.
//!
//! Instead of runtime proxying, each resource kind has an explicit wrapper
//! type implementing the same capability trait as the handle it wraps. The
//! intercepted operations — producing and closing, per [`DISPATCH_RULES`] —
//! are enumerated statically; everything else is plain delegation, checked
//! by the compiler.
//!
//! Wrapping happens only at the moment a call produces a handle (or at the
//! factory's explicit wrap entry points), so each underlying handle gets
//! exactly one wrapper and exactly one created event. A wrapper never
//! exposes the handle it wraps.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::trace;

use crate::handle::{
    Command, CommandRole, Connection, HandleId, HandleRef, ResourceKind, RowStream, Source,
};
use crate::sink::{ListenerRegistry, ResourceLifecycleListener};

/// Interception rules for one resource kind: which operations produce a
/// wrappable resource, and which single operation closes the resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KindRules {
    /// The kind these rules describe.
    pub kind: ResourceKind,
    /// The kind this kind's producing operations yield, if any.
    pub produces: Option<ResourceKind>,
    /// Names of the producing operations.
    pub producing_ops: &'static [&'static str],
    /// Name of the designated closing operation, if the kind has one.
    pub closing_op: Option<&'static str>,
}

/// The fixed dispatch rules, one entry per kind in hierarchical order.
///
/// The wrapper types statically enumerate exactly these operations; the
/// table is the declarative rendition consumed for log fields and checked
/// against the trait surface by tests.
pub const DISPATCH_RULES: [KindRules; 4] = [
    KindRules {
        kind: ResourceKind::Source,
        produces: Some(ResourceKind::Connection),
        producing_ops: &["connect"],
        closing_op: None,
    },
    KindRules {
        kind: ResourceKind::Connection,
        produces: Some(ResourceKind::Command),
        producing_ops: &["command", "prepare"],
        closing_op: Some("close"),
    },
    KindRules {
        kind: ResourceKind::Command,
        produces: Some(ResourceKind::RowStream),
        producing_ops: &["query"],
        closing_op: Some("close"),
    },
    KindRules {
        kind: ResourceKind::RowStream,
        produces: None,
        producing_ops: &[],
        closing_op: Some("close"),
    },
];

/// The dispatch rules for `kind`.
pub fn rules_for(kind: ResourceKind) -> &'static KindRules {
    match kind {
        ResourceKind::Source => &DISPATCH_RULES[0],
        ResourceKind::Connection => &DISPATCH_RULES[1],
        ResourceKind::Command => &DISPATCH_RULES[2],
        ResourceKind::RowStream => &DISPATCH_RULES[3],
    }
}

fn log_created(kind: ResourceKind, op: &'static str, handle: &HandleRef) {
    trace!(
        target: "spillway::intercept",
        kind = %kind,
        op,
        id = %handle.id(),
        "resource created"
    );
}

fn log_closed(kind: ResourceKind, handle: &HandleRef) {
    if let Some(op) = rules_for(kind).closing_op {
        trace!(
            target: "spillway::intercept",
            kind = %kind,
            op,
            id = %handle.id(),
            "resource closed"
        );
    }
}

/// Entry point of the interception layer.
///
/// Owns the listener registry that every wrapper it creates publishes to.
/// Construct one per instrumented boundary and register listeners (such as
/// an [`OpenResourceTracker`](crate::OpenResourceTracker)) on it; there is
/// no process-wide state.
///
/// Clones share the same registry.
#[derive(Debug, Clone, Default)]
pub struct ProxyFactory {
    listeners: ListenerRegistry,
}

impl ProxyFactory {
    /// A factory with an empty listener registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a lifecycle listener. Listeners are notified synchronously,
    /// in registration order, on the thread performing the wrapped call.
    pub fn add_listener(&self, listener: Arc<dyn ResourceLifecycleListener>) {
        self.listeners.add(listener);
    }

    /// Unregister a listener previously added with
    /// [`add_listener`](Self::add_listener). Matched by `Arc` identity;
    /// removing a listener that was never registered is a no-op.
    pub fn remove_listener(&self, listener: &Arc<dyn ResourceLifecycleListener>) {
        self.listeners.remove(listener);
    }

    /// Wrap a source at the boundary.
    ///
    /// Sources themselves have no lifecycle events; wrapping one simply
    /// ensures every connection it produces is wrapped and reported.
    pub fn wrap_source<S: Source>(&self, source: S) -> TrackedSource<S> {
        let inner = Arc::new(source);
        trace!(
            target: "spillway::intercept",
            kind = %ResourceKind::Source,
            name = inner.name(),
            "source wrapped"
        );
        TrackedSource {
            inner,
            listeners: self.listeners.clone(),
        }
    }

    /// Wrap a connection obtained outside any wrapped source.
    ///
    /// This is the one place a connection-created event originates, whether
    /// reached through a wrapped source's `connect` or called directly.
    pub fn wrap_connection<C: Connection>(&self, connection: C) -> TrackedConnection<C> {
        track_connection(Arc::new(connection), &self.listeners, "wrap_connection")
    }
}

fn track_connection<C: Connection>(
    inner: Arc<C>,
    listeners: &ListenerRegistry,
    op: &'static str,
) -> TrackedConnection<C> {
    let handle = HandleRef::new(&inner);
    log_created(ResourceKind::Connection, op, &handle);
    listeners.each(|l| l.connection_created(&handle));
    TrackedConnection {
        inner,
        listeners: listeners.clone(),
        closed: AtomicBool::new(false),
    }
}

fn track_command<C: Command>(
    inner: Arc<C>,
    listeners: &ListenerRegistry,
    op: &'static str,
) -> TrackedCommand<C> {
    let handle = HandleRef::new(&inner);
    let role = inner.role();
    log_created(ResourceKind::Command, op, &handle);
    listeners.each(|l| l.command_created(&handle, role));
    TrackedCommand {
        inner,
        listeners: listeners.clone(),
        closed: AtomicBool::new(false),
    }
}

fn track_rows<R: RowStream>(
    inner: Arc<R>,
    listeners: &ListenerRegistry,
    op: &'static str,
) -> TrackedRows<R> {
    let handle = HandleRef::new(&inner);
    log_created(ResourceKind::RowStream, op, &handle);
    listeners.each(|l| l.row_stream_created(&handle));
    TrackedRows {
        inner,
        listeners: listeners.clone(),
        closed: AtomicBool::new(false),
    }
}

/// A wrapped [`Source`]. Produced by [`ProxyFactory::wrap_source`].
pub struct TrackedSource<S: Source> {
    inner: Arc<S>,
    listeners: ListenerRegistry,
}

impl<S: Source> Source for TrackedSource<S> {
    type Conn = TrackedConnection<S::Conn>;
    type Error = S::Error;

    fn connect(&self) -> Result<Self::Conn, Self::Error> {
        let conn = Arc::new(self.inner.connect()?);
        Ok(track_connection(conn, &self.listeners, "connect"))
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

impl<S: Source> fmt::Debug for TrackedSource<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedSource")
            .field("name", &self.inner.name())
            .finish()
    }
}

/// A wrapped [`Connection`].
///
/// Forwards every operation to the connection it wraps; producing
/// operations hand back wrapped commands, and the first successful `close`
/// publishes the closed event for the underlying handle.
pub struct TrackedConnection<C: Connection> {
    inner: Arc<C>,
    listeners: ListenerRegistry,
    closed: AtomicBool,
}

impl<C: Connection> Connection for TrackedConnection<C> {
    type Cmd = TrackedCommand<C::Cmd>;
    type Error = C::Error;

    fn command(&self, text: &str) -> Result<Self::Cmd, Self::Error> {
        let cmd = Arc::new(self.inner.command(text)?);
        Ok(track_command(cmd, &self.listeners, "command"))
    }

    fn prepare(&self, text: &str) -> Result<Self::Cmd, Self::Error> {
        let cmd = Arc::new(self.inner.prepare(text)?);
        Ok(track_command(cmd, &self.listeners, "prepare"))
    }

    fn close(&self) -> Result<(), Self::Error> {
        // Forward first: a failed close propagates untouched and emits
        // nothing, leaving the resource presumed open.
        self.inner.close()?;
        if !self.closed.swap(true, Ordering::AcqRel) {
            let handle = HandleRef::new(&self.inner);
            log_closed(ResourceKind::Connection, &handle);
            self.listeners.each(|l| l.connection_closed(&handle));
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.inner.is_open()
    }
}

impl<C: Connection> fmt::Debug for TrackedConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedConnection")
            .field("id", &HandleRef::new(&self.inner).id())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// A wrapped [`Command`].
pub struct TrackedCommand<C: Command> {
    inner: Arc<C>,
    listeners: ListenerRegistry,
    closed: AtomicBool,
}

impl<C: Command> Command for TrackedCommand<C> {
    type Rows = TrackedRows<C::Rows>;
    type Error = C::Error;

    fn role(&self) -> CommandRole {
        self.inner.role()
    }

    fn query(&self) -> Result<Self::Rows, Self::Error> {
        let rows = Arc::new(self.inner.query()?);
        Ok(track_rows(rows, &self.listeners, "query"))
    }

    fn execute(&self) -> Result<u64, Self::Error> {
        self.inner.execute()
    }

    fn close(&self) -> Result<(), Self::Error> {
        self.inner.close()?;
        if !self.closed.swap(true, Ordering::AcqRel) {
            let handle = HandleRef::new(&self.inner);
            log_closed(ResourceKind::Command, &handle);
            self.listeners.each(|l| l.command_closed(&handle));
        }
        Ok(())
    }
}

impl<C: Command> fmt::Debug for TrackedCommand<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedCommand")
            .field("id", &HandleRef::new(&self.inner).id())
            .field("role", &self.inner.role())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// A wrapped [`RowStream`]. Terminal: intercepts only its close.
pub struct TrackedRows<R: RowStream> {
    inner: Arc<R>,
    listeners: ListenerRegistry,
    closed: AtomicBool,
}

impl<R: RowStream> RowStream for TrackedRows<R> {
    type Error = R::Error;

    fn advance(&self) -> Result<bool, Self::Error> {
        self.inner.advance()
    }

    fn close(&self) -> Result<(), Self::Error> {
        self.inner.close()?;
        if !self.closed.swap(true, Ordering::AcqRel) {
            let handle = HandleRef::new(&self.inner);
            log_closed(ResourceKind::RowStream, &handle);
            self.listeners.each(|l| l.row_stream_closed(&handle));
        }
        Ok(())
    }
}

impl<R: RowStream> fmt::Debug for TrackedRows<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrackedRows")
            .field("id", &HandleRef::new(&self.inner).id())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish()
    }
}

/// The identity a wrapper's events are keyed by: that of the *underlying*
/// handle, not the wrapper. Exposed for tests and diagnostics.
pub fn tracked_id<T: Send + Sync + 'static>(handle: &Arc<T>) -> HandleId {
    HandleRef::new(handle).id()
}
