//! Resource kinds, handle identity, and the capability contracts
//!
//! This module defines the vocabulary the rest of the crate speaks: the
//! closed set of [`ResourceKind`]s, the [`CommandRole`] sub-role tag, the
//! identity types ([`HandleId`], [`HandleRef`]) used to track live handles
//! without owning them, and the four capability traits a driver implements
//! so its handles can be instrumented.
//!
//! Identity is deliberately *not* equality: two pooled connections may be
//! indistinguishable by value while being distinct resources. A [`HandleId`]
//! is derived from the address of the handle's shared allocation, and a
//! [`HandleRef`] holds a weak reference to that allocation, which keeps the
//! address from being reused for as long as anyone still refers to the id.
//!
//! # Examples
//!
//! ```
//! use spillway::{HandleRef, ResourceKind};
//! use std::sync::Arc;
//!
//! let a = Arc::new(String::from("left"));
//! let b = Arc::new(String::from("left"));
//!
//! // Equal by value, distinct by identity.
//! assert_eq!(*a, *b);
//! assert_ne!(HandleRef::new(&a).id(), HandleRef::new(&b).id());
//! assert_eq!(ResourceKind::Connection.to_string(), "connection");
//! ```

use std::any::Any;
use std::fmt;
use std::sync::{Arc, Weak};

/// The closed set of resource roles the interception layer understands.
///
/// The ordering is hierarchical (a source produces connections, a connection
/// produces commands, a command produces row-streams), but each kind's
/// interception rules are looked up independently; see
/// [`DISPATCH_RULES`](crate::intercept::DISPATCH_RULES).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ResourceKind {
    /// A factory of connections. Sources themselves are not tracked.
    Source,
    /// A pooled connection produced by a source.
    Connection,
    /// A command produced by a connection.
    Command,
    /// A stream of rows produced by a command. Terminal; produces nothing.
    RowStream,
}

impl ResourceKind {
    /// All kinds, in hierarchical order.
    pub const ALL: [ResourceKind; 4] = [
        ResourceKind::Source,
        ResourceKind::Connection,
        ResourceKind::Command,
        ResourceKind::RowStream,
    ];

    /// Short lowercase name, as used in log fields.
    pub fn name(self) -> &'static str {
        match self {
            ResourceKind::Source => "source",
            ResourceKind::Connection => "connection",
            ResourceKind::Command => "command",
            ResourceKind::RowStream => "row-stream",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Sub-role of a command handle.
///
/// A connection's producing operations may hand back commands of differing
/// specificity. Rather than inspecting runtime types, the concrete handle
/// declares its own role via [`Command::role`]; `Plain` is the least
/// specific and the default when a driver does not say otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum CommandRole {
    /// An ordinary, unparameterized command.
    #[default]
    Plain,
    /// A parameterized (prepared) command.
    Parameterized,
    /// A callable (stored-procedure style) command.
    Callable,
}

impl fmt::Display for CommandRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandRole::Plain => "plain",
            CommandRole::Parameterized => "parameterized",
            CommandRole::Callable => "callable",
        };
        f.write_str(name)
    }
}

/// Stable identity of a live handle.
///
/// Derived from the address of the handle's shared allocation. Two ids are
/// equal exactly when they name the same live handle; an id is never reused
/// while any [`HandleRef`] for it is still held, because the weak reference
/// inside the `HandleRef` pins the allocation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(usize);

impl HandleId {
    fn of<T: ?Sized>(handle: &Arc<T>) -> Self {
        HandleId(Arc::as_ptr(handle).cast::<()>() as usize)
    }

    /// The raw address value, for logging and ad-hoc correlation.
    pub fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleId({:#x})", self.0)
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// A non-owning, identity-bearing reference to an underlying handle.
///
/// This is what lifecycle events carry and what the tracker stores: it names
/// the resource without controlling its lifetime. Upgrading yields the
/// underlying handle as `Arc<dyn Any>` while the resource is still alive.
#[derive(Clone)]
pub struct HandleRef {
    id: HandleId,
    handle: Weak<dyn Any + Send + Sync>,
}

impl HandleRef {
    /// Build a reference to the given shared handle.
    ///
    /// Wrappers call this at the moment a produced handle is first wrapped;
    /// custom sinks and tests may also build refs for handles of their own.
    pub fn new<T: Any + Send + Sync>(handle: &Arc<T>) -> Self {
        let weak = Arc::downgrade(handle);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        HandleRef {
            id: HandleId::of(handle),
            handle: weak,
        }
    }

    /// The identity this reference names.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Upgrade to the underlying handle, if it is still alive.
    pub fn upgrade(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.handle.upgrade()
    }

    /// Whether the underlying handle is still alive.
    pub fn is_alive(&self) -> bool {
        self.handle.strong_count() > 0
    }
}

impl fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleRef")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// A factory of connections.
///
/// Implementors are the outermost boundary of the resource hierarchy; wrap
/// one with [`ProxyFactory::wrap_source`](crate::ProxyFactory::wrap_source)
/// and every connection it yields (and everything those yield in turn) is
/// instrumented automatically.
pub trait Source: Send + Sync + 'static {
    /// The connection type this source produces.
    type Conn: Connection;
    /// The driver's error type. Propagated untouched by wrappers.
    type Error;

    /// Produce a new connection.
    fn connect(&self) -> Result<Self::Conn, Self::Error>;

    /// A human-readable name for this source. Not intercepted.
    fn name(&self) -> &str;
}

/// A pooled connection.
pub trait Connection: Send + Sync + 'static {
    /// The command type this connection produces.
    type Cmd: Command;
    /// The driver's error type. Propagated untouched by wrappers.
    type Error;

    /// Produce a plain command for the given text.
    fn command(&self, text: &str) -> Result<Self::Cmd, Self::Error>;

    /// Produce a parameterized command for the given text.
    fn prepare(&self, text: &str) -> Result<Self::Cmd, Self::Error>;

    /// Release this connection. The designated closing operation.
    fn close(&self) -> Result<(), Self::Error>;

    /// Whether this connection is still open. Not intercepted.
    fn is_open(&self) -> bool;
}

/// A command produced by a connection.
pub trait Command: Send + Sync + 'static {
    /// The row-stream type this command produces.
    type Rows: RowStream;
    /// The driver's error type. Propagated untouched by wrappers.
    type Error;

    /// The sub-role this handle was created with. Defaults to the least
    /// specific role when a driver does not declare one.
    fn role(&self) -> CommandRole {
        CommandRole::Plain
    }

    /// Execute, producing a stream of rows.
    fn query(&self) -> Result<Self::Rows, Self::Error>;

    /// Execute without producing rows, returning an affected-row count.
    /// Not intercepted.
    fn execute(&self) -> Result<u64, Self::Error>;

    /// Release this command. The designated closing operation.
    fn close(&self) -> Result<(), Self::Error>;
}

/// A stream of rows. Terminal: produces no further resources.
pub trait RowStream: Send + Sync + 'static {
    /// The driver's error type. Propagated untouched by wrappers.
    type Error;

    /// Advance to the next row, returning whether one was available.
    /// Not intercepted.
    fn advance(&self) -> Result<bool, Self::Error>;

    /// Release this stream. The designated closing operation.
    fn close(&self) -> Result<(), Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distinct_allocations_have_distinct_ids() {
        let a = Arc::new(1u8);
        let b = Arc::new(1u8);
        assert_ne!(HandleRef::new(&a).id(), HandleRef::new(&b).id());
    }

    #[test]
    fn clones_of_one_allocation_share_an_id() {
        let a = Arc::new(String::from("x"));
        let b = Arc::clone(&a);
        assert_eq!(HandleRef::new(&a).id(), HandleRef::new(&b).id());
    }

    #[test]
    fn handle_ref_upgrades_while_alive() {
        let a = Arc::new(42u32);
        let r = HandleRef::new(&a);
        assert!(r.is_alive());
        let upgraded = r.upgrade().unwrap();
        assert_eq!(upgraded.downcast_ref::<u32>(), Some(&42));
        drop(upgraded);
        drop(a);
        assert!(!r.is_alive());
        assert!(r.upgrade().is_none());
    }

    #[test]
    fn id_is_not_reused_while_a_ref_is_held() {
        let a = Arc::new(7u64);
        let r = HandleRef::new(&a);
        let id = r.id();
        drop(a);
        // The weak ref pins the allocation, so a fresh handle cannot land
        // on the same address while `r` lives.
        let b = Arc::new(7u64);
        assert_ne!(HandleRef::new(&b).id(), id);
        drop(r);
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(ResourceKind::RowStream.name(), "row-stream");
        assert_eq!(format!("{}", ResourceKind::Command), "command");
        assert_eq!(CommandRole::default(), CommandRole::Plain);
    }
}
