//! # Spillway
//!
//! > *"Watch where the water goes"*
//!
//! A Rust library for transparent lifecycle instrumentation of pooled,
//! handle-based resources: wrap a source once at the boundary and every
//! connection, command, and row-stream flowing out of it is observed —
//! created events when they are produced, closed events when they are
//! released — without changing a single call site.
//!
//! ## Philosophy
//!
//! **Spillway** separates *observing* from *deciding*:
//! - The interception layer never alters a wrapped call: same arguments,
//!   same return values, same errors.
//! - The tracker keeps an accurate inventory of what is open and where it
//!   was opened; whether something has leaked is the hosting application's
//!   call.
//!
//! ## Quick Example
//!
//! ```rust
//! use spillway::testing::MemorySource;
//! use spillway::{
//!     Command, Connection, OpenResourceTracker, ProxyFactory, ResourceKind, RowStream, Source,
//! };
//! use std::sync::Arc;
//!
//! let factory = ProxyFactory::new();
//! let tracker = Arc::new(OpenResourceTracker::new());
//! factory.add_listener(tracker.clone());
//!
//! let source = factory.wrap_source(MemorySource::new("orders-db"));
//!
//! let conn = source.connect()?;
//! let cmd = conn.prepare("select * from orders where id = ?")?;
//! let rows = cmd.query()?;
//!
//! // Everything produced through the wrapped source is inventoried.
//! assert_eq!(tracker.open_count(ResourceKind::Connection), 1);
//! assert_eq!(tracker.open_count(ResourceKind::Command), 1);
//! assert_eq!(tracker.open_count(ResourceKind::RowStream), 1);
//!
//! // Closed resources disappear from the inventory; anything left behind
//! // in a long-running service is a leak candidate, complete with the
//! // call site that opened it.
//! rows.close()?;
//! cmd.close()?;
//! for info in tracker.open_connections().values() {
//!     println!("still open: {info}");
//! }
//! conn.close()?;
//! assert_eq!(tracker.open_count(ResourceKind::Connection), 0);
//! # Ok::<(), spillway::testing::MemoryError>(())
//! ```
//!
//! ## Guarantees
//!
//! - Exactly one created event per produced handle, at most one closed
//!   event, and closed only after the underlying close returned `Ok`.
//! - A failed close propagates the driver's error untouched and emits
//!   nothing: for leak tracking, a missed close is safer than a false one.
//! - Tracking is keyed by handle *identity*, never by value, so equal but
//!   distinct pooled handles are never confused.
//! - All bookkeeping is internally synchronized; wrapped handles and the
//!   tracker may be used from any number of threads.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod capture;
pub mod handle;
pub mod intercept;
pub mod sink;
pub mod testing;
pub mod tracker;

pub use capture::{CaptureFilter, Frame, DEFAULT_MAX_FRAMES};
pub use handle::{
    Command, CommandRole, Connection, HandleId, HandleRef, ResourceKind, RowStream, Source,
};
pub use intercept::{
    rules_for, KindRules, ProxyFactory, TrackedCommand, TrackedConnection, TrackedRows,
    TrackedSource, DISPATCH_RULES,
};
pub use sink::{ListenerRegistry, ResourceLifecycleListener};
pub use tracker::{CreationInfo, OpenResourceTracker};

/// Commonly used items, importable in one line.
pub mod prelude {
    pub use crate::capture::{CaptureFilter, Frame};
    pub use crate::handle::{
        Command, CommandRole, Connection, HandleId, HandleRef, ResourceKind, RowStream, Source,
    };
    pub use crate::intercept::ProxyFactory;
    pub use crate::sink::ResourceLifecycleListener;
    pub use crate::tracker::{CreationInfo, OpenResourceTracker};
}
