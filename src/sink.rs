//! Lifecycle event sink and listener fan-out
//!
//! The interception layer publishes lifecycle events to any number of
//! [`ResourceLifecycleListener`]s through a [`ListenerRegistry`]. Dispatch is
//! synchronous, on the thread performing the wrapped call, in registration
//! order.
//!
//! Every listener method has a default empty body, so a collaborator only
//! overrides the events it cares about:
//!
//! ```
//! use spillway::{HandleRef, ResourceLifecycleListener};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! #[derive(Default)]
//! struct ConnectionCounter(AtomicUsize);
//!
//! impl ResourceLifecycleListener for ConnectionCounter {
//!     fn connection_created(&self, _connection: &HandleRef) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::handle::{CommandRole, HandleRef};

/// Observer of resource lifecycle events.
///
/// Six notifications: created/closed for each of the three produced kinds.
/// Sources are the boundary being wrapped and have no events of their own.
/// The default bodies do nothing, which makes the trait its own no-op
/// adapter.
///
/// Implementations must not panic: they run inline with the caller's
/// resource usage.
#[allow(unused_variables)]
pub trait ResourceLifecycleListener: Send + Sync {
    /// A connection was produced and wrapped.
    fn connection_created(&self, connection: &HandleRef) {}

    /// A connection's close call completed successfully.
    fn connection_closed(&self, connection: &HandleRef) {}

    /// A command was produced and wrapped, with the sub-role its concrete
    /// handle declared.
    fn command_created(&self, command: &HandleRef, role: CommandRole) {}

    /// A command's close call completed successfully.
    fn command_closed(&self, command: &HandleRef) {}

    /// A row-stream was produced and wrapped.
    fn row_stream_created(&self, rows: &HandleRef) {}

    /// A row-stream's close call completed successfully.
    fn row_stream_closed(&self, rows: &HandleRef) {}
}

/// An ordered, shared list of listeners.
///
/// Cloning is cheap and clones observe the same list. Removal matches by
/// `Arc` identity and removing a listener that was never added is a no-op.
/// Dispatch iterates a snapshot of the list, so listeners may be added or
/// removed while an event is in flight; delivery to listeners added
/// mid-dispatch is unspecified.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
    listeners: Arc<RwLock<Vec<Arc<dyn ResourceLifecycleListener>>>>,
}

impl ListenerRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a listener. Listeners are notified in the order they were
    /// added; adding the same listener twice notifies it twice.
    pub fn add(&self, listener: Arc<dyn ResourceLifecycleListener>) {
        self.listeners.write().push(listener);
    }

    /// Remove the first occurrence of `listener`, matched by identity.
    /// A no-op when the listener is not registered.
    pub fn remove(&self, listener: &Arc<dyn ResourceLifecycleListener>) {
        let mut listeners = self.listeners.write();
        if let Some(pos) = listeners.iter().position(|l| Arc::ptr_eq(l, listener)) {
            listeners.remove(pos);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Whether no listeners are registered.
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Invoke `f` for every listener registered at the moment of the call.
    ///
    /// The list is cloned out of the lock first, so `f` (and the listeners
    /// it calls) may re-enter the registry freely.
    pub(crate) fn each<F>(&self, f: F)
    where
        F: Fn(&dyn ResourceLifecycleListener),
    {
        let snapshot: Vec<Arc<dyn ResourceLifecycleListener>> = self.listeners.read().clone();
        for listener in &snapshot {
            f(listener.as_ref());
        }
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct Tagged {
        tag: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl ResourceLifecycleListener for Tagged {
        fn connection_created(&self, _connection: &HandleRef) {
            self.log.lock().push(self.tag);
        }
    }

    fn dummy_ref() -> (Arc<u8>, HandleRef) {
        let handle = Arc::new(0u8);
        let r = HandleRef::new(&handle);
        (handle, r)
    }

    #[test]
    fn dispatch_runs_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        registry.add(Arc::new(Tagged {
            tag: "first",
            log: log.clone(),
        }));
        registry.add(Arc::new(Tagged {
            tag: "second",
            log: log.clone(),
        }));

        let (_h, r) = dummy_ref();
        registry.each(|l| l.connection_created(&r));
        assert_eq!(*log.lock(), vec!["first", "second"]);
    }

    #[test]
    fn removed_listener_is_not_notified() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        let listener: Arc<dyn ResourceLifecycleListener> = Arc::new(Tagged {
            tag: "gone",
            log: log.clone(),
        });
        registry.add(listener.clone());
        registry.remove(&listener);

        let (_h, r) = dummy_ref();
        registry.each(|l| l.connection_created(&r));
        assert!(log.lock().is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn removing_an_unregistered_listener_is_a_no_op() {
        let registry = ListenerRegistry::new();
        let listener: Arc<dyn ResourceLifecycleListener> = Arc::new(Tagged {
            tag: "never",
            log: Arc::new(Mutex::new(Vec::new())),
        });
        registry.remove(&listener);
        registry.remove(&listener);
        assert_eq!(registry.len(), 0);
    }

    #[test]
    fn remove_drops_a_single_occurrence() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        let listener: Arc<dyn ResourceLifecycleListener> = Arc::new(Tagged {
            tag: "twice",
            log: log.clone(),
        });
        registry.add(listener.clone());
        registry.add(listener.clone());
        registry.remove(&listener);

        let (_h, r) = dummy_ref();
        registry.each(|l| l.connection_created(&r));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn listeners_may_mutate_the_registry_mid_dispatch() {
        struct SelfRemover {
            registry: ListenerRegistry,
            me: Mutex<Option<Arc<dyn ResourceLifecycleListener>>>,
        }

        impl ResourceLifecycleListener for SelfRemover {
            fn connection_created(&self, _connection: &HandleRef) {
                if let Some(me) = self.me.lock().take() {
                    self.registry.remove(&me);
                }
            }
        }

        let registry = ListenerRegistry::new();
        let remover = Arc::new(SelfRemover {
            registry: registry.clone(),
            me: Mutex::new(None),
        });
        let as_dyn: Arc<dyn ResourceLifecycleListener> = remover.clone();
        *remover.me.lock() = Some(as_dyn.clone());
        registry.add(as_dyn);

        let (_h, r) = dummy_ref();
        // Must neither deadlock nor error.
        registry.each(|l| l.connection_created(&r));
        assert!(registry.is_empty());
    }
}
