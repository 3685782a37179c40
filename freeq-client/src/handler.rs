//! Per-connection handler registry.
//!
//! Handlers are keyed by command or numeric (`"PING"`, `"433"`, or one of
//! the synthetic events in [`crate::irc`]). Dispatch runs every handler for
//! a command inline, in registration order, so lines are handled in the
//! order they arrive. A handler that needs to wait must spawn its own task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::conn::Conn;
use crate::irc::Line;

/// Something that reacts to a dispatched line.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, conn: &Conn, line: &Line);
}

impl<F> Handler for F
where
    F: Fn(&Conn, &Line) + Send + Sync + 'static,
{
    fn handle(&self, conn: &Conn, line: &Line) {
        self(conn, line)
    }
}

/// Identifies one registration, for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Entry = (HandlerId, Arc<dyn Handler>);

#[derive(Default)]
pub struct Registry {
    handlers: Mutex<HashMap<String, Vec<Entry>>>,
    next_id: AtomicU64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, handler: impl Handler) -> HandlerId {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock()
            .entry(name.to_ascii_uppercase())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Returns false if the handler was already gone.
    pub fn remove(&self, name: &str, id: HandlerId) -> bool {
        let key = name.to_ascii_uppercase();
        let mut handlers = self.handlers.lock();
        let Some(set) = handlers.get_mut(&key) else {
            return false;
        };
        let before = set.len();
        set.retain(|(h, _)| *h != id);
        let removed = set.len() != before;
        if set.is_empty() {
            handlers.remove(&key);
        }
        removed
    }

    /// Number of handlers registered for `name`.
    pub fn count(&self, name: &str) -> usize {
        self.handlers
            .lock()
            .get(&name.to_ascii_uppercase())
            .map_or(0, Vec::len)
    }

    /// Run every handler registered for `line.cmd`. Returns how many ran.
    ///
    /// The handler set is snapshotted first, so handlers may register or
    /// remove handlers without deadlocking.
    pub fn dispatch(&self, conn: &Conn, line: &Line) -> usize {
        let snapshot: Vec<Arc<dyn Handler>> = self
            .handlers
            .lock()
            .get(&line.cmd.to_ascii_uppercase())
            .map(|set| set.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default();
        for handler in &snapshot {
            handler.handle(conn, line);
        }
        snapshot.len()
    }
}

/// Removes its handler from the registry when dropped.
#[must_use = "the handler is removed as soon as the guard is dropped"]
pub struct HandlerGuard {
    registry: Weak<Registry>,
    name: String,
    id: HandlerId,
}

impl HandlerGuard {
    pub(crate) fn new(registry: &Arc<Registry>, name: &str, id: HandlerId) -> Self {
        Self {
            registry: Arc::downgrade(registry),
            name: name.to_string(),
            id,
        }
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.name, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Handler) {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        (hits, move |_: &Conn, _: &Line| {
            h.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn dispatch_reaches_every_handler_for_command() {
        let (conn, _out) = Conn::new(Config::new("bob"));
        let registry = Registry::new();
        let (a, ha) = counter();
        let (b, hb) = counter();
        registry.add("privmsg", ha);
        registry.add("PRIVMSG", hb);

        let line = Line::parse(":x!y@z PRIVMSG #c :hi").unwrap();
        assert_eq!(registry.dispatch(&conn, &line), 2);
        assert_eq!(a.load(Ordering::SeqCst), 1);
        assert_eq!(b.load(Ordering::SeqCst), 1);

        assert_eq!(registry.dispatch(&conn, &Line::new("NOTICE")), 0);
    }

    #[test]
    fn removed_handler_is_not_called() {
        let (conn, _out) = Conn::new(Config::new("bob"));
        let registry = Registry::new();
        let (hits, h) = counter();
        let id = registry.add("JOIN", h);
        assert!(registry.remove("join", id));
        assert!(!registry.remove("JOIN", id));
        assert_eq!(registry.count("JOIN"), 0);

        registry.dispatch(&conn, &Line::new("JOIN"));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn handler_may_register_during_dispatch() {
        let (conn, _out) = Conn::new(Config::new("bob"));
        let registry = Arc::new(Registry::new());
        let inner = Arc::clone(&registry);
        registry.add("JOIN", move |_: &Conn, _: &Line| {
            inner.add("PART", |_: &Conn, _: &Line| {});
        });

        registry.dispatch(&conn, &Line::new("JOIN"));
        assert_eq!(registry.count("PART"), 1);
    }

    #[test]
    fn guard_removes_on_drop() {
        let registry = Arc::new(Registry::new());
        let id = registry.add("CAP", |_: &Conn, _: &Line| {});
        let guard = HandlerGuard::new(&registry, "CAP", id);
        assert_eq!(registry.count("CAP"), 1);
        drop(guard);
        assert_eq!(registry.count("CAP"), 0);
    }
}
