//! Listener registry shared by presence events and state-change events.
//!
//! Every registration carries an optional filter; `None` matches every
//! event. One list holds both kinds so unsubscribe behaves the same for each.

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Token identifying a registration, used to unsubscribe. Unique across every
/// registry in the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Receiving end of a registration.
///
/// Dropping it detaches the listener; the registry prunes it on the next emit.
#[derive(Debug)]
pub struct Listener<T> {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Listener<T> {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Receive the next event. Returns `None` once the registration is
    /// removed or its channel released.
    pub async fn next(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Receive an already-delivered event without waiting.
    pub fn try_next(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

struct Entry<K, T> {
    id: ListenerId,
    filter: Option<K>,
    tx: mpsc::UnboundedSender<T>,
}

pub(crate) struct EventEmitter<K, T> {
    entries: Vec<Entry<K, T>>,
}

impl<K: Copy + PartialEq, T: Clone> EventEmitter<K, T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn on(&mut self, filter: Option<K>) -> Listener<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.entries.push(Entry { id, filter, tx });
        Listener { id, rx }
    }

    /// Remove a registration whatever its filter.
    pub fn off(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| e.id != id);
        self.entries.len() != before
    }

    /// Remove a registration only if it was made with exactly `filter`.
    pub fn off_filtered(&mut self, filter: Option<K>, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !(e.id == id && e.filter == filter));
        self.entries.len() != before
    }

    pub fn off_all(&mut self) {
        self.entries.clear();
    }

    /// Deliver `event` to every matching listener, in registration order.
    pub fn emit(&mut self, key: K, event: &T) {
        self.entries.retain(|e| {
            if e.filter.is_some_and(|f| f != key) {
                return !e.tx.is_closed();
            }
            e.tx.send(event.clone()).is_ok()
        });
    }

    /// Registrations made with exactly `filter`.
    pub fn count(&self, filter: Option<K>) -> usize {
        self.entries
            .iter()
            .filter(|e| e.filter == filter && !e.tx.is_closed())
            .count()
    }
}

impl<K: Copy + PartialEq, T: Clone> Default for EventEmitter<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Kind {
        A,
        B,
    }

    #[test]
    fn any_listener_receives_everything() {
        let mut emitter: EventEmitter<Kind, u32> = EventEmitter::new();
        let mut any = emitter.on(None);
        emitter.emit(Kind::A, &1);
        emitter.emit(Kind::B, &2);
        assert_eq!(any.try_next(), Some(1));
        assert_eq!(any.try_next(), Some(2));
        assert_eq!(any.try_next(), None);
    }

    #[test]
    fn filtered_listener_receives_matching_only() {
        let mut emitter: EventEmitter<Kind, u32> = EventEmitter::new();
        let mut only_b = emitter.on(Some(Kind::B));
        emitter.emit(Kind::A, &1);
        emitter.emit(Kind::B, &2);
        assert_eq!(only_b.try_next(), Some(2));
        assert_eq!(only_b.try_next(), None);
    }

    #[test]
    fn off_removes_regardless_of_filter() {
        let mut emitter: EventEmitter<Kind, u32> = EventEmitter::new();
        let listener = emitter.on(Some(Kind::A));
        assert_eq!(emitter.count(Some(Kind::A)), 1);
        assert!(emitter.off(listener.id()));
        assert_eq!(emitter.count(Some(Kind::A)), 0);
        // Already gone: no-op.
        assert!(!emitter.off(listener.id()));
    }

    #[test]
    fn off_filtered_requires_matching_filter() {
        let mut emitter: EventEmitter<Kind, u32> = EventEmitter::new();
        let listener = emitter.on(Some(Kind::A));
        assert!(!emitter.off_filtered(Some(Kind::B), listener.id()));
        assert!(!emitter.off_filtered(None, listener.id()));
        assert_eq!(emitter.count(Some(Kind::A)), 1);
        assert!(emitter.off_filtered(Some(Kind::A), listener.id()));
        assert_eq!(emitter.count(Some(Kind::A)), 0);
    }

    #[test]
    fn removed_listener_stream_ends() {
        let mut emitter: EventEmitter<Kind, u32> = EventEmitter::new();
        let mut listener = emitter.on(None);
        emitter.off_all();
        emitter.emit(Kind::A, &1);
        assert_eq!(listener.try_next(), None);
    }

    #[test]
    fn dropped_listener_is_pruned_on_emit() {
        let mut emitter: EventEmitter<Kind, u32> = EventEmitter::new();
        let kept = emitter.on(None);
        drop(emitter.on(None));
        emitter.emit(Kind::A, &1);
        assert_eq!(emitter.count(None), 1);
        drop(kept);
    }

    #[test]
    fn ids_are_unique() {
        let mut emitter: EventEmitter<Kind, u32> = EventEmitter::new();
        let a = emitter.on(None);
        let b = emitter.on(None);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn ids_do_not_collide_across_registries() {
        let mut first: EventEmitter<Kind, u32> = EventEmitter::new();
        let mut second: EventEmitter<Kind, u32> = EventEmitter::new();
        let a = first.on(None);
        let b = second.on(None);
        assert_ne!(a.id(), b.id());
        assert!(!first.off(b.id()));
        assert!(!second.off(a.id()));
        assert_eq!(first.count(None), 1);
        assert_eq!(second.count(None), 1);
    }
}
