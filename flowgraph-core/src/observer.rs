//! Typed observers with disposer handles.
//!
//! `subscribe` returns a [`Subscription`]; dropping it (or calling
//! [`Subscription::unsubscribe`]) removes the callback. The registry is held
//! weakly by the handle, so a subscription may outlive its source.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Registry<E> {
    next_id: AtomicU64,
    callbacks: Mutex<Vec<(u64, Callback<E>)>>,
}

impl<E> Registry<E> {
    fn remove(&self, id: u64) {
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        callbacks.retain(|(cb_id, _)| *cb_id != id);
    }
}

/// A list of callbacks for events of type `E`.
///
/// Callbacks run synchronously on the emitting thread, after the emitter's
/// state is consistent. They must not call back into the emitter.
pub struct Observers<E> {
    registry: Arc<Registry<E>>,
}

impl<E: 'static> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E: 'static> Observers<E> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry {
                next_id: AtomicU64::new(1),
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        self.registry
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));

        let weak: Weak<Registry<E>> = Arc::downgrade(&self.registry);
        Subscription {
            detach: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.remove(id);
                }
            })),
        }
    }

    pub fn emit(&self, event: &E) {
        // Snapshot so callbacks may subscribe or unsubscribe while running.
        let callbacks: Vec<Callback<E>> = self
            .registry
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| cb.clone())
            .collect();
        for callback in callbacks {
            callback(event);
        }
    }

    pub fn len(&self) -> usize {
        self.registry.callbacks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Disposer handle returned by [`Observers::subscribe`].
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn unsubscribe(mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("active", &self.detach.is_some()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_emit_reaches_subscribers() {
        let observers: Observers<u32> = Observers::new();
        let total = Arc::new(AtomicUsize::new(0));
        let t = total.clone();
        let _sub = observers.subscribe(move |n| {
            t.fetch_add(*n as usize, Ordering::SeqCst);
        });

        observers.emit(&2);
        observers.emit(&3);
        assert_eq!(total.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let observers: Observers<()> = Observers::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        let sub = observers.subscribe(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(observers.len(), 1);

        drop(sub);
        observers.emit(&());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert!(observers.is_empty());
    }

    #[test]
    fn test_explicit_unsubscribe_only_removes_own_callback() {
        let observers: Observers<()> = Observers::new();
        let a = observers.subscribe(|_| {});
        let _b = observers.subscribe(|_| {});
        a.unsubscribe();
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn test_subscription_outliving_source() {
        let observers: Observers<()> = Observers::new();
        let sub = observers.subscribe(|_| {});
        drop(observers);
        drop(sub);
    }
}
