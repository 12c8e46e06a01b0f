use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;

/// Receives the renderer's per-frame callback.
pub trait FrameListener: Send + Sync {
    /// Called once per rendered frame. Must not block.
    fn on_render_tick(&self, host_time: Duration);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Fans the host renderer's frame callback out to video textures and
/// recorders.
#[derive(Default)]
pub struct RenderLoop {
    listeners: Mutex<Vec<(ListenerId, Arc<dyn FrameListener>)>>,
    next_id: AtomicU64,
    ticks: AtomicU64,
}

impl std::fmt::Debug for RenderLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RenderLoop")
            .field("listeners", &self.listeners.lock().len())
            .field("ticks", &self.ticks())
            .finish()
    }
}

impl RenderLoop {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a listener; the returned id unregisters it.
    pub fn register(&self, listener: Arc<dyn FrameListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        self.listeners.lock().push((id, listener));
        id
    }

    /// Returns false if `id` was not registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Delivers one render tick to every registered listener.
    pub fn tick(&self, host_time: Duration) {
        // Listeners may register or unregister from inside their callback.
        let snapshot: Vec<Arc<dyn FrameListener>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| listener.clone())
            .collect();
        for listener in snapshot {
            listener.on_render_tick(host_time);
        }
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of ticks delivered so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Counter(AtomicU64);

    impl FrameListener for Counter {
        fn on_render_tick(&self, _host_time: Duration) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn ticks_reach_registered_listeners_only() {
        let render = RenderLoop::new();
        let first = Arc::new(Counter::default());
        let second = Arc::new(Counter::default());
        render.register(first.clone());
        let id = render.register(second.clone());

        render.tick(Duration::ZERO);
        assert!(render.unregister(id));
        assert!(!render.unregister(id));
        render.tick(Duration::from_millis(16));

        assert_eq!(first.0.load(Ordering::SeqCst), 2);
        assert_eq!(second.0.load(Ordering::SeqCst), 1);
        assert_eq!(render.ticks(), 2);
    }

    #[test]
    fn concurrent_registrations_get_distinct_ids() {
        let render = RenderLoop::new();
        let ids: Vec<ListenerId> = std::thread::scope(|scope| {
            let workers: Vec<_> = (0..8)
                .map(|_| scope.spawn(|| render.register(Arc::new(Counter::default()))))
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let unique: std::collections::HashSet<_> = ids.iter().copied().collect();
        assert_eq!(unique.len(), 8);
        assert_eq!(render.len(), 8);
    }
}
