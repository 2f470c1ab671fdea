use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::watch;

#[derive(Debug)]
struct Listener {
    generation: u64,
    stop: watch::Sender<bool>,
}

#[derive(Debug, Default)]
struct Registry {
    next_generation: u64,
    listeners: HashMap<String, Listener>,
}

/// Stop signals of the per-swap workers, keyed by swap id.
#[derive(Debug, Default)]
pub struct ListenerRegistry {
    inner: Mutex<Registry>,
}

impl ListenerRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Claims the listener slot of `swap_id`. Returns `None` while another worker holds it.
    ///
    /// The slot is released when the returned guard drops.
    pub fn register(self: &Arc<Self>, swap_id: &str) -> Option<(ListenerGuard, watch::Receiver<bool>)> {
        let mut registry = self.inner.lock().ok()?;
        if registry.listeners.contains_key(swap_id) {
            return None;
        }

        registry.next_generation += 1;
        let generation = registry.next_generation;
        let (stop, stopped) = watch::channel(false);
        registry
            .listeners
            .insert(swap_id.to_string(), Listener { generation, stop });

        Some((
            ListenerGuard {
                registry: Arc::clone(self),
                swap_id: swap_id.to_string(),
                generation,
            },
            stopped,
        ))
    }

    pub fn contains(&self, swap_id: &str) -> bool {
        self.inner
            .lock()
            .map(|registry| registry.listeners.contains_key(swap_id))
            .unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .map(|registry| registry.listeners.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signals the worker of `swap_id` to stop. Returns whether one was registered.
    pub fn stop(&self, swap_id: &str) -> bool {
        let Ok(registry) = self.inner.lock() else {
            return false;
        };
        match registry.listeners.get(swap_id) {
            Some(listener) => {
                listener.stop.send_replace(true);
                true
            }
            None => false,
        }
    }

    pub fn stop_all(&self) {
        if let Ok(registry) = self.inner.lock() {
            for listener in registry.listeners.values() {
                listener.stop.send_replace(true);
            }
        }
    }

    fn release(&self, swap_id: &str, generation: u64) {
        if let Ok(mut registry) = self.inner.lock()
            && registry
                .listeners
                .get(swap_id)
                .is_some_and(|listener| listener.generation == generation)
        {
            registry.listeners.remove(swap_id);
        }
    }
}

/// Deregisters its swap from the [`ListenerRegistry`] on drop.
#[derive(Debug)]
pub struct ListenerGuard {
    registry: Arc<ListenerRegistry>,
    swap_id: String,
    generation: u64,
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.registry.release(&self.swap_id, self.generation);
        tracing::debug!(swap_id = %self.swap_id, "released swap listener");
    }
}
