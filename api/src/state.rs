use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use common::config::Settings;
use common::webhook::WebhookIngestor;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub ingestor: Arc<WebhookIngestor>,
    pub deliveries: Arc<DeliveryCache>,
    pub config: Arc<Settings>,
}

impl AppState {
    pub fn new(ingestor: WebhookIngestor, config: Settings) -> Self {
        let deliveries = DeliveryCache::new(config.webhook.delivery_cache_size);
        Self {
            ingestor: Arc::new(ingestor),
            deliveries: Arc::new(deliveries),
            config: Arc::new(config),
        }
    }
}

/// Remembers the most recent delivery ids, oldest evicted first
#[derive(Debug)]
pub struct DeliveryCache {
    capacity: usize,
    inner: Mutex<DeliveryWindow>,
}

#[derive(Debug, Default)]
struct DeliveryWindow {
    order: VecDeque<String>,
    seen: HashSet<String>,
}

impl DeliveryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(DeliveryWindow::default()),
        }
    }

    /// Record a delivery id. Returns `false` if it was already seen.
    pub fn remember(&self, delivery_id: &str) -> bool {
        let mut window = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if window.seen.contains(delivery_id) {
            return false;
        }
        if window.order.len() >= self.capacity {
            if let Some(oldest) = window.order.pop_front() {
                window.seen.remove(&oldest);
            }
        }
        window.order.push_back(delivery_id.to_string());
        window.seen.insert(delivery_id.to_string());
        true
    }

    /// Drop an id so a redelivery is accepted again
    pub fn forget(&self, delivery_id: &str) {
        let mut window = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        if window.seen.remove(delivery_id) {
            window.order.retain(|id| id != delivery_id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).order.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_duplicate_delivery_is_detected() {
        let cache = DeliveryCache::new(4);
        assert!(cache.remember("a"));
        assert!(!cache.remember("a"));
        assert!(cache.remember("b"));
    }

    #[test]
    fn test_oldest_delivery_is_evicted() {
        let cache = DeliveryCache::new(2);
        assert!(cache.remember("a"));
        assert!(cache.remember("b"));
        assert!(cache.remember("c"));
        // "a" fell out of the window
        assert!(cache.remember("a"));
        assert!(!cache.remember("c"));
    }

    #[test]
    fn test_forgotten_delivery_is_accepted_again() {
        let cache = DeliveryCache::new(8);
        assert!(cache.remember("a"));
        cache.forget("a");
        assert!(cache.remember("a"));
        assert_eq!(cache.len(), 1);
    }

    proptest! {
        #[test]
        fn property_window_never_exceeds_capacity(
            capacity in 1usize..32,
            ids in prop::collection::vec("[a-f]{1,3}", 0..200)
        ) {
            let cache = DeliveryCache::new(capacity);
            for id in &ids {
                cache.remember(id);
                prop_assert!(cache.len() <= capacity);
            }
        }
    }
}
