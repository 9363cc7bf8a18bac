use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::OnceCell;

use super::{EngineError, EngineFactory, EngineHandle, ExecutionPolicy, StemCount};

type Slot = Arc<OnceCell<EngineHandle>>;

/// Holds at most one warm engine per stem count.
///
/// The map lock is only held to look up or insert a slot. Construction happens inside
/// the slot's `OnceCell`, so concurrent callers for the same key wait on a single build
/// while other keys proceed. A failed build leaves the slot empty and the next caller
/// retries.
pub struct ResourceCache {
    factory: Arc<dyn EngineFactory>,
    policy: ExecutionPolicy,
    slots: Mutex<HashMap<StemCount, Slot>>,
}

impl ResourceCache {
    pub fn new(factory: Arc<dyn EngineFactory>, policy: ExecutionPolicy) -> Self {
        Self {
            factory,
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> ExecutionPolicy {
        self.policy
    }

    fn slot(&self, stems: StemCount) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(slots.entry(stems).or_default())
    }

    /// Return the cached handle for `stems`, constructing it on first use.
    pub async fn acquire(&self, stems: StemCount) -> Result<EngineHandle, EngineError> {
        let slot = self.slot(stems);
        let handle = slot
            .get_or_try_init(|| async {
                let factory = Arc::clone(&self.factory);
                let started = Instant::now();
                tracing::info!(stems = %stems, model = %stems.model_name(), "constructing engine");

                let engine = tokio::task::spawn_blocking(move || factory.build(stems))
                    .await
                    .map_err(|e| EngineError::Init(format!("engine construction aborted: {e}")))?
                    .map_err(|e| match e {
                        EngineError::Init(msg) => EngineError::Init(msg),
                        other => EngineError::Init(other.to_string()),
                    })?;

                tracing::info!(
                    stems = %stems,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "engine ready"
                );
                Ok::<_, EngineError>(EngineHandle::new(stems, engine, self.policy))
            })
            .await?;
        Ok(handle.clone())
    }

    /// Construct handles for `keys` ahead of the first request. Failures are logged.
    pub async fn prewarm(&self, keys: &[StemCount]) -> usize {
        let mut ready = 0;
        for &stems in keys {
            match self.acquire(stems).await {
                Ok(_) => ready += 1,
                Err(e) => tracing::warn!(stems = %stems, error = %e, "engine pre-warming failed"),
            }
        }
        ready
    }

    /// Keys with a constructed handle.
    pub fn cached_keys(&self) -> Vec<StemCount> {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<_> = slots
            .iter()
            .filter(|(_, slot)| slot.initialized())
            .map(|(k, _)| *k)
            .collect();
        keys.sort();
        keys
    }

    /// Drop every cached handle. Jobs holding a clone keep using it.
    pub fn clear(&self) {
        let dropped = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *slots)
        };
        tracing::info!(slots = dropped.len(), "engine cache cleared");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testing::FakeFactory;
    use std::path::PathBuf;
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquire_constructs_once() {
        let factory = Arc::new(FakeFactory::new().build_delay(Duration::from_millis(50)));
        let cache = Arc::new(ResourceCache::new(factory.clone(), ExecutionPolicy::Serialized));

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move { cache.acquire(StemCount::Four).await }));
        }
        let mut handles = Vec::new();
        for t in tasks {
            handles.push(t.await.unwrap().unwrap());
        }

        assert_eq!(factory.builds(), 1);
        assert_eq!(handles.len(), 16);
        assert!(handles.iter().all(|h| h.same_engine(&handles[0])));
    }

    #[tokio::test]
    async fn distinct_keys_get_distinct_handles() {
        let factory = Arc::new(FakeFactory::new());
        let cache = ResourceCache::new(factory.clone(), ExecutionPolicy::Serialized);

        let two = cache.acquire(StemCount::Two).await.unwrap();
        let five = cache.acquire(StemCount::Five).await.unwrap();
        let two_again = cache.acquire(StemCount::Two).await.unwrap();

        assert_eq!(factory.builds(), 2);
        assert!(!two.same_engine(&five));
        assert!(two.same_engine(&two_again));
        assert_eq!(cache.cached_keys(), vec![StemCount::Two, StemCount::Five]);
    }

    #[tokio::test]
    async fn failed_construction_does_not_poison_the_slot() {
        let factory = Arc::new(FakeFactory::new().fail_first(1));
        let cache = ResourceCache::new(factory.clone(), ExecutionPolicy::Serialized);

        let err = cache.acquire(StemCount::Two).await.unwrap_err();
        assert!(matches!(err, EngineError::Init(ref m) if m.contains("spleeter:2stems")));
        assert!(cache.cached_keys().is_empty());

        cache.acquire(StemCount::Two).await.unwrap();
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test]
    async fn clear_keeps_handles_in_use_working() {
        let factory = Arc::new(FakeFactory::new());
        let cache = ResourceCache::new(factory.clone(), ExecutionPolicy::Serialized);
        let held = cache.acquire(StemCount::Two).await.unwrap();

        cache.clear();
        assert!(cache.cached_keys().is_empty());

        let dir = tempfile::tempdir().unwrap();
        held.run(PathBuf::from("in.wav"), dir.path().to_path_buf(), ())
            .await
            .unwrap();

        let fresh = cache.acquire(StemCount::Two).await.unwrap();
        assert!(!fresh.same_engine(&held));
        assert_eq!(factory.builds(), 2);
    }

    #[tokio::test]
    async fn prewarm_counts_ready_engines() {
        let factory = Arc::new(FakeFactory::new().fail_first(1));
        let cache = ResourceCache::new(factory, ExecutionPolicy::Serialized);

        let ready = cache.prewarm(&[StemCount::Two, StemCount::Four]).await;
        assert_eq!(ready, 1);
        assert_eq!(cache.cached_keys(), vec![StemCount::Four]);
    }
}
