//! Loaded predictor cache
//!
//! Predictors are expensive to load, so each worker keeps the most recently
//! used ones keyed by (tenant, model id). The registry is an explicit value
//! handed to whoever runs inference; there is no process-wide cache.

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use classif_common::db::{DefectMap, File, MlModel, RegionBox};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One region produced by a predictor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub defects: DefectMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<RegionBox>,
}

/// Opaque model invocation
#[async_trait]
pub trait Predictor: Send + Sync {
    async fn predict(&self, file: &File) -> anyhow::Result<Vec<Prediction>>;
}

/// Builds a predictor for a model on first use
#[async_trait]
pub trait ModelLoader: Send + Sync {
    async fn load(&self, tenant: &str, model: &MlModel) -> anyhow::Result<Arc<dyn Predictor>>;
}

type CacheKey = (String, i64);

pub struct ModelRegistry {
    loader: Arc<dyn ModelLoader>,
    cache: Mutex<LruCache<CacheKey, Arc<dyn Predictor>>>,
}

impl ModelRegistry {
    /// `capacity` of zero is treated as one
    pub fn new(loader: Arc<dyn ModelLoader>, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            loader,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<CacheKey, Arc<dyn Predictor>>> {
        // A panic while holding the lock leaves the cache itself consistent
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Cached predictor for `model`, loading it on a miss
    ///
    /// The lock is not held across the load; two concurrent misses may both
    /// load, and the later insert wins.
    pub async fn get_or_load(&self, tenant: &str, model: &MlModel) -> anyhow::Result<Arc<dyn Predictor>> {
        let key = (tenant.to_string(), model.id);
        let cached = self.cache().get(&key).cloned();
        if let Some(predictor) = cached {
            return Ok(predictor);
        }

        debug!(tenant, ml_model_id = model.id, "Loading predictor");
        let predictor = self.loader.load(tenant, model).await?;

        if let Some((evicted, _)) = self.cache().push(key, Arc::clone(&predictor)) {
            if evicted != (tenant.to_string(), model.id) {
                info!(tenant = %evicted.0, ml_model_id = evicted.1, "Evicted least recently used predictor");
            }
        }
        Ok(predictor)
    }

    /// Drop one cached predictor; returns whether it was present
    pub fn evict(&self, tenant: &str, ml_model_id: i64) -> bool {
        self.cache().pop(&(tenant.to_string(), ml_model_id)).is_some()
    }

    /// Drop every predictor of a tenant; returns how many were removed
    pub fn evict_tenant(&self, tenant: &str) -> usize {
        let mut cache = self.cache();
        let keys: Vec<CacheKey> = cache
            .iter()
            .filter(|(k, _)| k.0 == tenant)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &keys {
            cache.pop(key);
        }
        keys.len()
    }

    pub fn contains(&self, tenant: &str, ml_model_id: i64) -> bool {
        self.cache().contains(&(tenant.to_string(), ml_model_id))
    }

    pub fn len(&self) -> usize {
        self.cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use classif_common::db::ModelType;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Empty;

    #[async_trait]
    impl Predictor for Empty {
        async fn predict(&self, _file: &File) -> anyhow::Result<Vec<Prediction>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct CountingLoader {
        loads: AtomicUsize,
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        async fn load(&self, _tenant: &str, _model: &MlModel) -> anyhow::Result<Arc<dyn Predictor>> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Empty))
        }
    }

    fn model(id: i64) -> MlModel {
        MlModel {
            id,
            name: format!("m{}", id),
            version: 1,
            model_type: ModelType::Classification,
            use_case_id: 1,
            confidence_threshold: None,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_hit_does_not_reload() {
        let loader = Arc::new(CountingLoader::default());
        let registry = ModelRegistry::new(loader.clone(), 2);

        registry.get_or_load("a", &model(1)).await.unwrap();
        registry.get_or_load("a", &model(1)).await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);

        // same model id under another tenant is a different entry
        registry.get_or_load("b", &model(1)).await.unwrap();
        assert_eq!(loader.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_least_recently_used_is_evicted() {
        let registry = ModelRegistry::new(Arc::new(CountingLoader::default()), 2);

        registry.get_or_load("a", &model(1)).await.unwrap();
        registry.get_or_load("a", &model(2)).await.unwrap();
        registry.get_or_load("a", &model(1)).await.unwrap();
        registry.get_or_load("a", &model(3)).await.unwrap();

        assert!(registry.contains("a", 1));
        assert!(!registry.contains("a", 2));
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_explicit_eviction() {
        let registry = ModelRegistry::new(Arc::new(CountingLoader::default()), 4);
        registry.get_or_load("a", &model(1)).await.unwrap();
        registry.get_or_load("a", &model(2)).await.unwrap();
        registry.get_or_load("b", &model(1)).await.unwrap();

        assert!(registry.evict("b", 1));
        assert!(!registry.evict("b", 1));
        assert_eq!(registry.evict_tenant("a"), 2);
        assert!(registry.is_empty());
    }
}
