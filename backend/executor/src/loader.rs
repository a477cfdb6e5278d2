use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use jobforge_core::{EngineError, HandlerLoadError, ModuleRegistry};

use crate::handler::SharedHandler;
use crate::path_guard::validate_handler_path;
use crate::resolver::{HandlerLocation, HandlerResolver};

type CacheKey = (String, String);

/// Validates, resolves, and caches handlers per `(module, handler path)`.
pub struct HandlerLoader {
    modules: Arc<dyn ModuleRegistry>,
    resolver: Arc<dyn HandlerResolver>,
    cache: RwLock<HashMap<CacheKey, SharedHandler>>,
}

impl HandlerLoader {
    pub fn new(modules: Arc<dyn ModuleRegistry>, resolver: Arc<dyn HandlerResolver>) -> Self {
        Self {
            modules,
            resolver,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub async fn load(&self, module_id: &str, handler_path: &str) -> Result<SharedHandler, EngineError> {
        let key = (module_id.to_string(), handler_path.to_string());
        if let Some(handler) = self.cache.read().await.get(&key) {
            debug!(module_id = %module_id, handler = %handler_path, "Handler cache hit");
            return Ok(Arc::clone(handler));
        }

        let module = self
            .modules
            .get_module(module_id)
            .await?
            .ok_or_else(|| EngineError::ModuleNotFound(module_id.to_string()))?;
        if !module.enabled {
            return Err(HandlerLoadError::Invalid {
                path: module.root_dir.clone(),
                reason: format!("module '{module_id}' is disabled"),
            }
            .into());
        }

        let path = validate_handler_path(&module.root_dir, handler_path).inspect_err(|e| {
            warn!(module_id = %module_id, handler = %handler_path, error = %e, "Rejected handler path");
        })?;
        let location = HandlerLocation {
            module_id: module.id.clone(),
            module_root: module.root_dir.clone(),
            relative: handler_path.to_string(),
            path,
        };
        let handler = self.resolver.resolve(&location).await?;

        // Concurrent misses on the same key keep whichever landed first.
        let mut cache = self.cache.write().await;
        let cached = cache.entry(key).or_insert(handler);
        info!(module_id = %module_id, handler = %handler_path, "Handler loaded");
        Ok(Arc::clone(cached))
    }

    /// Drop every cached handler of one module. Returns how many were removed.
    pub async fn invalidate_module(&self, module_id: &str) -> usize {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|(module, _), _| module != module_id);
        let removed = before - cache.len();
        info!(module_id = %module_id, removed, "Handler cache invalidated for module");
        removed
    }

    pub async fn invalidate_all(&self) -> usize {
        let mut cache = self.cache.write().await;
        let removed = cache.len();
        cache.clear();
        info!(removed, "Handler cache cleared");
        removed
    }

    pub async fn cached_count(&self) -> usize {
        self.cache.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use jobforge_core::{Module, StoreError};

    use crate::handler::handler_fn;

    struct Modules(Vec<Module>);

    #[async_trait]
    impl ModuleRegistry for Modules {
        async fn get_module(&self, id: &str) -> Result<Option<Module>, StoreError> {
            Ok(self.0.iter().find(|m| m.id == id).cloned())
        }

        async fn upsert_module(&self, _module: &Module) -> Result<(), StoreError> {
            Ok(())
        }
    }

    /// Hands out a fresh handler per resolve and counts the calls.
    #[derive(Default)]
    struct CountingResolver {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl HandlerResolver for CountingResolver {
        async fn resolve(&self, _location: &HandlerLocation) -> Result<SharedHandler, HandlerLoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(handler_fn(|_ctx| async { Ok(serde_json::Value::Null) }))
        }
    }

    fn loader() -> (HandlerLoader, Arc<CountingResolver>) {
        let mut disabled = Module::new("off", "Disabled", "/srv/modules/off");
        disabled.enabled = false;
        let modules = Modules(vec![
            Module::new("crm", "CRM", "/srv/modules/crm"),
            Module::new("billing", "Billing", "/srv/modules/billing"),
            disabled,
        ]);
        let resolver = Arc::new(CountingResolver::default());
        (HandlerLoader::new(Arc::new(modules), resolver.clone()), resolver)
    }

    #[tokio::test]
    async fn second_load_is_a_cache_hit() {
        let (loader, resolver) = loader();
        let first = loader.load("crm", "sync.sh").await.unwrap();
        let second = loader.load("crm", "sync.sh").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_module_forces_fresh_load() {
        let (loader, resolver) = loader();
        let first = loader.load("crm", "sync.sh").await.unwrap();
        loader.load("billing", "invoice.sh").await.unwrap();

        assert_eq!(loader.invalidate_module("crm").await, 1);
        assert_eq!(loader.cached_count().await, 1);

        let reloaded = loader.load("crm", "sync.sh").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &reloaded));
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn invalidate_all_clears_everything() {
        let (loader, _) = loader();
        loader.load("crm", "a.sh").await.unwrap();
        loader.load("billing", "b.sh").await.unwrap();
        assert_eq!(loader.invalidate_all().await, 2);
        assert_eq!(loader.cached_count().await, 0);
    }

    #[tokio::test]
    async fn traversal_never_reaches_the_resolver() {
        let (loader, resolver) = loader();
        for bad in ["../../etc/passwd", "sub/../../outside"] {
            let err = loader.load("crm", bad).await.err().unwrap();
            assert!(matches!(err, EngineError::HandlerLoad(HandlerLoadError::Traversal(_))));
        }
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
        assert_eq!(loader.cached_count().await, 0);
    }

    #[tokio::test]
    async fn unknown_module_is_module_not_found() {
        let (loader, _) = loader();
        let err = loader.load("ghost", "run.sh").await.err().unwrap();
        assert!(matches!(err, EngineError::ModuleNotFound(_)));
    }

    #[tokio::test]
    async fn disabled_module_is_invalid() {
        let (loader, _) = loader();
        let err = loader.load("off", "run.sh").await.err().unwrap();
        assert!(matches!(err, EngineError::HandlerLoad(HandlerLoadError::Invalid { .. })));
    }
}
