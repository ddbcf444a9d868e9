//! Adapter registry: maps a work type to the handler that executes it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use serde_json::Value as JsonValue;

use forgequeue_core::{WorkError, WorkOutput};

/// Executes work of one type.
///
/// Returning `Err` (or panicking) is a handler failure: the director converts it into a
/// FAILED outcome, it never propagates to the worker loop.
#[async_trait::async_trait]
pub trait WorkAdapter: Send + Sync + 'static {
    async fn execute(&self, input: JsonValue) -> anyhow::Result<WorkOutput>;
}

/// Adapter backed by an async closure.
pub struct FnAdapter<F> {
    f: F,
}

impl<F> FnAdapter<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait::async_trait]
impl<F, Fut> WorkAdapter for FnAdapter<F>
where
    F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<WorkOutput>> + Send + 'static,
{
    async fn execute(&self, input: JsonValue) -> anyhow::Result<WorkOutput> {
        (self.f)(input).await
    }
}

/// Registration options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterOptions {
    /// Completion is reported from outside the scheduler; never polled or executed locally.
    pub external: bool,
}

impl AdapterOptions {
    pub fn external() -> Self {
        Self { external: true }
    }
}

/// Which registered types `list_types` returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TypeFilter {
    #[default]
    All,
    /// Skip types registered as external.
    LocalOnly,
}

#[derive(Clone)]
struct Registration {
    adapter: Arc<dyn WorkAdapter>,
    options: AdapterOptions,
}

/// Process-wide adapter registry.
///
/// Registration usually happens at startup; `unregister` exists for runtime changes and
/// makes subsequent executions of the type fail with `NoAdapterError`.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<String, Registration>>,
}

impl core::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("types", &self.list_types(TypeFilter::All))
            .finish()
    }
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        work_type: impl Into<String>,
        adapter: impl WorkAdapter,
        options: AdapterOptions,
    ) -> Result<(), WorkError> {
        let work_type = work_type.into();
        let mut adapters = self.adapters.write().unwrap_or_else(PoisonError::into_inner);
        if adapters.contains_key(&work_type) {
            return Err(WorkError::DuplicateType(work_type));
        }
        adapters.insert(
            work_type,
            Registration {
                adapter: Arc::new(adapter),
                options,
            },
        );
        Ok(())
    }

    /// Register an async closure as the adapter for `work_type`.
    pub fn register_fn<F, Fut>(
        &self,
        work_type: impl Into<String>,
        f: F,
        options: AdapterOptions,
    ) -> Result<(), WorkError>
    where
        F: Fn(JsonValue) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<WorkOutput>> + Send + 'static,
    {
        self.register(work_type, FnAdapter::new(f), options)
    }

    /// Remove a registration. Returns whether the type was registered.
    pub fn unregister(&self, work_type: &str) -> bool {
        self.adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(work_type)
            .is_some()
    }

    pub fn get(&self, work_type: &str) -> Option<Arc<dyn WorkAdapter>> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(work_type)
            .map(|r| Arc::clone(&r.adapter))
    }

    pub fn contains(&self, work_type: &str) -> bool {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(work_type)
    }

    pub fn is_external(&self, work_type: &str) -> bool {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(work_type)
            .is_some_and(|r| r.options.external)
    }

    /// Registered type names, sorted.
    pub fn list_types(&self, filter: TypeFilter) -> Vec<String> {
        let adapters = self.adapters.read().unwrap_or_else(PoisonError::into_inner);
        let mut types: Vec<String> = adapters
            .iter()
            .filter(|(_, r)| filter == TypeFilter::All || !r.options.external)
            .map(|(t, _)| t.clone())
            .collect();
        types.sort();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl WorkAdapter for Echo {
        async fn execute(&self, input: JsonValue) -> anyhow::Result<WorkOutput> {
            Ok(WorkOutput::success(input))
        }
    }

    #[test]
    fn duplicate_registration_fails() {
        let registry = AdapterRegistry::new();
        registry.register("echo", Echo, AdapterOptions::default()).unwrap();

        let err = registry
            .register("echo", Echo, AdapterOptions::default())
            .unwrap_err();
        assert!(matches!(err, WorkError::DuplicateType(t) if t == "echo"));
    }

    #[test]
    fn list_types_can_skip_external() {
        let registry = AdapterRegistry::new();
        registry.register("sms", Echo, AdapterOptions::default()).unwrap();
        registry.register("payment", Echo, AdapterOptions::external()).unwrap();

        assert_eq!(registry.list_types(TypeFilter::All), vec!["payment", "sms"]);
        assert_eq!(registry.list_types(TypeFilter::LocalOnly), vec!["sms"]);
        assert!(registry.is_external("payment"));
        assert!(!registry.is_external("unknown"));
    }

    #[tokio::test]
    async fn closures_register_as_adapters() {
        let registry = AdapterRegistry::new();
        registry
            .register_fn(
                "double",
                |input: JsonValue| async move {
                    let v = input["v"].as_i64().unwrap_or_default();
                    Ok::<_, anyhow::Error>(WorkOutput::success(serde_json::json!(v * 2)))
                },
                AdapterOptions::default(),
            )
            .unwrap();

        let adapter = registry.get("double").unwrap();
        let output = adapter.execute(serde_json::json!({"v": 21})).await.unwrap();
        assert_eq!(output.result, Some(serde_json::json!(42)));
    }

    #[test]
    fn unregister_removes_type() {
        let registry = AdapterRegistry::new();
        registry.register("echo", Echo, AdapterOptions::default()).unwrap();

        assert!(registry.unregister("echo"));
        assert!(!registry.unregister("echo"));
        assert!(registry.get("echo").is_none());
        assert!(!registry.contains("echo"));
    }
}
