//! Kind -> handler registry.

use super::WorkUnitHandler;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Builds a handler for one attempt.
pub type HandlerFactory = Arc<dyn Fn() -> Arc<dyn WorkUnitHandler> + Send + Sync>;

/// Maps work-unit kinds to handler factories.
///
/// Registering a kind twice replaces the earlier factory.
#[derive(Default)]
pub struct HandlerRegistry {
    factories: RwLock<HashMap<String, HandlerFactory>>,
}

impl HandlerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory invoked once per attempt.
    pub fn register_factory<F>(&self, kind: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn WorkUnitHandler> + Send + Sync + 'static,
    {
        self.factories.write().insert(kind.into(), Arc::new(factory));
    }

    /// Registers a shared instance used for every attempt.
    pub fn register_instance(&self, kind: impl Into<String>, handler: Arc<dyn WorkUnitHandler>) {
        self.register_factory(kind, move || Arc::clone(&handler));
    }

    /// Builder form of [`register_instance`](Self::register_instance).
    #[must_use]
    pub fn with_handler(self, kind: impl Into<String>, handler: Arc<dyn WorkUnitHandler>) -> Self {
        self.register_instance(kind, handler);
        self
    }

    /// Creates a handler for `kind`.
    #[must_use]
    pub fn create(&self, kind: &str) -> Option<Arc<dyn WorkUnitHandler>> {
        // Clone the factory out so it runs without the lock held.
        let factory = self.factories.read().get(kind).cloned()?;
        Some(factory())
    }

    /// True if `kind` is registered.
    #[must_use]
    pub fn contains(&self, kind: &str) -> bool {
        self.factories.read().contains_key(kind)
    }

    /// Registered kinds, sorted.
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<String> = self.factories.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Removes `kind`. Returns true if it was registered.
    pub fn unregister(&self, kind: &str) -> bool {
        self.factories.write().remove(kind).is_some()
    }

    /// Number of registered kinds.
    #[must_use]
    pub fn len(&self) -> usize {
        self.factories.read().len()
    }

    /// True if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.factories.read().is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancellation::CancellationToken;
    use crate::core::WorkOutput;
    use crate::handlers::{HandlerInput, MockWorkUnitHandler};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    fn input(kind: &str) -> HandlerInput {
        HandlerInput {
            run_id: Uuid::new_v4(),
            execution_id: Uuid::new_v4(),
            kind: kind.to_string(),
            attempt: 1,
            run_name: "run".into(),
            brief: "brief".into(),
            project_context: HashMap::new(),
            dependency_outputs: HashMap::new(),
            context: HashMap::new(),
            configuration: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_create_instance() {
        let mut mock = MockWorkUnitHandler::new();
        mock.expect_execute()
            .times(1)
            .returning(|input, _| Ok(WorkOutput::new(json!({ "kind": input.kind }))));
        let registry = HandlerRegistry::new().with_handler("planner", Arc::new(mock));

        assert!(registry.contains("planner"));
        assert!(registry.create("coder").is_none());
        let handler = registry.create("planner").unwrap();
        let output = handler
            .execute(input("planner"), Arc::new(CancellationToken::new()))
            .await
            .unwrap();
        assert_eq!(output.result, json!({"kind": "planner"}));
    }

    #[test]
    fn test_factory_called_per_create() {
        let registry = HandlerRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        registry.register_factory("coder", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(MockWorkUnitHandler::new()) as Arc<dyn WorkUnitHandler>
        });
        let _ = registry.create("coder");
        let _ = registry.create("coder");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_kinds_and_unregister() {
        let registry = HandlerRegistry::new();
        registry.register_instance("b", Arc::new(MockWorkUnitHandler::new()));
        registry.register_instance("a", Arc::new(MockWorkUnitHandler::new()));
        assert_eq!(registry.kinds(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.unregister("a"));
        assert!(!registry.unregister("a"));
        assert_eq!(registry.len(), 1);
    }
}
