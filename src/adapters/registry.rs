//! Adapter registry - maps capability node kinds to their adapters.

use std::collections::HashMap;
use std::sync::Arc;

use super::model::ModelAdapter;
use super::rpa::RpaAdapter;
use super::tool::ToolAdapter;
use super::types::Adapter;
use crate::config::BackendsConfig;

/// Registry of capability adapters, keyed by node kind name.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn Adapter>>,
}

impl AdapterRegistry {
    /// Create a registry with the three built-in adapters wired to the
    /// configured backend endpoints.
    pub fn with_defaults(backends: &BackendsConfig) -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(ModelAdapter::new(&backends.model_endpoint)));
        registry.register(Arc::new(ToolAdapter::new(&backends.tool_endpoint)));
        registry.register(Arc::new(RpaAdapter::new(&backends.rpa_endpoint)));
        registry
    }

    /// Create an empty registry (for testing with stub adapters).
    pub fn empty() -> Self {
        Self {
            adapters: HashMap::new(),
        }
    }

    /// Register an adapter, replacing any existing one for its kind.
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.kind().to_string(), adapter);
    }

    /// Get the adapter for a node kind name.
    pub fn get(&self, kind: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(kind).cloned()
    }

    pub fn has(&self, kind: &str) -> bool {
        self.adapters.contains_key(kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_all_capability_kinds() {
        let registry = AdapterRegistry::with_defaults(&BackendsConfig::default());
        for kind in ["model_call", "tool_call", "rpa_action"] {
            assert!(registry.has(kind), "missing adapter for {}", kind);
        }
        assert!(!registry.has("branch"));
    }

    #[test]
    fn register_replaces_existing_kind() {
        let mut registry = AdapterRegistry::with_defaults(&BackendsConfig::default());
        let replacement = Arc::new(ModelAdapter::new("https://other.example.com"));
        registry.register(replacement);
        assert!(registry.has("model_call"));
        assert_eq!(registry.adapters.len(), 3);
    }
}
