// ABOUTME: Registry of named compute providers available to boxes
// ABOUTME: Boxes reference a provider by name; the registry resolves it to a shared client

use crate::providers::ComputeProvider;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ComputeProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register under `name`, replacing any previous entry
    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn ComputeProvider>) {
        let name = name.into();
        info!("Registered compute provider: {}", name);
        self.providers.insert(name, provider);
    }

    pub fn with(mut self, name: impl Into<String>, provider: Arc<dyn ComputeProvider>) -> Self {
        self.register(name, provider);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ComputeProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.providers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
