use std::collections::HashMap;
use std::sync::Arc;

use ichigo_core::config::AppConfig;

use crate::openai::OpenAiProvider;
use crate::provider::{ChatProvider, ProviderError};

/// Provider clients keyed by configured provider name.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ChatProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let mut registry = Self::new();
        for provider in &config.providers {
            registry.insert(provider.name.clone(), Arc::new(OpenAiProvider::new(provider)?));
        }
        Ok(registry)
    }

    pub fn insert(&mut self, name: impl Into<String>, provider: Arc<dyn ChatProvider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChatProvider>> {
        self.providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
