//! Reuse of provider clients across questions and config reloads.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use proto::LlmError;
use tracing::debug;

use crate::llm::{LlmProvider, OpenAiCompatProvider};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProviderKey {
    api_key: String,
    base_url: String,
    timeout: Duration,
}

/// Provider factory keyed by `(api_key, base_url, timeout)`.
///
/// Asking twice with the same triple returns the same client, so its
/// connection pool survives `/reload` runs that do not touch the endpoint.
#[derive(Default)]
pub struct ProviderCache {
    providers: Mutex<HashMap<ProviderKey, Arc<OpenAiCompatProvider>>>,
}

impl ProviderCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        api_key: &str,
        base_url: &str,
        timeout: Duration,
    ) -> Result<Arc<dyn LlmProvider>, LlmError> {
        let key = ProviderKey {
            api_key: api_key.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        };
        let mut providers = self.providers.lock();
        if let Some(existing) = providers.get(&key) {
            return Ok(existing.clone());
        }
        debug!(base_url = %key.base_url, timeout_secs = timeout.as_secs(), "Creating LLM provider");
        let provider = Arc::new(OpenAiCompatProvider::new(api_key, base_url, timeout)?);
        providers.insert(key, provider.clone());
        Ok(provider)
    }

    pub fn len(&self) -> usize {
        self.providers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_key_reuses_provider() {
        let cache = ProviderCache::new();
        let a = cache
            .get_or_create("k", "https://api.deepseek.com/v1", Duration::from_secs(45))
            .expect("provider");
        let b = cache
            .get_or_create("k", "https://api.deepseek.com/v1/", Duration::from_secs(45))
            .expect("provider");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn different_timeout_or_key_creates_new_provider() {
        let cache = ProviderCache::new();
        cache
            .get_or_create("k", "https://api.deepseek.com/v1", Duration::from_secs(45))
            .expect("provider");
        cache
            .get_or_create("k", "https://api.deepseek.com/v1", Duration::from_secs(10))
            .expect("provider");
        cache
            .get_or_create("other", "https://api.deepseek.com/v1", Duration::from_secs(10))
            .expect("provider");
        assert_eq!(cache.len(), 3);
    }
}
