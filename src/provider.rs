//! Provider lookup by longest URL prefix
//!
//! Matching is a plain, case-sensitive string prefix comparison. URIs are not
//! normalized: callers must supply them in the same form as the configured prefixes.

use crate::config::{ProviderConfig, ProviderSettings};
use std::sync::Arc;

/// Maps resource URIs to the most specific configured provider
#[derive(Clone, Debug)]
pub struct ProviderMatcher {
    /// Providers sorted by descending prefix length, so the first hit is the longest
    by_specificity: Vec<Arc<ProviderConfig>>,
}

impl ProviderMatcher {
    /// Build a matcher over the given settings
    pub fn new(settings: &ProviderSettings) -> Self {
        let mut by_specificity: Vec<_> = settings.iter().cloned().collect();
        by_specificity.sort_by(|a, b| {
            b.url_prefix
                .len()
                .cmp(&a.url_prefix.len())
                .then_with(|| a.url_prefix.cmp(&b.url_prefix))
        });
        Self { by_specificity }
    }

    /// Find the provider whose prefix is the longest prefix of `uri`
    pub fn find(&self, uri: &str) -> Option<Arc<ProviderConfig>> {
        let found = self
            .by_specificity
            .iter()
            .find(|provider| uri.starts_with(provider.url_prefix.as_str()))
            .cloned();
        if found.is_none() {
            tracing::debug!(uri = %uri, "no provider configured, downloading anonymously");
        }
        found
    }
}
