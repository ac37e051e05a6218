//! Per-call request and cache options.

use query_cache::CacheConfig;
use query_core::{NodeRef, Pager, Value};
use query_planner::{Bindings, Cacheability};
use std::time::Duration;

/// Cache settings for a single call. Unset fields fall back to the
/// executor's `CacheConfig`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheOptions {
    pub parsing_enabled: Option<bool>,
    pub parsing_expiry: Option<Duration>,
    pub execution_enabled: Option<bool>,
    pub execution_expiry: Option<Duration>,
    /// Key prefix scoping cached results, usually the tenant
    pub key_prefix: Option<String>,
    pub no_tracking: bool,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_parsing(mut self, enabled: bool, expiry: Option<Duration>) -> Self {
        self.parsing_enabled = Some(enabled);
        self.parsing_expiry = expiry;
        self
    }

    pub fn with_execution(mut self, enabled: bool, expiry: Option<Duration>) -> Self {
        self.execution_enabled = Some(enabled);
        self.execution_expiry = expiry;
        self
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn no_tracking(mut self) -> Self {
        self.no_tracking = true;
        self
    }

    /// Resolves the caching policy of one call. An inline directive beats
    /// these options, which beat the configuration.
    pub fn resolve(&self, config: &CacheConfig, analysis: &Cacheability) -> CachePolicy {
        let plan_enabled = self.parsing_enabled.unwrap_or(config.parsing.enabled);
        let result_enabled = analysis
            .enabled
            .or(self.execution_enabled)
            .unwrap_or(config.execution.enabled);

        CachePolicy {
            plan_expiry: plan_enabled
                .then(|| self.parsing_expiry.unwrap_or(config.parsing.expiry)),
            result_expiry: (result_enabled && analysis.required).then(|| {
                analysis
                    .expiry
                    .or(self.execution_expiry)
                    .unwrap_or(config.execution.expiry)
            }),
        }
    }
}

/// Which caches a call uses, and for how long entries live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub plan_expiry: Option<Duration>,
    pub result_expiry: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub tree: NodeRef,
    /// Values of the tree's declared parameters
    pub arguments: Bindings,
    pub pager: Option<Pager>,
    pub options: CacheOptions,
}

impl QueryRequest {
    pub fn new(tree: NodeRef) -> Self {
        Self {
            tree,
            arguments: Bindings::new(),
            pager: None,
            options: CacheOptions::default(),
        }
    }

    pub fn with_argument(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.into(), value.into());
        self
    }

    pub fn with_pager(mut self, pager: Pager) -> Self {
        self.pager = Some(pager);
        self
    }

    pub fn with_options(mut self, options: CacheOptions) -> Self {
        self.options = options;
        self
    }

    pub fn tenant(&self) -> &str {
        self.options.key_prefix.as_deref().unwrap_or("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analysis(enabled: Option<bool>, expiry: Option<Duration>, required: bool) -> Cacheability {
        Cacheability {
            enabled,
            expiry,
            required,
            ..Default::default()
        }
    }

    #[test]
    fn test_config_is_the_fallback() {
        let config = CacheConfig::default();
        let policy = CacheOptions::new().resolve(&config, &analysis(None, None, true));
        assert_eq!(policy.plan_expiry, Some(config.parsing.expiry));
        assert_eq!(policy.result_expiry, None);
    }

    #[test]
    fn test_directive_beats_options() {
        let config = CacheConfig::default();
        let options = CacheOptions::new().with_execution(false, Some(Duration::from_secs(5)));

        let policy = options.resolve(&config, &analysis(None, None, true));
        assert_eq!(policy.result_expiry, None);

        let policy = options.resolve(
            &config,
            &analysis(Some(true), Some(Duration::from_secs(90)), true),
        );
        assert_eq!(policy.result_expiry, Some(Duration::from_secs(90)));

        let policy = options.resolve(&config, &analysis(Some(true), None, true));
        assert_eq!(policy.result_expiry, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_mutations_never_use_results() {
        let config = CacheConfig::default().with_execution(true, Duration::from_secs(60));
        let policy = CacheOptions::new().resolve(&config, &analysis(Some(true), None, false));
        assert_eq!(policy.result_expiry, None);
        assert!(policy.plan_expiry.is_some());
    }

    #[test]
    fn test_parsing_can_be_switched_off_per_call() {
        let config = CacheConfig::default();
        let policy = CacheOptions::new()
            .with_parsing(false, None)
            .resolve(&config, &analysis(None, None, true));
        assert_eq!(policy.plan_expiry, None);
    }

    #[test]
    fn test_request_builder() {
        let tree = query_core::QueryNode::constant(Value::Int32(1));
        let request = QueryRequest::new(tree)
            .with_argument("minAge", 30)
            .with_options(CacheOptions::new().with_key_prefix("acme"));
        assert_eq!(request.tenant(), "acme");
        assert_eq!(request.arguments.get("minAge"), Some(&Value::Int32(30)));
    }
}
