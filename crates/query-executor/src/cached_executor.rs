//! Cached Query Executor
//!
//! Compiles query trees through the plan cache and executes them through
//! the result cache. Mutations invalidate the results read from the entity
//! types they wrote.

use crate::executor::QueryExecutor;
use crate::options::{CachePolicy, QueryRequest};
use crate::output::QueryOutput;
use query_cache::{
    CacheBackend, CacheConfig, CacheKey, CacheStats, Invalidator, KeyKind, MemoryCacheBackend,
    PlanCache, ReferenceIndex, ResultCache, SweepReport, SweepScheduler, TaskScheduler,
    TokioScheduler,
};
use query_core::{
    AsyncBackend, Backend, CancellationToken, ConverterRegistry, Converters, IdentityGenerator,
    MappingRegistry, PersistenceEnvironment, QueryError, Result, Translator, Value,
};
use query_planner::{
    analyze, canonicalize, BuildOptions, Bindings, Cacheability, CanonicalForm, CompileContext,
    Plan, PlanBuilder, SLOT_PREFIX,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Cache state shared by every call of one executor.
struct CacheLayer {
    backend: Arc<dyn CacheBackend>,
    plans: PlanCache,
    results: ResultCache,
    invalidator: Invalidator,
    sweeps: SweepScheduler,
}

impl CacheLayer {
    fn new(backend: Arc<dyn CacheBackend>, scheduler: Arc<dyn TaskScheduler>, config: &CacheConfig) -> Self {
        let references = Arc::new(ReferenceIndex::new(
            backend.clone(),
            KeyKind::Result,
            config.lock_timeout,
        ));
        let results = ResultCache::new(backend.clone(), references.clone());
        let invalidator = Invalidator::new(backend.clone(), references, results.stats());
        Self {
            plans: PlanCache::new(backend.clone()),
            results,
            invalidator,
            sweeps: SweepScheduler::new(scheduler, config.sweep.clone()),
            backend,
        }
    }
}

/// Everything a call needs once compilation is done.
struct Prepared {
    plan: Plan,
    bindings: Bindings,
    analysis: Cacheability,
    result: Option<(CacheKey, Duration)>,
}

/// A query executor with built-in caching support
pub struct CachedQueryExecutor {
    executor: QueryExecutor,
    mappings: Arc<dyn MappingRegistry>,
    translator: Arc<dyn Translator>,
    converters: Arc<dyn ConverterRegistry>,
    identity: Option<Arc<dyn IdentityGenerator>>,
    environment: Option<PersistenceEnvironment>,
    backend: Option<Arc<dyn Backend>>,
    async_backend: Option<Arc<dyn AsyncBackend>>,
    scheduler: Arc<dyn TaskScheduler>,
    config: CacheConfig,
    cache: CacheLayer,
}

impl CachedQueryExecutor {
    /// Create a new cached executor backed by an in-memory cache sized
    /// from `config`
    pub fn new(mappings: Arc<dyn MappingRegistry>, translator: Arc<dyn Translator>, config: CacheConfig) -> Self {
        let scheduler: Arc<dyn TaskScheduler> = Arc::new(TokioScheduler);
        let cache = CacheLayer::new(
            Arc::new(MemoryCacheBackend::from_config(&config)),
            scheduler.clone(),
            &config,
        );
        Self {
            executor: QueryExecutor::new(),
            mappings,
            translator,
            converters: Arc::new(Converters::new()),
            identity: None,
            environment: None,
            backend: None,
            async_backend: None,
            scheduler,
            config,
            cache,
        }
    }

    /// Create a cached executor with default configuration
    pub fn with_defaults(mappings: Arc<dyn MappingRegistry>, translator: Arc<dyn Translator>) -> Self {
        Self::new(mappings, translator, CacheConfig::default())
    }

    pub fn with_backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    pub fn with_async_backend(mut self, backend: Arc<dyn AsyncBackend>) -> Self {
        self.async_backend = Some(backend);
        self
    }

    pub fn with_converters(mut self, converters: Arc<dyn ConverterRegistry>) -> Self {
        self.converters = converters;
        self
    }

    pub fn with_identity(mut self, identity: Arc<dyn IdentityGenerator>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_environment(mut self, environment: PersistenceEnvironment) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Use a shared cache backend. Cached state built so far is dropped.
    pub fn with_cache_backend(mut self, backend: Arc<dyn CacheBackend>) -> Self {
        self.cache = CacheLayer::new(backend, self.scheduler.clone(), &self.config);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn TaskScheduler>) -> Self {
        self.scheduler = scheduler;
        self.cache = CacheLayer::new(self.cache.backend.clone(), self.scheduler.clone(), &self.config);
        self
    }

    /// Compile `request.tree` and run it on the blocking backend.
    pub fn compile_and_execute(&self, request: &QueryRequest) -> Result<QueryOutput> {
        let backend = self
            .backend
            .clone()
            .ok_or_else(|| QueryError::ExecutionError("no backend configured".into()))?;
        let prepared = self.prepare(request, false)?;
        let pager = request.pager.as_ref();

        let output = match &prepared.result {
            Some((key, expiry)) => self.cache.results.get_or_execute(
                request.tenant(),
                key,
                *expiry,
                &prepared.plan.entity_types,
                pager,
                || {
                    self.executor
                        .execute(&prepared.plan, backend.as_ref(), &prepared.bindings)
                },
            )?,
            None => self
                .executor
                .execute(&prepared.plan, backend.as_ref(), &prepared.bindings)?,
        };

        self.after_execution(request, &prepared);
        Ok(output)
    }

    /// Compile `request.tree` and run it on the async backend. The token is
    /// checked before every backend call.
    pub async fn compile_and_execute_async(
        &self,
        request: &QueryRequest,
        cancel: &CancellationToken,
    ) -> Result<QueryOutput> {
        let backend = self
            .async_backend
            .clone()
            .ok_or_else(|| QueryError::ExecutionError("no async backend configured".into()))?;
        let prepared = self.prepare(request, true)?;
        let pager = request.pager.as_ref();

        let output = match &prepared.result {
            Some((key, expiry)) => {
                self.cache
                    .results
                    .get_or_execute_async(
                        request.tenant(),
                        key,
                        *expiry,
                        &prepared.plan.entity_types,
                        pager,
                        || {
                            self.executor.execute_async(
                                &prepared.plan,
                                backend.as_ref(),
                                &prepared.bindings,
                                cancel,
                            )
                        },
                    )
                    .await?
            }
            None => {
                self.executor
                    .execute_async(&prepared.plan, backend.as_ref(), &prepared.bindings, cancel)
                    .await?
            }
        };

        self.after_execution(request, &prepared);
        Ok(output)
    }

    /// Analysis, canonicalization and the plan cache; compilation is always
    /// synchronous.
    fn prepare(&self, request: &QueryRequest, is_async: bool) -> Result<Prepared> {
        if let Some(name) = request.arguments.keys().find(|n| n.starts_with(SLOT_PREFIX)) {
            return Err(QueryError::compilation(
                format!("argument '{}' uses the reserved slot prefix", name),
                Some(request.tree.clone()),
            ));
        }

        let analysis = analyze(&request.tree);
        let canonical = canonicalize(&request.tree);
        let policy: CachePolicy = request.options.resolve(&self.config, &analysis);
        let options = BuildOptions {
            is_async,
            no_tracking: request.options.no_tracking,
        };
        let prefix = self.key_prefix(request, options);
        let pager = request.pager.as_ref();

        let build = || {
            let ctx = CompileContext {
                mappings: self.mappings.as_ref(),
                translator: self.translator.as_ref(),
                converters: self.converters.as_ref(),
                identity: self.identity.clone(),
                environment: self.environment.as_ref(),
                pager,
                options,
            };
            PlanBuilder::new(ctx).build_with_source(&canonical.tree, &request.tree)
        };

        let plan = match policy.plan_expiry {
            // A plan over live instances would capture this caller's objects
            Some(expiry) if !canonical.holds_instances => {
                let key = CacheKey::plan(&canonical.shape, &prefix);
                self.cache.plans.get_or_build(&key, expiry, pager, build)?
            }
            _ => build()?,
        };

        let mut bindings = canonical.slot_bindings();
        bindings.extend(request.arguments.clone());

        let result = match policy.result_expiry {
            Some(expiry) if !canonical.holds_instances => {
                let key = CacheKey::result(&result_text(&canonical, &request.arguments), &prefix);
                Some((key, expiry))
            }
            _ => None,
        };

        debug!(
            "Prepared {:?} plan (result cache: {})",
            plan.shape,
            result.is_some()
        );
        Ok(Prepared {
            plan,
            bindings,
            analysis,
            result,
        })
    }

    /// Everything besides the tree that changes the compiled plan.
    fn key_prefix(&self, request: &QueryRequest, options: BuildOptions) -> String {
        let environment = self
            .environment
            .as_ref()
            .map(PersistenceEnvironment::key_fragment)
            .unwrap_or_default();
        let tenant = request.tenant();
        format!(
            "{}{}{}|{}:{}|{}:{}",
            u8::from(options.is_async),
            u8::from(options.no_tracking),
            u8::from(request.pager.is_some()),
            environment.len(),
            environment,
            tenant.len(),
            tenant
        )
    }

    fn after_execution(&self, request: &QueryRequest, prepared: &Prepared) {
        let tenant = request.tenant();
        if !prepared.analysis.mutated_types.is_empty() {
            let types: Vec<String> = prepared.analysis.mutated_types.iter().cloned().collect();
            self.cache.invalidator.on_mutation(tenant, &types);
        }
        if prepared.result.is_some() {
            self.cache.sweeps.start_periodic_sweep(
                tenant,
                self.cache.results.references().clone(),
                self.cache.results.stats(),
            );
        }
    }

    /// Drop every cached result read from `entity_types` now.
    pub fn invalidate_entity_types(&self, tenant: &str, entity_types: &[String]) -> usize {
        let event = query_cache::InvalidationEvent::entities_mutated(tenant, entity_types.to_vec());
        self.cache.invalidator.handle(&event)
    }

    /// Run one sweep pass over `tenant`'s reference buckets.
    pub fn sweep_now(&self, tenant: &str) -> SweepReport {
        let report = self.cache.results.references().sweep(tenant);
        self.cache.results.stats().record_sweep();
        report
    }

    /// Clear all cached plans and results
    pub fn clear(&self) {
        if let Err(e) = self.cache.backend.clear() {
            tracing::error!("Clearing the cache failed: {}", e);
            return;
        }
        info!(
            "Cleared plan and result caches (plans: {}; results: {})",
            self.cache.plans.stats().snapshot(),
            self.cache.results.stats().snapshot()
        );
    }

    pub fn plan_cache_stats(&self) -> Arc<CacheStats> {
        self.cache.plans.stats()
    }

    pub fn result_cache_stats(&self) -> Arc<CacheStats> {
        self.cache.results.stats()
    }

    pub fn references(&self) -> &Arc<ReferenceIndex> {
        self.cache.results.references()
    }

    pub fn contains_result(&self, key: &CacheKey) -> bool {
        self.cache.results.contains(key)
    }

    pub fn is_sweep_started(&self, tenant: &str) -> bool {
        self.cache.sweeps.is_started(tenant)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Result cache key a request would use, when it uses one.
    pub fn result_key(&self, request: &QueryRequest) -> Result<Option<CacheKey>> {
        let prepared = self.prepare(request, false)?;
        Ok(prepared.result.map(|(key, _)| key))
    }
}

/// Canonical text plus the declared arguments, in name order.
fn result_text(canonical: &CanonicalForm, arguments: &Bindings) -> String {
    let mut text = canonical.text();
    let mut names: Vec<&String> = arguments.keys().collect();
    names.sort();
    for name in names {
        text.push_str(&format!("#{}:{}=", name.len(), name));
        arguments
            .get(name)
            .unwrap_or(&Value::Null)
            .encode(&mut text);
    }
    text
}

impl std::fmt::Debug for CachedQueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedQueryExecutor")
            .field("config", &self.config)
            .field("environment", &self.environment)
            .field("sync_backend", &self.backend.is_some())
            .field("async_backend", &self.async_backend.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use query_core::tree::{BinaryOperator, SelectNode, SourceRef};
    use query_core::{ColumnMap, DataType, EntityMap, Mappings, QueryNode, RelationalPlan, TranslateResult};

    struct EchoTranslator;

    impl Translator for EchoTranslator {
        fn translate(&self, plan: &RelationalPlan) -> Result<TranslateResult> {
            Ok(TranslateResult {
                command_text: format!("SELECT FROM {}", plan.table()),
                ..Default::default()
            })
        }
    }

    fn executor() -> CachedQueryExecutor {
        let mappings = Mappings::new().with(EntityMap::new(
            "Person",
            "people",
            vec![
                ColumnMap::new("Id", DataType::Int64).primary_key(),
                ColumnMap::new("Age", DataType::Int32),
            ],
        ));
        CachedQueryExecutor::new(
            Arc::new(mappings),
            Arc::new(EchoTranslator),
            CacheConfig::default().with_execution(true, Duration::from_secs(60)),
        )
    }

    fn older_than(age: i32) -> QueryRequest {
        let predicate = QueryNode::binary(
            BinaryOperator::Greater,
            QueryNode::member(
                QueryNode::parameter("p", DataType::Entity("Person".into())),
                "Age",
                DataType::Int32,
            ),
            QueryNode::constant(age),
        );
        let tree = SelectNode::new(SourceRef::new("Person", "p"))
            .filter(predicate)
            .into_node();
        QueryRequest::new(tree)
    }

    #[test]
    fn test_result_keys_follow_literals_and_tenant() {
        let executor = executor();
        let a = executor.result_key(&older_than(30)).unwrap();
        let b = executor.result_key(&older_than(30)).unwrap();
        let c = executor.result_key(&older_than(31)).unwrap();
        assert!(a.is_some());
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut tenant = older_than(30);
        tenant.options.key_prefix = Some("acme".into());
        assert_ne!(executor.result_key(&tenant).unwrap(), a);
    }

    #[test]
    fn test_arguments_are_part_of_the_result_key() {
        let executor = executor();
        let one = older_than(30).with_argument("x", 1);
        let two = older_than(30).with_argument("x", 2);
        assert_ne!(
            executor.result_key(&one).unwrap(),
            executor.result_key(&two).unwrap()
        );
    }

    #[test]
    fn test_reserved_argument_names_are_rejected() {
        let executor = executor();
        let request = older_than(30).with_argument("$0", 1);
        assert!(matches!(
            executor.result_key(&request),
            Err(QueryError::Compilation { .. })
        ));
    }

    #[test]
    fn test_missing_backend() {
        let executor = executor();
        assert!(executor.compile_and_execute(&older_than(30)).is_err());
    }
}
