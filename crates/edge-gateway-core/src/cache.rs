//! Compiled module cache.
//!
//! [`ModuleCache`] keeps one compiled module per deploy and shares it across
//! every concurrent invocation of that deploy.
//!
//! # Compilation
//!
//! The first caller for an uncached deploy becomes the leader: it parks a
//! `Compiling` slot in the map and starts the compile on a detached task
//! (itself on the blocking pool). Every caller, leader included, then waits
//! on the slot's watch channel. Because the compile task is detached, a
//! caller that gives up (timeout, client disconnect) never strands the slot.
//!
//! Failures are handed to the waiting callers and then forgotten; the next
//! request compiles again. The compile task also keeps per-deploy compile
//! health: each compilation counts once, however many callers waited on it,
//! and after `compile_failure_threshold` consecutive failures the deploy fails
//! fast for the cool-down period instead of being recompiled.
//!
//! # Eviction
//!
//! [`ModuleCache::evict`] removes a deploy outright. When the cache is capped
//! the least recently used ready module is dropped after each insert. An
//! eviction that lands while a compile is in flight wins: the compile still
//! answers its waiters but its module is not stored.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use edge_gateway_common::{CacheConfig, DeployId, GatewayError};

use crate::sandbox::{DeployArtifact, Sandbox};

type Published<M> = Option<Result<Arc<M>, String>>;

enum Slot<M> {
    Ready {
        module: Arc<M>,
        last_used: AtomicU64,
    },
    Compiling {
        generation: u64,
        done: watch::Receiver<Published<M>>,
    },
}

struct CacheInner<M> {
    slots: DashMap<DeployId, Slot<M>>,
    /// Logical clock for LRU ordering.
    clock: AtomicU64,
    next_generation: AtomicU64,
    max_modules: usize,
    health: CompileHealth,
}

/// Per-deploy compile failure tracking.
struct CompileHealth {
    failures: DashMap<DeployId, HealthEntry>,
    threshold: u32,
    cooldown: Duration,
}

#[derive(Debug, Clone, Copy)]
struct HealthEntry {
    consecutive_failures: u32,
    unhealthy_until: Option<Instant>,
}

impl CompileHealth {
    fn new(config: &CacheConfig) -> Self {
        Self {
            failures: DashMap::new(),
            threshold: config.compile_failure_threshold,
            cooldown: config.compile_cooldown(),
        }
    }

    fn check(&self, deploy_id: &DeployId) -> Result<(), GatewayError> {
        let Some(entry) = self.failures.get(deploy_id) else {
            return Ok(());
        };
        match entry.unhealthy_until {
            Some(until) if Instant::now() < until => Err(GatewayError::compile_failed(format!(
                "Deploy {deploy_id} is unhealthy after {} failed compilations",
                entry.consecutive_failures
            ))),
            _ => Ok(()),
        }
    }

    fn record_failure(&self, deploy_id: &DeployId) {
        if self.threshold == 0 {
            return;
        }
        let mut entry = self
            .failures
            .entry(deploy_id.clone())
            .or_insert(HealthEntry {
                consecutive_failures: 0,
                unhealthy_until: None,
            });
        entry.consecutive_failures += 1;
        if entry.consecutive_failures >= self.threshold {
            entry.unhealthy_until = Some(Instant::now() + self.cooldown);
            warn!(
                deploy_id = %deploy_id,
                failures = entry.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Deploy marked unhealthy"
            );
        }
    }

    fn reset(&self, deploy_id: &DeployId) {
        self.failures.remove(deploy_id);
    }
}

/// Deploy-keyed cache of compiled modules with single-flight compilation.
pub struct ModuleCache<S: Sandbox> {
    sandbox: Arc<S>,
    inner: Arc<CacheInner<S::Module>>,
}

impl<S: Sandbox> ModuleCache<S> {
    /// Create an empty cache compiling through `sandbox`.
    pub fn new(sandbox: Arc<S>, config: &CacheConfig) -> Self {
        Self {
            sandbox,
            inner: Arc::new(CacheInner {
                slots: DashMap::new(),
                clock: AtomicU64::new(0),
                next_generation: AtomicU64::new(0),
                max_modules: config.max_modules,
                health: CompileHealth::new(config),
            }),
        }
    }

    /// Get the sandbox modules are compiled with.
    pub fn sandbox(&self) -> &Arc<S> {
        &self.sandbox
    }

    /// Get a ready module without compiling.
    pub fn get(&self, deploy_id: &DeployId) -> Option<Arc<S::Module>> {
        let slot = self.inner.slots.get(deploy_id)?;
        match slot.value() {
            Slot::Ready { module, last_used } => {
                last_used.store(self.inner.tick(), Ordering::Relaxed);
                Some(Arc::clone(module))
            }
            Slot::Compiling { .. } => None,
        }
    }

    /// Fail fast if `deploy_id` is cooling down after repeated compile
    /// failures.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CompileFailed`] while the deploy is unhealthy.
    pub fn check_health(&self, deploy_id: &DeployId) -> Result<(), GatewayError> {
        self.inner.health.check(deploy_id)
    }

    /// Return the compiled module for `artifact`, compiling it at most once.
    ///
    /// Concurrent callers for the same deploy share one compilation and all
    /// receive its module or its error.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::CompileFailed`] when the artifact does not
    /// compile, or without compiling while the deploy is unhealthy.
    pub async fn get_or_compile(
        &self,
        artifact: DeployArtifact,
    ) -> Result<Arc<S::Module>, GatewayError> {
        let mut done = match self.inner.slots.entry(artifact.deploy_id.clone()) {
            Entry::Occupied(entry) => match entry.get() {
                Slot::Ready { module, last_used } => {
                    last_used.store(self.inner.tick(), Ordering::Relaxed);
                    return Ok(Arc::clone(module));
                }
                Slot::Compiling { done, .. } => done.clone(),
            },
            Entry::Vacant(entry) => {
                self.inner.health.check(entry.key())?;
                let generation = self.inner.next_generation.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = watch::channel(None);
                entry.insert(Slot::Compiling {
                    generation,
                    done: rx.clone(),
                });
                self.spawn_compile(artifact, generation, tx);
                rx
            }
        };

        let published = done
            .wait_for(Option::is_some)
            .await
            .map_err(|_| GatewayError::compile_failed("Compilation task ended without a result"))?;

        match published.as_ref() {
            Some(Ok(module)) => Ok(Arc::clone(module)),
            Some(Err(reason)) => Err(GatewayError::compile_failed(reason.clone())),
            None => Err(GatewayError::compile_failed("Compilation produced no result")),
        }
    }

    fn spawn_compile(
        &self,
        artifact: DeployArtifact,
        generation: u64,
        tx: watch::Sender<Published<S::Module>>,
    ) {
        let sandbox = Arc::clone(&self.sandbox);
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            let deploy_id = artifact.deploy_id.clone();
            let start = Instant::now();

            let compiled = tokio::task::spawn_blocking(move || sandbox.compile(&artifact))
                .await
                .unwrap_or_else(|e| {
                    Err(GatewayError::compile_failed(format!(
                        "Compilation task failed: {e}"
                    )))
                });

            let published = match compiled {
                Ok(module) => {
                    inner.health.reset(&deploy_id);
                    info!(
                        deploy_id = %deploy_id,
                        duration_ms = start.elapsed().as_millis(),
                        "Deploy compiled"
                    );
                    Ok(Arc::new(module))
                }
                Err(e) => {
                    warn!(deploy_id = %deploy_id, error = %e, "Deploy failed to compile");
                    inner.health.record_failure(&deploy_id);
                    Err(match e {
                        GatewayError::CompileFailed { reason } => reason,
                        other => other.to_string(),
                    })
                }
            };

            inner.publish(&deploy_id, generation, &published);
            tx.send_replace(Some(published));
        });
    }

    /// Drop the module for `deploy_id`, or cancel storing an in-flight one.
    /// Compile health for the deploy is forgotten too.
    ///
    /// Returns `true` if a module or compile was removed.
    pub fn evict(&self, deploy_id: &DeployId) -> bool {
        self.inner.health.reset(deploy_id);
        let removed = self.inner.slots.remove(deploy_id).is_some();
        if removed {
            debug!(deploy_id = %deploy_id, "Module evicted");
        }
        removed
    }

    /// Number of ready modules.
    pub fn len(&self) -> usize {
        self.inner.ready_count()
    }

    /// Check if no module is ready.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deploys with a ready module, in no particular order.
    pub fn cached_ids(&self) -> Vec<DeployId> {
        self.inner
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready { .. }))
            .map(|slot| slot.key().clone())
            .collect()
    }
}

impl<M> CacheInner<M> {
    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    fn ready_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Ready { .. }))
            .count()
    }

    /// Store a finished compile, unless its slot was evicted or replaced.
    fn publish(&self, deploy_id: &DeployId, generation: u64, published: &Result<Arc<M>, String>) {
        if let Entry::Occupied(mut entry) = self.slots.entry(deploy_id.clone()) {
            let current = matches!(
                entry.get(),
                Slot::Compiling { generation: g, .. } if *g == generation
            );
            if !current {
                return;
            }
            match published {
                Ok(module) => {
                    entry.insert(Slot::Ready {
                        module: Arc::clone(module),
                        last_used: AtomicU64::new(self.tick()),
                    });
                }
                Err(_) => {
                    entry.remove();
                }
            }
        } else {
            debug!(deploy_id = %deploy_id, "Compiled module discarded after eviction");
            return;
        }

        self.enforce_capacity();
    }

    fn enforce_capacity(&self) {
        if self.max_modules == 0 {
            return;
        }

        while self.ready_count() > self.max_modules {
            let oldest = self
                .slots
                .iter()
                .filter_map(|slot| match slot.value() {
                    Slot::Ready { last_used, .. } => {
                        Some((last_used.load(Ordering::Relaxed), slot.key().clone()))
                    }
                    Slot::Compiling { .. } => None,
                })
                .min_by_key(|(last_used, _)| *last_used);

            let Some((_, deploy_id)) = oldest else {
                return;
            };

            self.slots
                .remove_if(&deploy_id, |_, slot| matches!(slot, Slot::Ready { .. }));
            debug!(deploy_id = %deploy_id, "Least recently used module evicted");
        }
    }
}

impl<S: Sandbox> std::fmt::Debug for ModuleCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleCache")
            .field("ready", &self.len())
            .field("max_modules", &self.inner.max_modules)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;

    use edge_gateway_common::{ExecutionConfig, ExecutionError, RequestRecord, Runtime};

    use super::*;
    use crate::sandbox::{GuestModule, RawOutput};

    #[derive(Debug)]
    struct StubModule {
        deploy_id: DeployId,
    }

    impl GuestModule for StubModule {
        fn deploy_id(&self) -> &DeployId {
            &self.deploy_id
        }
    }

    /// Counts compilations; artifacts starting with `bad` fail.
    #[derive(Default)]
    struct CountingSandbox {
        compiles: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl Sandbox for CountingSandbox {
        type Module = StubModule;

        fn compile(&self, artifact: &DeployArtifact) -> Result<StubModule, GatewayError> {
            self.compiles.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            if artifact.bytes.starts_with(b"bad") {
                return Err(GatewayError::compile_failed("bad artifact"));
            }
            Ok(StubModule {
                deploy_id: artifact.deploy_id.clone(),
            })
        }

        async fn run(
            &self,
            _module: Arc<StubModule>,
            _request: &RequestRecord,
            _limits: &ExecutionConfig,
        ) -> Result<RawOutput, ExecutionError> {
            Ok(RawOutput::default())
        }
    }

    fn artifact(id: &str, bytes: &'static [u8]) -> DeployArtifact {
        DeployArtifact {
            deploy_id: DeployId::new(id),
            runtime: Runtime::Go,
            bytes: Bytes::from_static(bytes),
        }
    }

    fn cache(delay: Duration, max_modules: usize) -> ModuleCache<CountingSandbox> {
        cache_with(
            delay,
            CacheConfig {
                max_modules,
                compile_failure_threshold: 0,
                ..Default::default()
            },
        )
    }

    fn cache_with(delay: Duration, config: CacheConfig) -> ModuleCache<CountingSandbox> {
        let sandbox = Arc::new(CountingSandbox {
            compiles: AtomicUsize::new(0),
            delay,
        });
        ModuleCache::new(sandbox, &config)
    }

    fn health_config(threshold: u32) -> CacheConfig {
        CacheConfig {
            compile_failure_threshold: threshold,
            compile_cooldown_secs: 60,
            ..Default::default()
        }
    }

    fn compiles(cache: &ModuleCache<CountingSandbox>) -> usize {
        cache.sandbox().compiles.load(Ordering::SeqCst)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_use_compiles_once() {
        let cache = Arc::new(cache(Duration::from_millis(50), 0));

        let mut tasks = Vec::new();
        for _ in 0..32 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                cache.get_or_compile(artifact("d1", b"ok")).await
            }));
        }

        let mut modules = Vec::new();
        for task in tasks {
            modules.push(task.await.unwrap().unwrap());
        }

        assert_eq!(compiles(&cache), 1);
        assert!(modules.iter().all(|m| Arc::ptr_eq(m, &modules[0])));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_hit_does_not_recompile() {
        let cache = cache(Duration::ZERO, 0);

        let first = cache.get_or_compile(artifact("d1", b"ok")).await.unwrap();
        let second = cache.get_or_compile(artifact("d1", b"ok")).await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(compiles(&cache), 1);
        assert!(cache.get(&DeployId::new("d1")).is_some());
    }

    #[tokio::test]
    async fn test_failures_are_not_cached() {
        let cache = cache(Duration::ZERO, 0);

        let err = cache.get_or_compile(artifact("d1", b"bad")).await.unwrap_err();
        assert!(matches!(err, GatewayError::CompileFailed { ref reason } if reason == "bad artifact"));
        assert!(cache.is_empty());

        assert!(cache.get_or_compile(artifact("d1", b"bad")).await.is_err());
        assert_eq!(compiles(&cache), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_waiters_share_failure() {
        let cache = Arc::new(cache(Duration::from_millis(50), 0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                cache.get_or_compile(artifact("d1", b"bad")).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_err());
        }

        assert_eq!(compiles(&cache), 1);
    }

    #[tokio::test]
    async fn test_repeated_failures_fail_fast() {
        let cache = cache_with(Duration::ZERO, health_config(2));
        let deploy_id = DeployId::new("d1");

        for _ in 0..2 {
            assert!(cache.get_or_compile(artifact("d1", b"bad")).await.is_err());
        }
        assert!(cache.check_health(&deploy_id).is_err());

        let err = cache.get_or_compile(artifact("d1", b"bad")).await.unwrap_err();
        assert!(matches!(err, GatewayError::CompileFailed { ref reason } if reason.contains("unhealthy")));
        assert_eq!(compiles(&cache), 2);

        // Eviction forgets the history
        cache.evict(&deploy_id);
        assert!(cache.check_health(&deploy_id).is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shared_failure_counts_once() {
        let cache = Arc::new(cache_with(Duration::from_millis(50), health_config(3)));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            tasks.push(tokio::spawn(async move {
                cache.get_or_compile(artifact("d1", b"bad")).await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_err());
        }
        assert_eq!(compiles(&cache), 1);

        // One failed compilation, not eight
        assert!(cache.check_health(&DeployId::new("d1")).is_ok());
        assert!(cache.get_or_compile(artifact("d1", b"bad")).await.is_err());
        assert_eq!(compiles(&cache), 2);
    }

    #[tokio::test]
    async fn test_lru_cap() {
        let cache = cache(Duration::ZERO, 2);

        cache.get_or_compile(artifact("a", b"ok")).await.unwrap();
        cache.get_or_compile(artifact("b", b"ok")).await.unwrap();
        // Touch "a" so "b" becomes the oldest
        cache.get_or_compile(artifact("a", b"ok")).await.unwrap();
        cache.get_or_compile(artifact("c", b"ok")).await.unwrap();

        let mut ids: Vec<String> = cache.cached_ids().iter().map(ToString::to_string).collect();
        ids.sort();
        assert_eq!(ids, ["a", "c"]);
    }

    #[tokio::test]
    async fn test_evict() {
        let cache = cache(Duration::ZERO, 0);

        cache.get_or_compile(artifact("d1", b"ok")).await.unwrap();
        assert!(cache.evict(&DeployId::new("d1")));
        assert!(!cache.evict(&DeployId::new("d1")));
        assert!(cache.get(&DeployId::new("d1")).is_none());

        cache.get_or_compile(artifact("d1", b"ok")).await.unwrap();
        assert_eq!(compiles(&cache), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_eviction_during_compile_wins() {
        let cache = Arc::new(cache(Duration::from_millis(100), 0));

        let waiter = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_compile(artifact("d1", b"ok")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cache.evict(&DeployId::new("d1")));

        // The waiter still gets its module, but it is not stored
        assert!(waiter.await.unwrap().is_ok());
        assert!(cache.get(&DeployId::new("d1")).is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancelled_caller_does_not_strand_slot() {
        let cache = Arc::new(cache(Duration::from_millis(100), 0));

        let caller = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.get_or_compile(artifact("d1", b"ok")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        caller.abort();

        let module = cache.get_or_compile(artifact("d1", b"ok")).await.unwrap();
        assert_eq!(module.deploy_id().as_str(), "d1");
        assert_eq!(compiles(&cache), 1);
    }
}
