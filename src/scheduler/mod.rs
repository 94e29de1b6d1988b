//! Scheduler module: decides which targets are due and runs their probes
//! under a shared concurrency ceiling.

mod retention;
mod state;

pub use retention::*;
pub use state::*;

use crate::classify::{record_outcome, RuleSet};
use crate::config::{ServerConfig, TargetDefaults};
use crate::db::{DbError, ProbeRecord, ProbeTarget, Store, TargetId};
use crate::probe::ProbeExecutor;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

/// Scheduler error types.
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("target {0} is unknown or disabled")]
    UnknownTarget(TargetId),
    #[error("a probe for target {0} is already running")]
    AlreadyRunning(TargetId),
    #[error("store error: {0}")]
    Store(#[from] DbError),
    #[error("scheduler is stopped")]
    Stopped,
}

/// Scheduler settings derived from the server configuration.
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub defaults: TargetDefaults,
    pub max_parallel: usize,
    pub registry_refresh: Duration,
    pub startup_jitter: Duration,
}

impl SchedulerSettings {
    pub fn from_config(cfg: &ServerConfig) -> Self {
        Self {
            defaults: cfg.target_defaults(),
            max_parallel: cfg.max_parallel_checks,
            registry_refresh: Duration::from_secs(cfg.registry_refresh_secs),
            startup_jitter: Duration::from_millis(cfg.startup_jitter_ms),
        }
    }
}

/// Point-in-time scheduler counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub targets: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub completed: u64,
    pub max_parallel: usize,
}

#[derive(Default)]
struct Counters {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicU64,
}

/// Decrements the in-flight counter when a probe finishes.
struct Running<'a>(&'a Counters);

impl Counters {
    fn enter(&self) -> Running<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        Running(self)
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.0.completed.fetch_add(1, Ordering::SeqCst);
    }
}

struct Inner {
    store: Store,
    executor: ProbeExecutor,
    settings: SchedulerSettings,
    permits: Arc<Semaphore>,
    state: Mutex<ScheduleState>,
    wake: Notify,
    shutdown: watch::Sender<bool>,
    counters: Counters,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// Manual runs; detached from their callers and drained on shutdown.
    manual: Mutex<JoinSet<()>>,
}

/// The probe scheduler. Cheap to clone; all clones share one loop.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(store: Store, executor: ProbeExecutor, settings: SchedulerSettings) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                store,
                executor,
                permits: Arc::new(Semaphore::new(settings.max_parallel.max(1))),
                settings,
                state: Mutex::new(ScheduleState::default()),
                wake: Notify::new(),
                shutdown,
                counters: Counters::default(),
                handle: Mutex::new(None),
                manual: Mutex::new(JoinSet::new()),
            }),
        }
    }

    /// Spawn the scheduling loop. Calling it again is a no-op.
    pub fn start(&self) {
        let mut handle = lock(&self.inner.handle);
        if handle.is_some() || self.inner.is_stopped() {
            return;
        }

        tracing::info!(
            "Starting scheduler (max {} parallel checks)",
            self.inner.settings.max_parallel
        );
        *handle = Some(tokio::spawn(run_loop(self.inner.clone())));
    }

    /// Probe a target immediately and return the classified record.
    ///
    /// Uses the same permit pool as scheduled probes and replaces the
    /// target's pending entry with one computed from this run's completion.
    /// The run continues to completion even if the returned future is dropped.
    pub async fn trigger_now(&self, id: TargetId) -> Result<ProbeRecord, SchedulerError> {
        let inner = &self.inner;
        if inner.is_stopped() {
            return Err(SchedulerError::Stopped);
        }

        let target = match inner.store.get_active_target(id, &inner.settings.defaults) {
            Ok(t) => t,
            Err(DbError::NotFound) => return Err(SchedulerError::UnknownTarget(id)),
            Err(e) => return Err(e.into()),
        };
        let rules = Arc::new(RuleSet::compile(&inner.store.get_status_rules()?));

        let (tx, rx) = oneshot::channel();
        {
            let mut manual = lock(&inner.manual);
            if inner.is_stopped() {
                return Err(SchedulerError::Stopped);
            }
            {
                let mut state = inner.state();
                if !state.begin(id) {
                    return Err(SchedulerError::AlreadyRunning(id));
                }
                state.cancel_pending(id);
                state.track(target.clone());
            }

            while let Some(joined) = manual.try_join_next() {
                if let Err(e) = joined {
                    tracing::error!("Manual probe task failed: {}", e);
                }
            }

            let run = inner.clone();
            manual.spawn(async move {
                let permit = match run.permits.clone().acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => {
                        run.state().abandon(id, Utc::now());
                        return;
                    }
                };

                tracing::info!("Manual probe of {} ({} / {})", id, target.provider_name, target.model_display_name);
                let result = run.run_probe(target, rules, permit).await;
                if tx.send(result).is_err() {
                    tracing::debug!("Caller of manual probe {} went away before it finished", id);
                }
            });
        }

        match rx.await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SchedulerError::Stopped),
        }
    }

    /// Wake the loop so it re-reads the registry now.
    pub fn reconfigure(&self) {
        self.inner.wake.notify_one();
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.inner.state();
        let counters = &self.inner.counters;
        SchedulerStats {
            targets: state.known(),
            queued: state.queued(),
            in_flight: counters.in_flight.load(Ordering::SeqCst),
            peak_in_flight: counters.peak.load(Ordering::SeqCst),
            completed: counters.completed.load(Ordering::SeqCst),
            max_parallel: self.inner.settings.max_parallel,
        }
    }

    /// Stop dispatching and wait for in-flight probes, scheduled and manual, to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let handle = lock(&self.inner.handle).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler loop ended abnormally: {}", e);
            }
        }

        let mut manual = std::mem::take(&mut *lock(&self.inner.manual));
        while let Some(joined) = manual.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Manual probe task failed: {}", e);
            }
        }
        tracing::info!("Scheduler stopped");
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, ScheduleState> {
        lock(&self.state)
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Re-read the registry and the rules. On failure the previous snapshot stays.
    fn refresh(&self) -> Result<RuleSet, DbError> {
        let targets = self.store.list_active_targets(&self.settings.defaults)?;
        let rules = RuleSet::compile(&self.store.get_status_rules()?);

        tracing::debug!("Loaded {} targets and {} status rules", targets.len(), rules.len());

        let jitter_ms = self.settings.startup_jitter.as_millis() as u64;
        let mut rng = rand::thread_rng();
        let summary = self.state().reconcile(targets, Utc::now(), |_| {
            if jitter_ms == 0 {
                Duration::ZERO
            } else {
                Duration::from_millis(rng.gen_range(0..jitter_ms))
            }
        });

        if summary.added > 0 || summary.removed > 0 {
            tracing::info!(
                "Registry refreshed: {} targets added, {} removed",
                summary.added,
                summary.removed
            );
        }
        Ok(rules)
    }

    /// Time until the next pass: the earliest due time, at most the refresh period.
    fn idle_for(&self) -> Duration {
        let refresh = self.settings.registry_refresh;
        match self.state().next_due() {
            Some(at) => (at - Utc::now()).to_std().unwrap_or(Duration::ZERO).min(refresh),
            None => refresh,
        }
    }

    async fn run_probe(
        self: Arc<Self>,
        target: ProbeTarget,
        rules: Arc<RuleSet>,
        _permit: OwnedSemaphorePermit,
    ) -> Result<ProbeRecord, DbError> {
        let running = self.counters.enter();
        let checked_at = Utc::now();
        let outcome = self.executor.probe(&target).await;

        let result = record_outcome(&self.store, target.id, &outcome, &rules, checked_at);
        match &result {
            Ok(record) => tracing::info!(
                "Probe {} ({} / {}): {} status={:?} latency={:?}ms",
                target.id,
                target.provider_name,
                target.model_display_name,
                record.category,
                record.http_status,
                record.latency_ms
            ),
            Err(e) => tracing::error!("Failed to store probe result for {}: {}", target.id, e),
        }

        self.state().complete(target.id, Utc::now());
        drop(running);
        self.wake.notify_one();
        result
    }
}

async fn run_loop(inner: Arc<Inner>) {
    let mut shutdown = inner.shutdown.subscribe();
    let mut tasks = JoinSet::new();
    let mut rules = Arc::new(RuleSet::default());

    'passes: loop {
        if *shutdown.borrow() {
            break;
        }

        let refreshed = match inner.refresh() {
            Ok(r) => {
                rules = Arc::new(r);
                true
            }
            Err(e) => {
                tracing::warn!("Registry read failed, skipping pass: {}", e);
                false
            }
        };

        while refreshed {
            let due = inner.state().has_due(Utc::now());
            if !due {
                break;
            }
            let permit = tokio::select! {
                p = inner.permits.clone().acquire_owned() => match p {
                    Ok(p) => p,
                    Err(_) => break 'passes,
                },
                _ = shutdown.changed() => break 'passes,
            };

            let Some(target) = inner.state().pop_due(Utc::now()) else {
                break;
            };
            tasks.spawn(inner.clone().run_probe(target, rules.clone(), permit));
        }

        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                tracing::error!("Probe task failed: {}", e);
            }
        }

        let idle = if refreshed {
            inner.idle_for()
        } else {
            inner.settings.registry_refresh
        };
        tokio::select! {
            _ = tokio::time::sleep(idle) => {}
            _ = inner.wake.notified() => {}
            _ = shutdown.changed() => break,
        }
    }

    if !tasks.is_empty() {
        tracing::info!("Waiting for {} in-flight probes", tasks.len());
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!("Probe task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::seeded_store;
    use crate::db::{Category, Model, StatusRule};
    use tokio_test::{assert_err, assert_ok};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(max_parallel: usize) -> SchedulerSettings {
        SchedulerSettings {
            defaults: TargetDefaults {
                interval: Duration::from_secs(3600),
                timeout: Duration::from_secs(5),
            },
            max_parallel,
            registry_refresh: Duration::from_millis(50),
            startup_jitter: Duration::ZERO,
        }
    }

    fn add_models(store: &Store, provider_id: i64, template_id: i64, count: usize) {
        for i in 0..count {
            let mut model = Model {
                name: format!("extra-{}", i),
                model_name: format!("extra-{}", i),
                display_name: format!("Extra {}", i),
                template_id: Some(template_id),
                enabled: true,
                ..Default::default()
            };
            store.add_model(&mut model).unwrap();
            store.link_provider_model(provider_id, model.id, None).unwrap();
        }
    }

    async fn wait_for_completed(scheduler: &Scheduler, n: u64) {
        let waited = tokio::time::timeout(Duration::from_secs(10), async {
            while scheduler.stats().completed < n {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert_ok!(waited);
    }

    #[tokio::test]
    async fn test_concurrency_never_exceeds_ceiling() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"content": [{"type": "text", "text": "pong"}]}))
                    .set_delay(Duration::from_millis(200)),
            )
            .mount(&server)
            .await;

        let (_tmp, store, id) = seeded_store(&server.uri());
        add_models(&store, id.provider_id, 1, 5);

        let scheduler = Scheduler::new(store.clone(), ProbeExecutor::new().unwrap(), settings(2));
        scheduler.start();
        wait_for_completed(&scheduler, 6).await;
        scheduler.shutdown().await;

        let stats = scheduler.stats();
        assert_eq!(stats.targets, 6);
        assert_eq!(stats.peak_in_flight, 2);
        assert_eq!(stats.in_flight, 0);
        // Each target ran once and is now waiting a full interval
        assert_eq!(stats.queued, 6);
        assert_eq!(store.get_history(id, 1, 10).unwrap().total, 1);
    }

    #[tokio::test]
    async fn test_trigger_now_classifies_transport_failure() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let (_tmp, store, id) = seeded_store(&format!("http://{}", addr));
        let mut rule = StatusRule {
            id: 0,
            name: "Unreachable".to_string(),
            category: Category::Unhealthy,
            http_code_pattern: None,
            response_regex: Some("connect|refused".to_string()),
            priority: 0,
        };
        store.add_status_rule(&mut rule).unwrap();

        let scheduler = Scheduler::new(store.clone(), ProbeExecutor::new().unwrap(), settings(1));
        let record = scheduler.trigger_now(id).await.unwrap();

        assert_eq!(record.category, Category::Unhealthy);
        assert_eq!(record.rule_name.as_deref(), Some("Unreachable"));
        assert_eq!(record.http_status, None);
        assert_eq!(scheduler.stats().queued, 1);
        assert_eq!(scheduler.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_trigger_now_rejects_duplicate_and_unknown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let (_tmp, store, id) = seeded_store(&server.uri());
        let scheduler = Scheduler::new(store, ProbeExecutor::new().unwrap(), settings(2));

        let first = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.trigger_now(id).await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(matches!(
            scheduler.trigger_now(id).await,
            Err(SchedulerError::AlreadyRunning(_))
        ));
        assert_ok!(first.await.unwrap());

        let missing = TargetId::new(99, 99);
        assert!(matches!(
            scheduler.trigger_now(missing).await,
            Err(SchedulerError::UnknownTarget(_))
        ));
    }

    #[tokio::test]
    async fn test_disabled_target_is_dropped_on_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (_tmp, store, id) = seeded_store(&server.uri());
        let scheduler = Scheduler::new(store.clone(), ProbeExecutor::new().unwrap(), settings(1));
        scheduler.start();
        wait_for_completed(&scheduler, 1).await;

        store.set_provider_enabled(id.provider_id, false).unwrap();
        scheduler.reconfigure();
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.stats().targets > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        assert_ok!(waited);
        assert_eq!(scheduler.stats().queued, 0);

        scheduler.shutdown().await;
        assert_err!(scheduler.trigger_now(id).await);
    }

    async fn wait_for_in_flight(scheduler: &Scheduler, n: usize) {
        let waited = tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.stats().in_flight < n {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert_ok!(waited);
    }

    async fn slow_provider(delay: Duration) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(delay))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_abandoned_trigger_still_completes_and_reschedules() {
        let server = slow_provider(Duration::from_millis(500)).await;
        let (_tmp, store, id) = seeded_store(&server.uri());
        let scheduler = Scheduler::new(store.clone(), ProbeExecutor::new().unwrap(), settings(1));

        // The caller gives up long before the provider answers
        let abandoned = tokio::time::timeout(Duration::from_millis(100), scheduler.trigger_now(id)).await;
        assert_err!(abandoned);

        wait_for_completed(&scheduler, 1).await;
        let stats = scheduler.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.queued, 1);
        assert_eq!(store.get_history(id, 1, 10).unwrap().total, 1);

        assert_ok!(scheduler.trigger_now(id).await);
        assert_eq!(store.get_history(id, 1, 10).unwrap().total, 2);
    }

    #[tokio::test]
    async fn test_failed_registry_read_dispatches_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (tmp, store, _id) = seeded_store(&server.uri());
        let mut s = settings(1);
        s.defaults.interval = Duration::from_secs(1);
        let scheduler = Scheduler::new(store, ProbeExecutor::new().unwrap(), s);
        scheduler.start();
        wait_for_completed(&scheduler, 1).await;

        let conn = rusqlite::Connection::open(tmp.path()).unwrap();
        conn.busy_timeout(Duration::from_secs(2)).unwrap();
        conn.execute_batch("DROP TABLE provider_models").unwrap();

        // Several intervals pass while every registry read fails
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(scheduler.stats().completed, 1);
        assert_eq!(scheduler.stats().in_flight, 0);

        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_scheduled_run() {
        let server = slow_provider(Duration::from_millis(400)).await;
        let (_tmp, store, id) = seeded_store(&server.uri());
        let scheduler = Scheduler::new(store.clone(), ProbeExecutor::new().unwrap(), settings(1));
        scheduler.start();
        wait_for_in_flight(&scheduler, 1).await;

        scheduler.shutdown().await;

        let stats = scheduler.stats();
        assert_eq!(stats.in_flight, 0);
        assert_eq!(stats.completed, 1);
        let history = store.get_history(id, 1, 10).unwrap();
        assert_eq!(history.total, 1);
        assert_eq!(history.items[0].http_status, Some(200));
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_manual_run() {
        let server = slow_provider(Duration::from_millis(400)).await;
        let (_tmp, store, id) = seeded_store(&server.uri());
        let scheduler = Scheduler::new(store.clone(), ProbeExecutor::new().unwrap(), settings(1));

        let manual = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.trigger_now(id).await }
        });
        wait_for_in_flight(&scheduler, 1).await;

        scheduler.shutdown().await;

        assert_eq!(scheduler.stats().in_flight, 0);
        assert_eq!(store.get_history(id, 1, 10).unwrap().total, 1);
        assert_ok!(manual.await.unwrap());
        assert!(matches!(scheduler.trigger_now(id).await, Err(SchedulerError::Stopped)));
    }
}
