//! # Supervisor
//!
//! Per worker: `Running -> Dead -> Running`. One tick:
//!
//! 1. `restart` flag: stop every worker and count a restart for each. The
//!    dead-worker scan of the *next* tick brings them back.
//! 2. `reload` flag: stop every worker, let the factory re-read its
//!    configuration, start the full roster again.
//! 3. Dead-worker scan: every expected name without a running task is
//!    spawned again. Only a tracked worker that died counts a restart; a
//!    name the roster gained since the last start is simply started.
//! 4. The live worker names are published to the control plane.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::WorkerRole;
use crate::control::ControlPlane;

/// A named worker the configuration expects to be running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub name: String,
    pub role: WorkerRole,
}

impl WorkerSpec {
    pub fn new(name: impl Into<String>, role: WorkerRole) -> Self {
        Self {
            name: name.into(),
            role,
        }
    }
}

/// # Worker Factory
///
/// Knows which workers should exist and how to start one.
#[async_trait]
pub trait WorkerFactory: Send + Sync {
    /// Workers expected under the current configuration.
    fn roster(&self) -> Vec<WorkerSpec>;

    /// Starts one worker; it must return once `cancel` fires.
    fn spawn(&self, spec: &WorkerSpec, cancel: CancellationToken) -> JoinHandle<()>;

    /// Re-reads configuration before the roster is started again.
    async fn reload(&self) {}
}

struct Running {
    spec: WorkerSpec,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// # Supervisor
pub struct Supervisor {
    control: Arc<ControlPlane>,
    factory: Arc<dyn WorkerFactory>,
    workers: BTreeMap<String, Running>,
    /// Names stopped by a restart request whose restart is already counted.
    counted: BTreeSet<String>,
    root: CancellationToken,
    interval: Duration,
    join_timeout: Duration,
}

impl Supervisor {
    pub fn new(control: Arc<ControlPlane>, factory: Arc<dyn WorkerFactory>, root: CancellationToken) -> Self {
        let config = control.config();
        Self {
            interval: Duration::from_secs(config.supervisor.interval_secs.max(1)),
            join_timeout: Duration::from_secs(config.supervisor.join_timeout_secs),
            control,
            factory,
            workers: BTreeMap::new(),
            counted: BTreeSet::new(),
            root,
        }
    }

    /// Overrides the monitor interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Overrides how long a stopping worker is waited for.
    pub fn with_join_timeout(mut self, join_timeout: Duration) -> Self {
        self.join_timeout = join_timeout;
        self
    }

    fn start(&mut self, spec: WorkerSpec) {
        let cancel = self.root.child_token();
        let handle = self.factory.spawn(&spec, cancel.clone());
        debug!(worker = %spec.name, role = %spec.role, "worker spawned");
        self.workers.insert(spec.name.clone(), Running { spec, cancel, handle });
    }

    /// Starts every expected worker that is not tracked yet.
    pub fn start_all(&mut self) {
        for spec in self.factory.roster() {
            if !self.workers.contains_key(&spec.name) {
                self.start(spec);
            }
        }
        self.publish_live();
    }

    async fn stop(&self, running: Running) {
        running.cancel.cancel();
        let mut handle = running.handle;
        match tokio::time::timeout(self.join_timeout, &mut handle).await {
            Ok(Ok(())) => debug!(worker = %running.spec.name, "worker stopped"),
            Ok(Err(e)) => warn!(worker = %running.spec.name, error = %e, "worker ended abnormally"),
            Err(_) => {
                warn!(
                    worker = %running.spec.name,
                    timeout = ?self.join_timeout,
                    "worker did not stop in time, abandoned"
                );
            }
        }
    }

    /// Stops every tracked worker; returns the specs that were stopped.
    pub async fn stop_all(&mut self) -> Vec<WorkerSpec> {
        let workers = std::mem::take(&mut self.workers);
        let mut stopped = Vec::with_capacity(workers.len());
        for (_, running) in workers {
            let spec = running.spec.clone();
            self.stop(running).await;
            stopped.push(spec);
        }
        self.publish_live();
        stopped
    }

    /// Asks one worker to stop without waiting for it. The next tick sees it
    /// dead and replaces it.
    pub fn cancel_worker(&self, name: &str) -> bool {
        match self.workers.get(name) {
            Some(running) => {
                running.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Names of tracked workers whose task is still running.
    pub fn live_workers(&self) -> BTreeSet<String> {
        self.workers
            .iter()
            .filter(|(_, running)| !running.handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn publish_live(&self) {
        self.control.set_live_workers(self.live_workers());
    }

    /// One pass of the monitor loop.
    pub async fn tick(&mut self) {
        if self.control.take_restart() {
            info!("restart requested, stopping all workers");
            for spec in self.stop_all().await {
                self.control.count_restart(spec.role);
                self.counted.insert(spec.name);
            }
            return;
        }

        if self.control.take_reload() {
            info!("reload requested, restarting all workers with fresh configuration");
            self.stop_all().await;
            self.factory.reload().await;
            self.counted.clear();
            self.start_all();
            return;
        }

        let alive = self.live_workers();
        let expected = self.factory.roster();
        let expected_names: BTreeSet<&str> = expected.iter().map(|spec| spec.name.as_str()).collect();

        // Tracked workers the roster no longer names are retired.
        let retired: Vec<String> = self
            .workers
            .keys()
            .filter(|name| !expected_names.contains(name.as_str()))
            .cloned()
            .collect();
        for name in retired {
            if let Some(running) = self.workers.remove(&name) {
                self.stop(running).await;
            }
        }

        for spec in expected {
            if alive.contains(&spec.name) {
                continue;
            }
            let was_tracked = match self.workers.remove(&spec.name) {
                Some(dead) => {
                    if let Err(e) = dead.handle.await {
                        error!(worker = %spec.name, error = %e, "worker panicked");
                    }
                    true
                }
                None => false,
            };
            let already_counted = self.counted.remove(&spec.name);
            if was_tracked && !already_counted {
                self.control.count_restart(spec.role);
                warn!(worker = %spec.name, role = %spec.role, "worker dead, respawning");
            } else if !already_counted {
                info!(worker = %spec.name, role = %spec.role, "new roster entry, starting worker");
            }
            self.start(spec);
        }
        self.publish_live();
    }

    /// # Run
    ///
    /// Starts the roster, then ticks every interval until `cancel` fires,
    /// after which every worker is stopped.
    pub async fn run(mut self, cancel: CancellationToken) {
        self.start_all();
        info!(workers = self.workers.len(), interval = ?self.interval, "supervisor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            self.tick().await;
        }
        info!("supervisor stopping workers");
        self.stop_all().await;
        info!("supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configs::AgentConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeFactory {
        roster: Mutex<Vec<WorkerSpec>>,
        spawned: AtomicUsize,
        reloads: AtomicUsize,
        /// Workers that ignore cancellation.
        stubborn: bool,
    }

    #[async_trait]
    impl WorkerFactory for FakeFactory {
        fn roster(&self) -> Vec<WorkerSpec> {
            self.roster.lock().unwrap().clone()
        }

        fn spawn(&self, _spec: &WorkerSpec, cancel: CancellationToken) -> JoinHandle<()> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            let stubborn = self.stubborn;
            tokio::spawn(async move {
                if stubborn {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                } else {
                    cancel.cancelled().await;
                }
            })
        }

        async fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup(stubborn: bool) -> (Arc<ControlPlane>, Arc<FakeFactory>, Supervisor) {
        let control = ControlPlane::with_config(AgentConfig::default());
        let factory = Arc::new(FakeFactory {
            stubborn,
            ..FakeFactory::default()
        });
        *factory.roster.lock().unwrap() = vec![
            WorkerSpec::new("probe", WorkerRole::Probe),
            WorkerSpec::new("transport", WorkerRole::Transport),
        ];
        let supervisor = Supervisor::new(control.clone(), factory.clone(), CancellationToken::new())
            .with_join_timeout(Duration::from_millis(50));
        (control, factory, supervisor)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    #[tokio::test]
    async fn dead_worker_is_respawned_and_counted() {
        let (control, factory, mut supervisor) = setup(false);
        supervisor.start_all();
        assert_eq!(factory.spawned.load(Ordering::SeqCst), 2);

        assert!(supervisor.cancel_worker("transport"));
        settle().await;
        assert!(!supervisor.live_workers().contains("transport"));

        supervisor.tick().await;
        settle().await;
        assert_eq!(factory.spawned.load(Ordering::SeqCst), 3);
        assert!(supervisor.live_workers().contains("transport"));
        assert_eq!(control.restart_count(WorkerRole::Transport), 1);
        assert_eq!(control.restart_count(WorkerRole::Probe), 0);
        assert_eq!(control.snapshot().live_worker_names.len(), 2);
    }

    #[tokio::test]
    async fn roster_additions_start_without_counting_a_restart() {
        let (control, factory, mut supervisor) = setup(false);
        supervisor.start_all();
        factory
            .roster
            .lock()
            .unwrap()
            .push(WorkerSpec::new("monitor", WorkerRole::Control));

        supervisor.tick().await;
        settle().await;
        assert!(supervisor.live_workers().contains("monitor"));
        assert_eq!(factory.spawned.load(Ordering::SeqCst), 3);
        assert_eq!(control.restart_count(WorkerRole::Control), 0);

        assert!(supervisor.cancel_worker("monitor"));
        settle().await;
        supervisor.tick().await;
        assert_eq!(control.restart_count(WorkerRole::Control), 1);
    }

    #[tokio::test]
    async fn restart_flag_stops_now_and_respawns_next_tick_counted_once() {
        let (control, factory, mut supervisor) = setup(false);
        supervisor.start_all();
        control.request_restart();

        supervisor.tick().await;
        assert!(supervisor.live_workers().is_empty());
        assert_eq!(control.restart_count(WorkerRole::Probe), 1);

        supervisor.tick().await;
        settle().await;
        assert_eq!(supervisor.live_workers().len(), 2);
        assert_eq!(control.restart_count(WorkerRole::Probe), 1);
        assert_eq!(factory.spawned.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn reload_flag_restarts_the_full_roster() {
        let (control, factory, mut supervisor) = setup(false);
        supervisor.start_all();
        factory
            .roster
            .lock()
            .unwrap()
            .push(WorkerSpec::new("monitor", WorkerRole::Control));
        control.request_reload();

        supervisor.tick().await;
        settle().await;
        assert_eq!(factory.reloads.load(Ordering::SeqCst), 1);
        assert_eq!(supervisor.live_workers().len(), 3);
        assert!(!control.reload_pending());
        assert_eq!(control.restart_count(WorkerRole::Probe), 0);
    }

    #[tokio::test]
    async fn stubborn_workers_are_abandoned_after_the_join_timeout() {
        let (_control, _factory, mut supervisor) = setup(true);
        supervisor.start_all();
        let started = tokio::time::Instant::now();
        let stopped = supervisor.stop_all().await;
        assert_eq!(stopped.len(), 2);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(supervisor.live_workers().is_empty());
    }

    #[tokio::test]
    async fn run_stops_every_worker_on_cancel() {
        let (_control, factory, supervisor) = setup(false);
        let supervisor = supervisor.with_interval(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();
        assert_eq!(factory.spawned.load(Ordering::SeqCst), 2);
    }
}
