//! Plan executor.
//!
//! The [`Reconciler`] runs the active plan, then runs it again after
//! `resync_timeout` if it succeeded or after `timeout` if it failed. Installing
//! a new plan cancels the running execution and waits for it to finish before
//! the new plan starts, so at most one execution is ever in flight.

use crate::{Plan, ReconcilerConfig, Step};
use std::sync::Arc;
use steward_core::Result;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct Reconciler {
    plan_tx: watch::Sender<Option<Arc<dyn Plan>>>,
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl Reconciler {
    /// Starts an idle reconciler. Must be called from within a Tokio runtime.
    pub fn new(config: ReconcilerConfig) -> Self {
        let config = config.normalized();
        let (plan_tx, plan_rx) = watch::channel(None);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(config, plan_rx, shutdown_rx));

        Self {
            plan_tx,
            shutdown_tx,
            task: Some(task),
        }
    }

    /// Installs `plan`, replacing the active one.
    ///
    /// Returns immediately. If several plans are installed before the
    /// reconciler gets to them, only the latest runs.
    pub fn reset(&self, plan: Arc<dyn Plan>) {
        debug!(plan = %plan.name(), "Installing plan");
        self.plan_tx.send_replace(Some(plan));
    }

    /// Cancels the running execution and waits for the reconciler to exit.
    pub async fn stop(&mut self) {
        self.shutdown_tx.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("reconciler task failed: {}", e);
            }
        }
    }
}

struct Execution {
    plan: String,
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl Execution {
    fn spawn(plan: Arc<dyn Plan>, config: ReconcilerConfig) -> Self {
        let (stop_tx, stop_rx) = oneshot::channel();
        let name = plan.name();
        let task = tokio::spawn(execute(plan, config, stop_rx));
        Self {
            plan: name,
            stop_tx,
            task,
        }
    }

    async fn cancel(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            warn!(plan = %self.plan, "plan execution failed: {}", e);
        }
        debug!(plan = %self.plan, "Plan execution cancelled");
    }
}

async fn supervise(
    config: ReconcilerConfig,
    mut plans: watch::Receiver<Option<Arc<dyn Plan>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut current: Option<Execution> = None;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = plans.changed() => {
                if changed.is_err() {
                    break;
                }
                let plan = plans.borrow_and_update().clone();
                if let Some(execution) = current.take() {
                    execution.cancel().await;
                }
                if let Some(plan) = plan {
                    current = Some(Execution::spawn(plan, config.clone()));
                }
            }
        }
    }

    if let Some(execution) = current.take() {
        execution.cancel().await;
    }
    debug!("Reconciler stopped");
}

async fn execute(plan: Arc<dyn Plan>, config: ReconcilerConfig, mut stop: oneshot::Receiver<()>) {
    let name = plan.name();
    info!(plan = %name, "Starting plan");

    loop {
        let execution = Uuid::new_v4();
        let outcome = tokio::select! {
            _ = &mut stop => return,
            outcome = run_plan(plan.as_ref(), execution) => outcome,
        };

        let delay = match outcome {
            Ok(steps) => {
                info!(plan = %name, execution = %execution, steps, "Plan converged");
                config.resync_timeout
            }
            Err(e) => {
                warn!(
                    plan = %name,
                    execution = %execution,
                    error = %e,
                    retry_in = ?config.timeout,
                    "Plan failed"
                );
                config.timeout
            }
        };

        tokio::select! {
            _ = &mut stop => return,
            _ = sleep(delay) => {}
        }
    }
}

/// Runs every step of `plan` depth-first and returns the number of steps
/// completed. Stops at the first failing step.
async fn run_plan(plan: &dyn Plan, execution: Uuid) -> Result<usize> {
    let steps = plan.create().await?;
    let mut pending: Vec<Box<dyn Step>> = steps.into_iter().rev().collect();
    let mut completed = 0;

    while let Some(step) = pending.pop() {
        let name = step.name();
        debug!(execution = %execution, step = %name, "Running step");
        let substeps = step.run().await.map_err(|e| {
            warn!(execution = %execution, step = %name, error = %e, "Step failed");
            e
        })?;
        completed += 1;
        pending.extend(substeps.into_iter().rev());
    }

    Ok(completed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use steward_core::StewardError;

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Debug)]
    struct RecordStep {
        name: String,
        log: Log,
        fail: bool,
        substeps: Vec<&'static str>,
    }

    impl RecordStep {
        fn boxed(name: &str, log: &Log) -> Box<dyn Step> {
            Box::new(Self {
                name: name.to_string(),
                log: log.clone(),
                fail: false,
                substeps: Vec::new(),
            })
        }
    }

    #[async_trait]
    impl Step for RecordStep {
        fn name(&self) -> String {
            self.name.clone()
        }

        async fn run(&self) -> Result<Vec<Box<dyn Step>>> {
            self.log.lock().push(self.name.clone());
            if self.fail {
                return Err(StewardError::unit(&self.name, "failed"));
            }
            Ok(self
                .substeps
                .iter()
                .map(|name| RecordStep::boxed(name, &self.log))
                .collect())
        }
    }

    /// Plan that counts its `create` calls and fails on demand.
    struct CountingPlan {
        name: &'static str,
        creates: AtomicUsize,
        fail: bool,
        log: Log,
    }

    impl CountingPlan {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                creates: AtomicUsize::new(0),
                fail,
                log: Log::default(),
            })
        }

        fn creates(&self) -> usize {
            self.creates.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Plan for CountingPlan {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn create(&self) -> Result<Vec<Box<dyn Step>>> {
            self.creates.fetch_add(1, Ordering::SeqCst);
            Ok(vec![Box::new(RecordStep {
                name: "step".to_string(),
                log: self.log.clone(),
                fail: self.fail,
                substeps: Vec::new(),
            })])
        }
    }

    struct StaticPlan {
        steps: Mutex<Option<Vec<Box<dyn Step>>>>,
    }

    #[async_trait]
    impl Plan for StaticPlan {
        fn name(&self) -> String {
            "static".to_string()
        }

        async fn create(&self) -> Result<Vec<Box<dyn Step>>> {
            Ok(self.steps.lock().take().unwrap_or_default())
        }
    }

    #[tokio::test]
    async fn test_runs_steps_depth_first() {
        let log = Log::default();
        let plan = StaticPlan {
            steps: Mutex::new(Some(vec![
                Box::new(RecordStep {
                    name: "a".to_string(),
                    log: log.clone(),
                    fail: false,
                    substeps: vec!["a1", "a2"],
                }),
                RecordStep::boxed("b", &log),
            ])),
        };

        let completed = run_plan(&plan, Uuid::new_v4()).await.unwrap();
        assert_eq!(completed, 4);
        assert_eq!(*log.lock(), vec!["a", "a1", "a2", "b"]);
    }

    #[tokio::test]
    async fn test_aborts_on_first_failure() {
        let log = Log::default();
        let plan = StaticPlan {
            steps: Mutex::new(Some(vec![
                RecordStep::boxed("a", &log),
                Box::new(RecordStep {
                    name: "broken".to_string(),
                    log: log.clone(),
                    fail: true,
                    substeps: vec!["never"],
                }),
                RecordStep::boxed("c", &log),
            ])),
        };

        let err = run_plan(&plan, Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, StewardError::Unit { .. }));
        assert_eq!(*log.lock(), vec!["a", "broken"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_plan_retries_after_timeout() {
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        let plan = CountingPlan::new("failing", true);
        reconciler.reset(plan.clone());

        sleep(Duration::from_secs(25)).await;
        assert_eq!(plan.creates(), 3);

        reconciler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_successful_plan_resyncs() {
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        let plan = CountingPlan::new("healthy", false);
        reconciler.reset(plan.clone());

        sleep(Duration::from_secs(25)).await;
        assert_eq!(plan.creates(), 1);

        sleep(Duration::from_secs(300)).await;
        assert_eq!(plan.creates(), 2);

        reconciler.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_coalesces_to_latest_plan() {
        let mut reconciler = Reconciler::new(ReconcilerConfig::default());
        let first = CountingPlan::new("first", false);
        let second = CountingPlan::new("second", false);
        let third = CountingPlan::new("third", false);

        reconciler.reset(first.clone());
        reconciler.reset(second.clone());
        reconciler.reset(third.clone());
        sleep(Duration::from_secs(1)).await;

        assert_eq!(first.creates(), 0);
        assert_eq!(second.creates(), 0);
        assert_eq!(third.creates(), 1);
        reconciler.stop().await;
    }

    #[derive(Debug)]
    struct SlowStep {
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    struct ActiveGuard(Arc<AtomicUsize>);

    impl Drop for ActiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Step for SlowStep {
        fn name(&self) -> String {
            "slow".to_string()
        }

        async fn run(&self) -> Result<Vec<Box<dyn Step>>> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            let _guard = ActiveGuard(self.active.clone());
            self.max_active.fetch_max(now, Ordering::SeqCst);
            sleep(Duration::from_secs(1)).await;
            Ok(Vec::new())
        }
    }

    struct SlowPlan {
        active: Arc<AtomicUsize>,
        max_active: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Plan for SlowPlan {
        fn name(&self) -> String {
            "slow".to_string()
        }

        async fn create(&self) -> Result<Vec<Box<dyn Step>>> {
            Ok(vec![Box::new(SlowStep {
                active: self.active.clone(),
                max_active: self.max_active.clone(),
            })])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_executions_never_overlap() {
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let mut reconciler = Reconciler::new(
            ReconcilerConfig::new().with_resync_timeout(Duration::from_millis(100)),
        );

        for _ in 0..10 {
            reconciler.reset(Arc::new(SlowPlan {
                active: active.clone(),
                max_active: max_active.clone(),
            }));
            sleep(Duration::from_millis(300)).await;
        }
        reconciler.stop().await;

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_halts_execution() {
        let mut reconciler = Reconciler::new(
            ReconcilerConfig::new().with_resync_timeout(Duration::from_secs(1)),
        );
        let plan = CountingPlan::new("healthy", false);
        reconciler.reset(plan.clone());
        sleep(Duration::from_millis(1500)).await;
        assert_eq!(plan.creates(), 2);

        reconciler.stop().await;
        reconciler.stop().await;
        sleep(Duration::from_secs(10)).await;
        assert_eq!(plan.creates(), 2);
    }
}
