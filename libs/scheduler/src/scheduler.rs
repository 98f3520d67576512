use std::sync::Arc;

use relay_core::{
    ActionRepository, ActionStatus, RelayError, RelayResult, ScheduledAction, new_id,
    with_timeout,
};
use relay_telemetry::{
    ACTIONS_COMPLETED, ACTIONS_FAILED, ACTIONS_RESCHEDULED, TelemetryLabels, record_counter,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::config::SchedulerConfig;
use crate::executor::{ActionContext, ActionFactory};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub owner_id: String,
    pub action_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledTask {
    pub task_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub scheduled_for: OffsetDateTime,
}

/// Counts for one poll of the scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub due: usize,
    pub completed: usize,
    pub rescheduled: usize,
    pub failed: usize,
    /// Due actions another pass claimed first.
    pub skipped: usize,
    /// Stale PROCESSING claims settled before the batch ran.
    pub recovered: usize,
    /// Actions whose claim or bookkeeping hit a storage error.
    pub errors: usize,
}

/// Single-flight polling scheduler for deferred actions.
///
/// Each tick fetches the oldest due actions and runs them one after another.
/// An action is claimed (PENDING to PROCESSING) before it executes.
pub struct ActionScheduler {
    repo: Arc<dyn ActionRepository>,
    factory: Arc<ActionFactory>,
    config: SchedulerConfig,
}

impl ActionScheduler {
    pub fn new(
        repo: Arc<dyn ActionRepository>,
        factory: Arc<ActionFactory>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo,
            factory,
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Persists a deferred action after checking its type and time window.
    pub async fn schedule(
        &self,
        request: ScheduleRequest,
        now: OffsetDateTime,
    ) -> RelayResult<ScheduledTask> {
        if request.owner_id.trim().is_empty() {
            return Err(RelayError::validation("owner_id is required"));
        }
        if !self.factory.supports(&request.action_type) {
            return Err(RelayError::UnknownActionType(request.action_type));
        }
        if request.scheduled_for < now {
            return Err(RelayError::validation("scheduled_for is in the past"));
        }
        if request.scheduled_for > now + self.config.horizon {
            return Err(RelayError::validation(format!(
                "scheduled_for is more than {} days ahead",
                self.config.horizon.as_secs() / 86_400
            )));
        }

        let action = ScheduledAction {
            id: new_id(),
            owner_id: request.owner_id,
            action_type: request.action_type,
            payload: request.payload,
            scheduled_for: request.scheduled_for,
            status: ActionStatus::Pending,
            attempts: 0,
            max_attempts: self.config.max_attempts,
            last_error: None,
            result: None,
            executed_at: None,
            created_at: now,
            updated_at: now,
        };
        self.repo.insert_action(&action).await?;
        info!(
            owner_id = %action.owner_id,
            action_id = %action.id,
            action_type = %action.action_type,
            "action scheduled"
        );
        Ok(ScheduledTask {
            task_id: action.id,
            scheduled_for: action.scheduled_for,
        })
    }

    pub async fn get_action(
        &self,
        owner_id: &str,
        action_id: &str,
    ) -> RelayResult<ScheduledAction> {
        let action = self
            .repo
            .get_action(action_id)
            .await?
            .ok_or_else(|| RelayError::not_found("action", action_id))?;
        if action.owner_id != owner_id {
            return Err(RelayError::forbidden("action", action.id));
        }
        Ok(action)
    }

    /// Runs every action due at `now`, oldest first.
    ///
    /// Stale claims are settled first. A storage error on one action is
    /// logged and counted, and the rest of the batch still runs.
    pub async fn tick(&self, now: OffsetDateTime) -> RelayResult<TickReport> {
        let mut report = TickReport::default();
        match self.release_stale(now).await {
            Ok(recovered) => report.recovered = recovered,
            Err(err) => {
                report.errors += 1;
                warn!(error = %err, "stale claim recovery failed");
            }
        }

        let due = self
            .repo
            .due_actions(now, self.config.batch_size)
            .await?;
        report.due = due.len();
        for action in due {
            let span = info_span!(
                "scheduled_action",
                action_id = %action.id,
                action_type = %action.action_type,
                owner_id = %action.owner_id,
            );
            match self.run_due(&action, now).instrument(span).await {
                Ok(None) => report.skipped += 1,
                Ok(Some(ActionStatus::Completed)) => report.completed += 1,
                Ok(Some(ActionStatus::Pending)) => report.rescheduled += 1,
                Ok(Some(_)) => report.failed += 1,
                Err(err) => {
                    report.errors += 1;
                    warn!(action_id = %action.id, error = %err, "scheduled action errored");
                }
            }
        }
        if report.due > 0 || report.recovered > 0 || report.errors > 0 {
            debug!(?report, "scheduler tick finished");
        }
        Ok(report)
    }

    async fn release_stale(&self, now: OffsetDateTime) -> RelayResult<usize> {
        let stale_before = now - self.config.processing_lease();
        let released = self.repo.release_stale_actions(stale_before, now).await?;
        for action in &released {
            let labels =
                TelemetryLabels::new(&action.owner_id).with("action_type", &action.action_type);
            if action.status == ActionStatus::Failed {
                record_counter(ACTIONS_FAILED, 1, &labels);
            } else {
                record_counter(ACTIONS_RESCHEDULED, 1, &labels);
            }
            warn!(
                action_id = %action.id,
                attempts = action.attempts,
                status = action.status.as_str(),
                "stale claim released"
            );
        }
        Ok(released.len())
    }

    /// Claims and runs one action. `None` means another pass owns it.
    async fn run_due(
        &self,
        action: &ScheduledAction,
        now: OffsetDateTime,
    ) -> RelayResult<Option<ActionStatus>> {
        if !self.repo.claim_action(&action.id, now).await? {
            return Ok(None);
        }
        self.run_claimed(action, now).await.map(Some)
    }

    /// Polls until `shutdown` flips to `true`.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            batch_size = self.config.batch_size,
            action_types = ?self.factory.action_types(),
            "scheduler started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(err) = self.tick(OffsetDateTime::now_utc()).await {
                warn!(error = %err, "scheduler tick failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("scheduler stopped");
    }

    async fn run_claimed(
        &self,
        action: &ScheduledAction,
        now: OffsetDateTime,
    ) -> RelayResult<ActionStatus> {
        let labels =
            TelemetryLabels::new(&action.owner_id).with("action_type", &action.action_type);
        let outcome = match self.factory.create(&action.action_type) {
            Ok(executor) => {
                let ctx = ActionContext {
                    owner_id: action.owner_id.clone(),
                    action_id: action.id.clone(),
                };
                with_timeout(
                    "execute_action",
                    self.config.action_timeout,
                    executor.execute(&ctx, &action.payload),
                )
                .await
            }
            Err(err) => {
                // no executor will ever exist for this tag
                let attempts = action.attempts + 1;
                self.repo
                    .fail_action(&action.id, attempts, &err.to_string(), now)
                    .await?;
                record_counter(ACTIONS_FAILED, 1, &labels);
                warn!(error = %err, "action type has no executor; failed");
                return Ok(ActionStatus::Failed);
            }
        };

        match outcome {
            Ok(data) => {
                let executed_at = OffsetDateTime::now_utc();
                let result = json!({"success": true, "data": data});
                self.repo
                    .complete_action(&action.id, &result, executed_at)
                    .await?;
                record_counter(ACTIONS_COMPLETED, 1, &labels);
                info!("action completed");
                Ok(ActionStatus::Completed)
            }
            Err(err) => {
                let attempts = action.attempts + 1;
                let error = err.to_string();
                if attempts < action.max_attempts {
                    let next_run = now + self.config.retry_delay;
                    self.repo
                        .reschedule_action(&action.id, attempts, &error, next_run)
                        .await?;
                    record_counter(ACTIONS_RESCHEDULED, 1, &labels);
                    warn!(
                        attempts,
                        max_attempts = action.max_attempts,
                        next_run = %next_run,
                        error = %error,
                        "action failed; rescheduled"
                    );
                    Ok(ActionStatus::Pending)
                } else {
                    self.repo
                        .fail_action(&action.id, attempts, &error, OffsetDateTime::now_utc())
                        .await?;
                    record_counter(ACTIONS_FAILED, 1, &labels);
                    warn!(attempts, error = %error, "action failed permanently");
                    Ok(ActionStatus::Failed)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ActionExecutor;
    use async_trait::async_trait;
    use relay_core::InMemoryRepository;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails the first `fail_first` runs.
    struct Flaky {
        fail_first: usize,
        runs: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ActionExecutor for Flaky {
        async fn execute(&self, _ctx: &ActionContext, payload: &Value) -> RelayResult<Value> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.fail_first {
                return Err(RelayError::provider("test", format!("boom {run}")));
            }
            Ok(payload.clone())
        }
    }

    fn scheduler(
        fail_first: usize,
    ) -> (Arc<InMemoryRepository>, ActionScheduler, Arc<AtomicUsize>) {
        let repo = Arc::new(InMemoryRepository::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let mut factory = ActionFactory::new();
        let counter = runs.clone();
        factory
            .register("flaky", move || {
                Arc::new(Flaky {
                    fail_first,
                    runs: counter.clone(),
                }) as Arc<dyn ActionExecutor>
            })
            .unwrap();
        let scheduler = ActionScheduler::new(
            repo.clone(),
            Arc::new(factory),
            SchedulerConfig::default(),
        );
        (repo, scheduler, runs)
    }

    fn request(at: OffsetDateTime) -> ScheduleRequest {
        ScheduleRequest {
            owner_id: "owner-1".into(),
            action_type: "flaky".into(),
            payload: json!({"n": 1}),
            scheduled_for: at,
        }
    }

    #[tokio::test]
    async fn successful_actions_complete_with_result() {
        let (_, scheduler, _) = scheduler(0);
        let now = OffsetDateTime::now_utc();
        let task = scheduler.schedule(request(now), now).await.unwrap();

        let report = scheduler.tick(now).await.unwrap();
        assert_eq!(report.completed, 1);
        let action = scheduler.get_action("owner-1", &task.task_id).await.unwrap();
        assert_eq!(action.status, ActionStatus::Completed);
        assert_eq!(action.result, Some(json!({"success": true, "data": {"n": 1}})));
        assert!(action.executed_at.is_some());
    }

    #[tokio::test]
    async fn failures_back_off_linearly_then_fail() {
        let (_, scheduler, runs) = scheduler(usize::MAX);
        let now = OffsetDateTime::now_utc();
        let task = scheduler.schedule(request(now), now).await.unwrap();
        let delay = scheduler.config().retry_delay;

        assert_eq!(scheduler.tick(now).await.unwrap().rescheduled, 1);
        let action = scheduler.get_action("owner-1", &task.task_id).await.unwrap();
        assert_eq!(action.status, ActionStatus::Pending);
        assert_eq!(action.attempts, 1);
        assert_eq!(action.scheduled_for, now + delay);
        assert_eq!(action.last_error.as_deref(), Some("provider error on test: boom 0"));

        // not due yet
        assert_eq!(scheduler.tick(now + delay / 2).await.unwrap().due, 0);

        let second = now + delay;
        assert_eq!(scheduler.tick(second).await.unwrap().rescheduled, 1);
        let third = second + delay;
        assert_eq!(scheduler.tick(third).await.unwrap().failed, 1);

        let action = scheduler.get_action("owner-1", &task.task_id).await.unwrap();
        assert_eq!(action.status, ActionStatus::Failed);
        assert_eq!(action.attempts, 3);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        assert_eq!(scheduler.tick(third + delay).await.unwrap().due, 0);
    }

    #[tokio::test]
    async fn due_actions_run_oldest_first_within_batch() {
        let (repo, scheduler, _) = scheduler(0);
        let now = OffsetDateTime::now_utc();
        let mut ids = Vec::new();
        for offset in [3i64, 1, 2] {
            let at = now + time::Duration::seconds(offset);
            ids.push(scheduler.schedule(request(at), now).await.unwrap().task_id);
        }
        let due = repo
            .due_actions(now + time::Duration::seconds(10), 10)
            .await
            .unwrap();
        let order: Vec<_> = due.iter().map(|a| a.id.clone()).collect();
        assert_eq!(order, vec![ids[1].clone(), ids[2].clone(), ids[0].clone()]);
    }

    #[tokio::test]
    async fn foreign_owners_cannot_read_actions() {
        let (_, scheduler, _) = scheduler(0);
        let now = OffsetDateTime::now_utc();
        let task = scheduler.schedule(request(now), now).await.unwrap();
        let err = scheduler.get_action("owner-2", &task.task_id).await.unwrap_err();
        assert!(matches!(err, RelayError::Forbidden { .. }));
    }

    /// Refuses to record completion for one action id.
    struct BrokenCompletion {
        inner: Arc<InMemoryRepository>,
        broken_id: std::sync::Mutex<Option<String>>,
    }

    #[async_trait]
    impl ActionRepository for BrokenCompletion {
        async fn insert_action(&self, action: &ScheduledAction) -> RelayResult<()> {
            self.inner.insert_action(action).await
        }

        async fn get_action(&self, id: &str) -> RelayResult<Option<ScheduledAction>> {
            self.inner.get_action(id).await
        }

        async fn due_actions(
            &self,
            now: OffsetDateTime,
            limit: usize,
        ) -> RelayResult<Vec<ScheduledAction>> {
            self.inner.due_actions(now, limit).await
        }

        async fn claim_action(&self, id: &str, at: OffsetDateTime) -> RelayResult<bool> {
            self.inner.claim_action(id, at).await
        }

        async fn release_stale_actions(
            &self,
            stale_before: OffsetDateTime,
            at: OffsetDateTime,
        ) -> RelayResult<Vec<ScheduledAction>> {
            self.inner.release_stale_actions(stale_before, at).await
        }

        async fn complete_action(
            &self,
            id: &str,
            result: &Value,
            executed_at: OffsetDateTime,
        ) -> RelayResult<()> {
            if self.broken_id.lock().unwrap().as_deref() == Some(id) {
                return Err(RelayError::Storage(anyhow::anyhow!("disk full")));
            }
            self.inner.complete_action(id, result, executed_at).await
        }

        async fn reschedule_action(
            &self,
            id: &str,
            attempts: u32,
            error: &str,
            next_run: OffsetDateTime,
        ) -> RelayResult<()> {
            self.inner
                .reschedule_action(id, attempts, error, next_run)
                .await
        }

        async fn fail_action(
            &self,
            id: &str,
            attempts: u32,
            error: &str,
            at: OffsetDateTime,
        ) -> RelayResult<()> {
            self.inner.fail_action(id, attempts, error, at).await
        }
    }

    #[tokio::test]
    async fn storage_error_on_one_action_does_not_stop_the_batch() {
        let inner = Arc::new(InMemoryRepository::new());
        let repo = Arc::new(BrokenCompletion {
            inner: inner.clone(),
            broken_id: std::sync::Mutex::new(None),
        });
        let (_, template, runs) = scheduler(0);
        let factory = template.factory.clone();
        let scheduler = ActionScheduler::new(repo.clone(), factory, SchedulerConfig::default());
        let now = OffsetDateTime::now_utc();
        let first = scheduler.schedule(request(now), now).await.unwrap();
        let later = now + time::Duration::seconds(1);
        let second = scheduler.schedule(request(later), now).await.unwrap();
        *repo.broken_id.lock().unwrap() = Some(first.task_id.clone());

        let report = scheduler.tick(later).await.unwrap();
        assert_eq!(report.due, 2);
        assert_eq!(report.errors, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        let done = inner.get_action(&second.task_id).await.unwrap().unwrap();
        assert_eq!(done.status, ActionStatus::Completed);

        // the orphaned claim is picked up again once its lease runs out
        *repo.broken_id.lock().unwrap() = None;
        let stuck = inner.get_action(&first.task_id).await.unwrap().unwrap();
        assert_eq!(stuck.status, ActionStatus::Processing);
        assert_eq!(scheduler.tick(later).await.unwrap().recovered, 0);

        let after_lease = later + scheduler.config().processing_lease() + Duration::from_secs(1);
        let report = scheduler.tick(after_lease).await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.completed, 1);
        let action = inner.get_action(&first.task_id).await.unwrap().unwrap();
        assert_eq!(action.status, ActionStatus::Completed);
        assert_eq!(action.attempts, 1);
        assert_eq!(action.last_error.as_deref(), Some("processing lease expired"));
    }

    #[tokio::test]
    async fn expired_claims_fail_once_attempts_run_out() {
        let (repo, template, runs) = scheduler(0);
        let config = SchedulerConfig {
            max_attempts: 1,
            ..SchedulerConfig::default()
        };
        let scheduler = ActionScheduler::new(repo.clone(), template.factory.clone(), config);
        let now = OffsetDateTime::now_utc();
        let task = scheduler.schedule(request(now), now).await.unwrap();
        // a worker claims the action and never reports back
        assert!(repo.claim_action(&task.task_id, now).await.unwrap());

        let after_lease = now + scheduler.config().processing_lease() + Duration::from_secs(1);
        let report = scheduler.tick(after_lease).await.unwrap();
        assert_eq!(report.recovered, 1);
        assert_eq!(report.due, 0);
        let action = scheduler.get_action("owner-1", &task.task_id).await.unwrap();
        assert_eq!(action.status, ActionStatus::Failed);
        assert_eq!(action.attempts, 1);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_stops_on_shutdown_signal() {
        let (_, scheduler, runs) = scheduler(0);
        let scheduler = Arc::new(scheduler);
        let now = OffsetDateTime::now_utc();
        scheduler.schedule(request(now), now).await.unwrap();

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let scheduler = scheduler.clone();
            async move { scheduler.run(rx).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
