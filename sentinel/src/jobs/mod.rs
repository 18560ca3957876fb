use crate::{AppContext, error::SentinelError};
use chrono::Utc;
use parking_lot::Mutex;
use sentinel_broker::Broker;
use sentinel_store::{
    Store,
    job::{JobHistoryRecord, JobRunState, JobSchedule, JobStatus},
};
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Job handler implementations, dispatched by job type.
pub mod handlers;

/// Expiry predicate and the default schedule set.
pub mod schedule;

/// Self-scheduling, market-aware background job loop. (C8)
///
/// Single cooperative scheduler: each tick selects enabled schedules whose expiry
/// and market-timing predicates hold and dispatches their handlers. At most one
/// instance per job id runs at a time; distinct ids may overlap. Completion and
/// failure both advance `last_run` (so backoff is measured from every attempt) and
/// write an append-only history row.
pub struct JobRuntime {
    ctx: AppContext,
    running: Arc<Mutex<HashSet<String>>>,
    tick_interval: Duration,
}

impl std::fmt::Debug for JobRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRuntime")
            .field("tick_interval", &self.tick_interval)
            .finish_non_exhaustive()
    }
}

impl JobRuntime {
    pub fn new(ctx: AppContext) -> Self {
        Self::with_tick(ctx, Duration::from_secs(60))
    }

    pub fn with_tick(ctx: AppContext, tick_interval: Duration) -> Self {
        Self {
            ctx,
            running: Arc::new(Mutex::new(HashSet::new())),
            tick_interval,
        }
    }

    /// Drive the dispatch loop until shutdown is signalled. In-flight jobs run to
    /// completion; no new work is scheduled after shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick_interval);
        info!(tick = ?self.tick_interval, "job runtime started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.tick().await {
                        error!(%err, "job runtime tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("job runtime shutting down");
                    break;
                }
            }
        }
    }

    /// One scheduling pass: evaluate every enabled schedule and dispatch the due
    /// ones.
    pub async fn tick(&self) -> Result<(), SentinelError> {
        let schedules = self.ctx.store.job_schedules().await?;
        let open_markets = self.open_market_count().await;
        let any_open = open_markets > 0;
        let now = Utc::now();

        for sched in schedules.into_iter().filter(|s| s.enabled) {
            let run = self.ctx.store.job_run_state(&sched.job_type).await?;

            if !schedule::is_expired(&sched, &run, any_open, now) {
                continue;
            }
            if !sched.market_timing.permits(open_markets) {
                continue;
            }

            self.dispatch(sched, run);
        }

        Ok(())
    }

    /// How many of the universe's markets are currently open. Broker errors count
    /// a market as closed.
    async fn open_market_count(&self) -> usize {
        let market_ids: HashSet<String> = match self.ctx.store.securities(true).await {
            Ok(securities) => securities
                .into_iter()
                .filter_map(|security| security.market_id)
                .collect(),
            Err(error) => {
                warn!(%error, "failed to load universe for market check");
                return 0;
            }
        };

        let mut open = 0;
        for market_id in market_ids {
            match self.ctx.broker.is_market_open(&market_id).await {
                Ok(true) => open += 1,
                Ok(false) => {}
                Err(error) => {
                    tracing::debug!(%error, %market_id, "market status check failed")
                }
            }
        }
        open
    }

    fn dispatch(&self, sched: JobSchedule, run: JobRunState) {
        let job_id = sched.job_type.clone();

        // Per-id exclusion: a still-running instance blocks only its own id.
        if !self.running.lock().insert(job_id.clone()) {
            return;
        }

        let ctx = self.ctx.clone();
        let running = Arc::clone(&self.running);
        tokio::spawn(async move {
            execute_job(&ctx, &sched, run).await;
            running.lock().remove(&job_id);
        });
    }
}

/// Run one job to completion and persist its outcome: a history row plus updated
/// run state (`last_run = now`; failures reset on success, incremented on failure).
pub async fn execute_job(ctx: &AppContext, sched: &JobSchedule, run: JobRunState) {
    let started = Instant::now();
    let executed_at = Utc::now();
    let result = handlers::run_job(ctx, &sched.job_type).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let (status, error_text, failures) = match &result {
        Ok(()) => (JobStatus::Completed, None, 0),
        Err(err) => {
            error!(job = %sched.job_type, %err, "job failed");
            (
                JobStatus::Failed,
                Some(err.to_string()),
                run.consecutive_failures + 1,
            )
        }
    };

    let history = JobHistoryRecord {
        job_id: sched.job_type.clone(),
        job_type: sched.job_type.clone(),
        status,
        error: error_text,
        duration_ms,
        executed_at,
        retry_count: run.consecutive_failures,
    };
    if let Err(error) = ctx.store.record_job_history(&history).await {
        error!(%error, job = %sched.job_type, "failed to record job history");
    }

    let new_state = JobRunState {
        last_run: Some(executed_at),
        consecutive_failures: failures,
    };
    if let Err(error) = ctx.store.set_job_run_state(&sched.job_type, new_state).await {
        error!(%error, job = %sched.job_type, "failed to update job run state");
    }
}
