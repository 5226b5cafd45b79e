//! Interval scheduling of incremental sync runs.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use govmatch_core::{JobOutcome, JobStatus};
use govmatch_storage::{Store, SYNC_LEASE};
use tokio::task::JoinHandle;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::manager::SyncManager;

/// Upper bound on waiting for in-flight work when stopping.
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One lease-guarded incremental sync, recorded in the job history.
pub struct ScheduledSync {
    manager: Arc<SyncManager>,
    store: Arc<dyn Store>,
    max_opportunities: usize,
    lease_ttl: Duration,
}

impl ScheduledSync {
    pub fn new(manager: Arc<SyncManager>, max_opportunities: usize, lease_ttl: Duration) -> Self {
        let store = manager.store();
        Self {
            manager,
            store,
            max_opportunities,
            lease_ttl,
        }
    }

    pub async fn run_once(&self) -> JobOutcome {
        let holder = Uuid::new_v4();
        let executed_at = Utc::now();

        let (status, result, error) = match self
            .store
            .try_acquire_lease(SYNC_LEASE, holder, self.lease_ttl)
            .await
        {
            Ok(false) => {
                info!("another sync run holds the lease; skipping");
                (JobStatus::Skipped, None, Some("sync lease held by another run".to_string()))
            }
            Err(err) => {
                error!(error = %err, "could not acquire sync lease");
                (JobStatus::Failed, None, Some(err.to_string()))
            }
            Ok(true) => {
                let run = self.manager.incremental_sync(self.max_opportunities).await;
                if let Err(err) = self.store.release_lease(SYNC_LEASE, holder).await {
                    warn!(error = %err, "could not release sync lease");
                }
                match run {
                    Ok(report) => {
                        info!(
                            new = report.new_opportunities,
                            total_synced = report.total_synced,
                            "scheduled sync finished"
                        );
                        (JobStatus::Success, serde_json::to_value(&report).ok(), None)
                    }
                    Err(err) => {
                        error!(error = %err, "scheduled sync failed");
                        (JobStatus::Failed, None, Some(err.to_string()))
                    }
                }
            }
        };

        let outcome = JobOutcome {
            id: Uuid::new_v4(),
            executed_at,
            status,
            result,
            error,
        };
        if let Err(err) = self.store.record_job_outcome(&outcome).await {
            warn!(error = %err, "could not record job outcome");
        }
        outcome
    }
}

pub struct SyncScheduler {
    job: Arc<ScheduledSync>,
    interval: Duration,
    scheduler: Option<JobScheduler>,
    initial_run: Option<JoinHandle<JobOutcome>>,
}

impl SyncScheduler {
    pub fn new(job: ScheduledSync, interval: Duration) -> Self {
        Self {
            job: Arc::new(job),
            interval,
            scheduler: None,
            initial_run: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_some()
    }

    /// Kick off one run right away, then repeat every `interval`.
    pub async fn start(&mut self) -> anyhow::Result<()> {
        anyhow::ensure!(self.scheduler.is_none(), "scheduler already running");
        self.job.manager.stop_signal().reset();

        let first = self.job.clone();
        self.initial_run = Some(tokio::spawn(async move { first.run_once().await }));

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let job = self.job.clone();
        let repeated = Job::new_repeated_async(self.interval, move |_uuid, _l| {
            let job = job.clone();
            Box::pin(async move {
                job.run_once().await;
            })
        })
        .with_context(|| format!("creating sync job every {:?}", self.interval))?;
        sched.add(repeated).await.context("adding sync job")?;
        sched.start().await.context("starting scheduler")?;

        info!(interval = ?self.interval, "sync scheduler started");
        self.scheduler = Some(sched);
        Ok(())
    }

    /// Signal the running sync to stop between category codes and shut the
    /// scheduler down, waiting at most [`SHUTDOWN_TIMEOUT`] for each.
    pub async fn stop(&mut self) {
        self.job.manager.stop_signal().stop();

        if let Some(mut sched) = self.scheduler.take() {
            match tokio::time::timeout(SHUTDOWN_TIMEOUT, sched.shutdown()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "scheduler shutdown failed"),
                Err(_) => warn!("scheduler shutdown timed out"),
            }
        }

        if let Some(handle) = self.initial_run.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, handle).await.is_err() {
                warn!("initial sync run did not finish before shutdown timeout");
            }
        }
        info!("sync scheduler stopped");
    }

    /// Run until Ctrl-C, then stop.
    pub async fn run_until_ctrl_c(&mut self) -> anyhow::Result<()> {
        self.start().await?;
        tokio::signal::ctrl_c()
            .await
            .context("waiting for ctrl-c")?;
        info!("shutdown requested");
        self.stop().await;
        Ok(())
    }
}
