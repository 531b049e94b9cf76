// src/queue/worker.rs

//! Worker pool
//!
//! Claims due tasks from the broker and runs up to `concurrency` of them at
//! once. Each running task gets a monitor that heartbeats it and polls the
//! broker for revocation every second; a revoked task has its
//! `CancellationToken` triggered, which terminates any subprocess it runs.
//! A scheduler loop next to the claim loop queues the periodic tasks.

use super::broker::{Task, TaskKind};
use super::{enqueue_singleton, tasks};
use crate::config::WorkerSection;
use crate::context::AppContext;
use crate::db::models::WorkerRecord;
use crate::error::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How often a running task checks whether it was revoked
const REVOCATION_POLL: Duration = Duration::from_secs(1);

/// Intervals the pool runs on, parsed once from `[worker]`
#[derive(Debug, Clone)]
pub struct WorkerTiming {
    pub poll: Duration,
    pub heartbeat: Duration,
    pub stale_after: Duration,
    pub watch_paths: Duration,
    pub update_channels: Duration,
    pub watchdog: Duration,
    pub task_retention: Duration,
}

impl WorkerTiming {
    pub fn from_config(section: &WorkerSection) -> Result<Self> {
        let parse = |r: anyhow::Result<Duration>| r.map_err(|e| Error::Config(e.to_string()));
        Ok(Self {
            poll: parse(section.poll_interval())?,
            heartbeat: parse(section.heartbeat_interval())?,
            stale_after: parse(section.stale_after())?,
            watch_paths: parse(section.watch_paths_interval())?,
            update_channels: parse(section.update_channels_interval())?,
            watchdog: parse(section.watchdog_interval())?,
            task_retention: parse(section.task_retention())?,
        })
    }
}

pub struct WorkerPool {
    ctx: Arc<AppContext>,
    id: String,
    concurrency: usize,
    timing: WorkerTiming,
}

impl WorkerPool {
    pub fn new(ctx: Arc<AppContext>) -> Result<Self> {
        let timing = WorkerTiming::from_config(&ctx.config.worker)?;
        let concurrency = ctx.config.worker.concurrency.max(1);
        let id = format!("worker-{}-{}", std::process::id(), uuid::Uuid::new_v4().simple());
        Ok(Self {
            ctx,
            id,
            concurrency,
            timing,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Announce the worker and settle builds a crashed worker left behind
    pub async fn startup(&self) -> Result<()> {
        let id = self.id.clone();
        self.ctx.db(move |conn| WorkerRecord::register(conn, &id)).await?;
        tasks::watchdog(&self.ctx, self.timing.stale_after, None).await?;
        info!("Worker {} ready with {} slot(s)", self.id, self.concurrency);
        Ok(())
    }

    /// Run until `shutdown` fires, then wait for running tasks
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        self.startup().await?;

        let scheduler = tokio::spawn(schedule_periodic(
            self.ctx.clone(),
            self.timing.clone(),
            shutdown.clone(),
        ));

        let slots = Arc::new(Semaphore::new(self.concurrency));
        let mut running = JoinSet::new();
        loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let claimed = match self.claim().await {
                Ok(task) => task,
                Err(e) => {
                    error!("Failed to claim a task: {}", e);
                    None
                }
            };
            let Some(task) = claimed else {
                drop(permit);
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.timing.poll) => {}
                }
                continue;
            };

            let ctx = self.ctx.clone();
            let heartbeat = self.timing.heartbeat;
            running.spawn(async move {
                execute(ctx, task, heartbeat).await;
                drop(permit);
            });
            while running.try_join_next().is_some() {}
        }

        info!("Worker {} shutting down, waiting for {} task(s)", self.id, running.len());
        while running.join_next().await.is_some() {}
        scheduler.abort();

        let id = self.id.clone();
        self.ctx.db(move |conn| WorkerRecord::unregister(conn, &id)).await?;
        Ok(())
    }

    /// Run due tasks one after another until none is left
    ///
    /// Returns the number of tasks executed.
    pub async fn drain(&self) -> Result<usize> {
        let mut executed = 0;
        while let Some(task) = self.claim().await? {
            execute(self.ctx.clone(), task, self.timing.heartbeat).await;
            executed += 1;
        }
        Ok(executed)
    }

    async fn claim(&self) -> Result<Option<Task>> {
        let id = self.id.clone();
        self.ctx.db(move |conn| Task::claim(conn, &id)).await
    }
}

/// Run one claimed task under its monitor and record the outcome
async fn execute(ctx: Arc<AppContext>, task: Task, heartbeat: Duration) {
    let cancel = CancellationToken::new();
    let done = CancellationToken::new();
    let monitor = tokio::spawn(monitor(
        ctx.clone(),
        task.id.clone(),
        cancel.clone(),
        done.clone(),
        heartbeat,
    ));

    info!("Running task {} ({})", task.id, task.kind);
    let result = tasks::dispatch(&ctx, &task, cancel).await;
    done.cancel();
    let _ = monitor.await;

    let error = match &result {
        Ok(()) => {
            debug!("Task {} succeeded", task.id);
            None
        }
        Err(Error::Cancelled) => {
            info!("Task {} was cancelled", task.id);
            Some("task cancelled".to_string())
        }
        Err(e) => {
            warn!("Task {} failed: {}", task.id, e);
            Some(e.to_string())
        }
    };
    let id = task.id.clone();
    if let Err(e) = ctx.db(move |conn| Task::finish(conn, &id, error.as_deref())).await {
        error!("Failed to record outcome of task {}: {}", task.id, e);
    }
}

/// Heartbeat the task and cancel it once the broker reports it revoked
async fn monitor(
    ctx: Arc<AppContext>,
    task_id: String,
    cancel: CancellationToken,
    done: CancellationToken,
    heartbeat: Duration,
) {
    let mut poll = tokio::time::interval(REVOCATION_POLL);
    let mut beat = tokio::time::interval(heartbeat);
    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = beat.tick() => {
                let id = task_id.clone();
                if let Err(e) = ctx.db(move |conn| Task::heartbeat(conn, &id)).await {
                    warn!("Heartbeat for task {} failed: {}", task_id, e);
                }
            }
            _ = poll.tick() => {
                if cancel.is_cancelled() {
                    continue;
                }
                let id = task_id.clone();
                match ctx.db(move |conn| Task::is_revoked(conn, &id)).await {
                    Ok(true) => {
                        info!("Task {} revoked, cancelling", task_id);
                        cancel.cancel();
                    }
                    Ok(false) => {}
                    Err(e) => warn!("Revocation check for task {} failed: {}", task_id, e),
                }
            }
        }
    }
}

/// Queue the periodic tasks on their intervals
async fn schedule_periodic(ctx: Arc<AppContext>, timing: WorkerTiming, shutdown: CancellationToken) {
    let mut watch = tokio::time::interval(timing.watch_paths);
    let mut channels = tokio::time::interval(timing.update_channels);
    let mut watchdog = tokio::time::interval(timing.watchdog);
    let watching = !ctx.config.worker.watch_paths.is_empty();

    loop {
        let kind = tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = watch.tick() => {
                if !watching {
                    continue;
                }
                TaskKind::WatchPaths
            }
            _ = channels.tick() => TaskKind::UpdateChannels,
            _ = watchdog.tick() => TaskKind::Watchdog,
        };
        match ctx.db(move |conn| enqueue_singleton(conn, kind)).await {
            Ok(true) => debug!("Scheduled {}", kind),
            Ok(false) => debug!("{} already queued", kind),
            Err(e) => warn!("Failed to schedule {}: {}", kind, e),
        }
    }
}
