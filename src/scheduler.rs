use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{error, info, warn};

use crate::agent::{Agent, AgentRequest, MessageContent};
use crate::channels::{Channel, SendOptions};
use crate::store::{ScheduledTask, TaskKind, TaskStore};

/// The `cron` crate wants a seconds field; plain 5-field expressions get
/// seconds pinned to zero.
pub fn normalize_cron_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr.trim())
    } else {
        expr.trim().to_string()
    }
}

pub fn parse_cron(expr: &str) -> Result<cron::Schedule> {
    cron::Schedule::from_str(&normalize_cron_expr(expr))
        .with_context(|| format!("invalid cron expression '{}'", expr))
}

pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    // Naive timestamps are taken as UTC.
    chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Whether a task's next firing condition has been reached. Invalid schedule
/// values are logged and treated as not due.
fn is_due(task: &ScheduledTask, now: DateTime<Utc>) -> bool {
    match task.kind {
        TaskKind::Once => {
            if task.last_run.is_some() {
                return false;
            }
            match parse_timestamp(&task.value) {
                Some(target) => now >= target,
                None => {
                    warn!("Invalid once timestamp: {}", task.value);
                    false
                }
            }
        }
        TaskKind::Interval => {
            let interval = match task.value.parse::<i64>() {
                Ok(secs) if secs > 0 => secs,
                _ => {
                    warn!("Invalid interval: {}", task.value);
                    return false;
                }
            };
            match task.last_run {
                None => true,
                Some(last) => (now - last).num_seconds() >= interval,
            }
        }
        TaskKind::Cron => {
            let schedule = match parse_cron(&task.value) {
                Ok(schedule) => schedule,
                Err(_) => {
                    warn!("Invalid cron expression: {}", task.value);
                    return false;
                }
            };
            let after = task.last_run.map_or(task.created_at, |last| last.max(task.created_at));
            match schedule.after(&after).next() {
                Some(next) => next <= now,
                None => false,
            }
        }
    }
}

struct SchedulerInner {
    agent: Arc<dyn Agent>,
    store: Arc<TaskStore>,
    channels: HashMap<String, Arc<dyn Channel>>,
    poll_interval: Duration,
}

/// Polls the task store and executes due tasks. Due-marking (`last_run`
/// update, one-shot deactivation) happens under the store lock; the task
/// bodies run concurrently outside it so a slow agent call never blocks the
/// next cycle's due check.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        agent: Arc<dyn Agent>,
        store: Arc<TaskStore>,
        channels: HashMap<String, Arc<dyn Channel>>,
        poll_interval_secs: u64,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                agent,
                store,
                channels,
                poll_interval: Duration::from_secs(poll_interval_secs.max(1)),
            }),
            shutdown,
            handle: Mutex::new(None),
        }
    }

    pub async fn start(&self) {
        let inner = self.inner.clone();
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            let mut inflight = JoinSet::new();
            loop {
                if let Err(e) = check_cycle(&inner, &mut inflight).await {
                    error!("Scheduler failed to read tasks file: {:#}", e);
                }
                // Reap finished executions without blocking the loop.
                while inflight.try_join_next().is_some() {}

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(inner.poll_interval) => {}
                }
            }
            // Graceful stop: in-flight task executions run to completion.
            while inflight.join_next().await.is_some() {}
        });
        *self.handle.lock().await = Some(handle);
        info!(
            "Scheduler started (poll every {}s)",
            self.inner.poll_interval.as_secs()
        );
    }

    /// Request termination, then wait for the loop and every in-flight task
    /// execution to finish. Executions are not interrupted.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }

    /// One due-check plus fan-out, awaited to completion. Test seam; the
    /// background loop uses the same cycle.
    #[cfg(test)]
    pub async fn run_cycle_blocking(&self) -> Result<()> {
        let mut inflight = JoinSet::new();
        check_cycle(&self.inner, &mut inflight).await?;
        while inflight.join_next().await.is_some() {}
        Ok(())
    }
}

/// Under the store lock: load, mark due tasks (advance `last_run`,
/// deactivate one-shots), persist. Execution starts after the lock drops.
async fn check_cycle(inner: &Arc<SchedulerInner>, inflight: &mut JoinSet<()>) -> Result<()> {
    let now = Utc::now();
    let due: Vec<ScheduledTask> = {
        let guard = inner.store.lock().await;
        let mut tasks = guard.load()?;
        let mut due = Vec::new();
        for task in tasks.iter_mut() {
            if !task.active {
                continue;
            }
            if is_due(task, now) {
                task.last_run = Some(now);
                if task.kind == TaskKind::Once {
                    task.active = false;
                }
                due.push(task.clone());
            }
        }
        if !due.is_empty() {
            guard.replace(&tasks)?;
        }
        due
    };

    for task in due {
        info!("Running scheduled task: {}", task.id);
        let inner = inner.clone();
        inflight.spawn(async move { execute_task(inner, task).await });
    }
    Ok(())
}

/// Invoke the agent with the task prompt under a `scheduler_<id>` thread and
/// push the final text back to the originating chat as a quiet send. The
/// task is already consumed for this firing; failures here only log.
async fn execute_task(inner: Arc<SchedulerInner>, task: ScheduledTask) {
    let request = AgentRequest {
        thread_id: format!("scheduler_{}", task.id),
        content: MessageContent::Text(task.prompt.clone()),
        origin: None,
        model_tier: task.model_tier.clone(),
    };

    let reply = match inner.agent.invoke(request).await {
        Ok(reply) => reply,
        Err(e) => {
            error!("Failed to execute task {}: {:#}", task.id, e);
            return;
        }
    };

    let text = reply.final_text();
    match inner.channels.get(&task.channel) {
        Some(channel) => {
            let options = SendOptions {
                disable_notification: true,
                ..SendOptions::default()
            };
            match channel.send(&task.chat_id, text, options).await {
                Ok(_) => info!("Scheduler sent result to {}/{}", task.channel, task.chat_id),
                Err(e) => warn!("Failed to deliver task {} result: {:#}", task.id, e),
            }
        }
        None => warn!(
            "Task {} has no valid channel/chat_id, result discarded",
            task.id
        ),
    }
}
