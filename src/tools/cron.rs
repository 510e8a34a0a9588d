use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use crate::agent::ChatContext;
use crate::scheduler::{parse_cron, parse_timestamp};
use crate::store::{ScheduledTask, TaskKind, TaskStore, generate_task_id};

const PROMPT_PREVIEW_LEN: usize = 60;

fn preview(prompt: &str) -> &str {
    &prompt[..prompt
        .char_indices()
        .nth(PROMPT_PREVIEW_LEN)
        .map(|(i, _)| i)
        .unwrap_or(prompt.len())]
}

/// Schedule-management tools. Every method returns agent-facing text:
/// validation problems come back as messages the agent can relay, and only
/// store failures propagate as errors.
pub struct ScheduleTools {
    store: Arc<TaskStore>,
}

impl ScheduleTools {
    pub fn new(store: Arc<TaskStore>) -> Self {
        Self { store }
    }

    /// Create a task bound to the originating chat. The chat context comes
    /// from the agent invocation that triggered this tool call.
    pub async fn schedule_task(
        &self,
        ctx: &ChatContext,
        prompt: &str,
        schedule_type: &str,
        schedule_value: &str,
    ) -> Result<String> {
        let kind = match schedule_type {
            "cron" => TaskKind::Cron,
            "interval" => TaskKind::Interval,
            "once" => TaskKind::Once,
            other => {
                return Ok(format!(
                    "Invalid schedule_type: {}. Use 'cron', 'interval', or 'once'.",
                    other
                ));
            }
        };

        match kind {
            TaskKind::Cron => {
                if let Err(e) = parse_cron(schedule_value) {
                    return Ok(format!(
                        "Invalid cron expression '{}': {}",
                        schedule_value, e
                    ));
                }
            }
            TaskKind::Interval => match schedule_value.parse::<i64>() {
                Ok(secs) if secs > 0 => {}
                Ok(_) => {
                    return Ok(format!(
                        "Invalid interval: must be a positive number of seconds, got '{}'.",
                        schedule_value
                    ));
                }
                Err(_) => {
                    return Ok(format!(
                        "Invalid interval: '{}' is not a valid integer.",
                        schedule_value
                    ));
                }
            },
            TaskKind::Once => {
                if parse_timestamp(schedule_value).is_none() {
                    return Ok(format!(
                        "Invalid ISO timestamp: '{}'. Use format like '2025-01-15T10:00:00'.",
                        schedule_value
                    ));
                }
            }
        }

        let guard = self.store.lock().await;
        let mut tasks = guard.load()?;
        let task = ScheduledTask {
            id: generate_task_id(&tasks),
            prompt: prompt.to_string(),
            kind,
            value: schedule_value.to_string(),
            channel: ctx.channel.clone(),
            chat_id: ctx.chat_id.clone(),
            created_at: Utc::now(),
            last_run: None,
            active: true,
            model_tier: None,
        };
        let confirmation = format!(
            "Task scheduled: id={}, type={}, value={}",
            task.id, task.kind, task.value
        );
        info!(
            "Scheduled task {}: {} ({}: {}) -> {}/{}",
            task.id,
            preview(prompt),
            task.kind,
            task.value,
            ctx.channel,
            ctx.chat_id
        );
        tasks.push(task);
        guard.replace(&tasks)?;
        Ok(confirmation)
    }

    /// Formatted summary of all active tasks.
    pub async fn list_tasks(&self) -> Result<String> {
        let guard = self.store.lock().await;
        let tasks = guard.load()?;
        drop(guard);

        let mut lines = Vec::new();
        for t in tasks.iter().filter(|t| t.active) {
            let last_run = t
                .last_run
                .map(|ts| ts.to_rfc3339())
                .unwrap_or_else(|| "never".to_string());
            lines.push(format!(
                "- [{}] {}={} | {} | last_run={}",
                t.id,
                t.kind,
                t.value,
                preview(&t.prompt),
                last_run
            ));
        }
        if lines.is_empty() {
            return Ok("No active scheduled tasks.".to_string());
        }
        Ok(lines.join("\n"))
    }

    /// Cancel by id: a flag flip, never a deletion.
    pub async fn cancel_task(&self, task_id: &str) -> Result<String> {
        let guard = self.store.lock().await;
        let mut tasks = guard.load()?;
        match tasks.iter_mut().find(|t| t.id == task_id) {
            Some(task) => {
                task.active = false;
                guard.replace(&tasks)?;
                info!("Cancelled task {}", task_id);
                Ok(format!("Task {} cancelled.", task_id))
            }
            None => Ok(format!("Task {} not found.", task_id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ChatContext {
        ChatContext {
            channel: "telegram".to_string(),
            chat_id: "42".to_string(),
        }
    }

    async fn tools(dir: &std::path::Path) -> (ScheduleTools, Arc<TaskStore>) {
        let store = Arc::new(TaskStore::new(dir.join("tasks.json")));
        (ScheduleTools::new(store.clone()), store)
    }

    #[tokio::test]
    async fn schedule_binds_task_to_originating_chat() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, store) = tools(dir.path()).await;
        let reply = tools
            .schedule_task(&ctx(), "water the plants", "interval", "86400")
            .await
            .unwrap();
        assert!(reply.starts_with("Task scheduled: id="));

        let tasks = store.lock().await.load().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].channel, "telegram");
        assert_eq!(tasks[0].chat_id, "42");
        assert_eq!(tasks[0].kind, TaskKind::Interval);
        assert!(tasks[0].active);
        assert!(tasks[0].last_run.is_none());
    }

    #[tokio::test]
    async fn identical_requests_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, store) = tools(dir.path()).await;
        for _ in 0..2 {
            tools
                .schedule_task(&ctx(), "same prompt", "once", "2030-01-01T00:00:00Z")
                .await
                .unwrap();
        }
        let tasks = store.lock().await.load().unwrap();
        assert_eq!(tasks.len(), 2);
        assert_ne!(tasks[0].id, tasks[1].id);
    }

    #[tokio::test]
    async fn invalid_values_return_messages_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, store) = tools(dir.path()).await;
        let cases = [
            ("sometimes", "whenever"),
            ("cron", "not a cron"),
            ("interval", "-10"),
            ("interval", "soon"),
            ("once", "tomorrow"),
        ];
        for (schedule_type, value) in cases {
            let reply = tools
                .schedule_task(&ctx(), "p", schedule_type, value)
                .await
                .unwrap();
            assert!(reply.starts_with("Invalid"), "got: {}", reply);
        }
        assert!(store.lock().await.load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_flips_active_and_list_hides_it() {
        let dir = tempfile::tempdir().unwrap();
        let (tools, store) = tools(dir.path()).await;
        tools
            .schedule_task(&ctx(), "daily report", "cron", "0 9 * * *")
            .await
            .unwrap();
        let id = store.lock().await.load().unwrap()[0].id.clone();

        let listing = tools.list_tasks().await.unwrap();
        assert!(listing.contains(&id));

        let reply = tools.cancel_task(&id).await.unwrap();
        assert_eq!(reply, format!("Task {} cancelled.", id));
        assert_eq!(
            tools.list_tasks().await.unwrap(),
            "No active scheduled tasks."
        );

        // The record survives as an audit entry.
        let tasks = store.lock().await.load().unwrap();
        assert_eq!(tasks.len(), 1);
        assert!(!tasks[0].active);

        assert_eq!(
            tools.cancel_task("zzzzzzzz").await.unwrap(),
            "Task zzzzzzzz not found."
        );
    }
}
