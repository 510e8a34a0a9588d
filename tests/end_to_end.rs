//! Cross-component flow: router → agent (stub) → schedule tool → task store
//! → scheduler → channel (stub), all in-process against a temp data dir.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use cianaparrot::agent::{Agent, AgentReply, AgentRequest, MessageContent};
use cianaparrot::channels::{Channel, IncomingMessage, SendOptions, SendResult};
use cianaparrot::config::AppConfig;
use cianaparrot::events::Event;
use cianaparrot::router::MessageRouter;
use cianaparrot::scheduler::Scheduler;
use cianaparrot::store::TaskStore;
use cianaparrot::tools::ScheduleTools;

fn text_reply(content: &str) -> AgentReply {
    AgentReply {
        events: vec![Event::Text {
            content: content.to_string(),
        }],
    }
}

/// Stub agent that behaves like the real one at the tool seam: chat-driven
/// invocations call the schedule tool with their origin context, scheduler
/// invocations just produce a result text.
struct SchedulingAgent {
    schedule: ScheduleTools,
    threads: Mutex<Vec<String>>,
}

impl SchedulingAgent {
    fn new(store: Arc<TaskStore>) -> Arc<Self> {
        Arc::new(Self {
            schedule: ScheduleTools::new(store),
            threads: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Agent for SchedulingAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<AgentReply> {
        self.threads.lock().await.push(request.thread_id.clone());

        if request.thread_id.starts_with("scheduler_") {
            return Ok(text_reply("Reminder: water the plants"));
        }

        let MessageContent::Text(text) = &request.content else {
            return Ok(text_reply("ack"));
        };
        if text.contains("remind me") {
            let origin = request
                .origin
                .as_ref()
                .expect("chat-driven invocations carry their origin");
            let confirmation = self
                .schedule
                .schedule_task(origin, "water the plants", "once", "2020-01-01T00:00:00Z")
                .await?;
            return Ok(text_reply(&confirmation));
        }
        Ok(text_reply("ack"))
    }
}

struct RecordingChannel {
    sends: Mutex<Vec<(String, String, bool)>>,
}

impl RecordingChannel {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sends: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "telegram"
    }
    async fn start(&self) -> Result<()> {
        Ok(())
    }
    async fn stop(&self) -> Result<()> {
        Ok(())
    }
    async fn send(
        &self,
        chat_id: &str,
        text: &str,
        options: SendOptions,
    ) -> Result<Option<SendResult>> {
        self.sends.lock().await.push((
            chat_id.to_string(),
            text.to_string(),
            options.disable_notification,
        ));
        Ok(None)
    }
    async fn send_file(&self, _chat_id: &str, _path: &Path, _caption: &str) -> Result<()> {
        Ok(())
    }
}

fn config_in(dir: &Path) -> AppConfig {
    let mut config = AppConfig::default();
    config.agent.data_dir = dir.to_path_buf();
    config.scheduler.data_file = dir.join("scheduled_tasks.json");
    config
}

fn dm(text: &str) -> IncomingMessage {
    IncomingMessage {
        channel: "telegram".to_string(),
        chat_id: "42".to_string(),
        user_id: "7".to_string(),
        user_name: "Ada".to_string(),
        text: text.to_string(),
        is_private: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn chat_schedules_a_task_and_the_scheduler_delivers_it() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let store = Arc::new(TaskStore::new(&config.scheduler.data_file));
    let agent = SchedulingAgent::new(store.clone());
    let channel = RecordingChannel::new();

    // 1. A chat message makes the agent schedule a one-shot bound to the
    //    originating chat via the context the router propagated.
    let router = MessageRouter::new(agent.clone(), &config).await.unwrap();
    let reply = router
        .handle_message(dm("please remind me to water the plants"))
        .await
        .unwrap();
    assert!(reply.final_text().starts_with("Task scheduled: id="));

    let task = {
        let tasks = store.lock().await.load().unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].channel, "telegram");
        assert_eq!(tasks[0].chat_id, "42");
        assert!(tasks[0].active);
        assert!(tasks[0].last_run.is_none());
        tasks[0].clone()
    };

    // 2. The scheduler picks the (past-dated) one-shot up on its first
    //    cycle and fans the result back to the origin chat, quietly.
    let mut channels: HashMap<String, Arc<dyn Channel>> = HashMap::new();
    channels.insert("telegram".to_string(), channel.clone());
    let scheduler = Scheduler::new(agent.clone(), store.clone(), channels, 1);
    scheduler.start().await;

    let mut delivered = false;
    for _ in 0..100 {
        if !channel.sends.lock().await.is_empty() {
            delivered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    scheduler.stop().await;
    assert!(delivered, "scheduler never delivered the task result");

    let sends = channel.sends.lock().await;
    assert_eq!(sends.len(), 1, "one-shot must fire exactly once");
    assert_eq!(sends[0].0, "42");
    assert_eq!(sends[0].1, "Reminder: water the plants");
    assert!(sends[0].2, "scheduler sends must not notify");

    // 3. The store shows the firing: consumed, deactivated, audit kept.
    let tasks = store.lock().await.load().unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(!tasks[0].active);
    assert!(tasks[0].last_run.is_some());

    // 4. Thread identities: the chat turn and the task execution ran under
    //    distinct conversational identities.
    let threads = agent.threads.lock().await;
    assert_eq!(threads[0], "telegram_42");
    assert!(threads.contains(&format!("scheduler_{}", task.id)));
}

#[tokio::test]
async fn session_reset_rethreads_and_both_turns_are_logged() {
    let dir = tempfile::tempdir().unwrap();
    let config = config_in(dir.path());
    let store = Arc::new(TaskStore::new(&config.scheduler.data_file));
    let agent = SchedulingAgent::new(store);
    let router = MessageRouter::new(agent.clone(), &config).await.unwrap();

    assert!(router.handle_message(dm("hello")).await.is_some());

    let mut reset = dm("/new");
    reset.reset_session = true;
    assert!(router.handle_message(reset).await.is_none());

    assert!(router.handle_message(dm("hello again")).await.is_some());

    {
        let threads = agent.threads.lock().await;
        assert_eq!(threads.as_slice(), &["telegram_42", "telegram_42_s1"]);
    }

    // Each thread got its own append-only turn log with both roles.
    for thread in ["telegram_42", "telegram_42_s1"] {
        let raw = std::fs::read_to_string(
            dir.path().join("sessions").join(format!("{}.jsonl", thread)),
        )
        .unwrap();
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["role"], "user");
        assert_eq!(lines[1]["role"], "assistant");
    }

    // The counter survives a router restart against the same data dir.
    let agent2 = SchedulingAgent::new(Arc::new(TaskStore::new(
        dir.path().join("scheduled_tasks.json"),
    )));
    let router2 = MessageRouter::new(agent2.clone(), &config).await.unwrap();
    assert!(router2.handle_message(dm("still here")).await.is_some());
    assert_eq!(
        agent2.threads.lock().await.as_slice(),
        &["telegram_42_s1"]
    );
}
