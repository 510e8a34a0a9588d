use anyhow::{Context, Result, anyhow};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::agent::{Agent, RemoteAgent};
use crate::bridge::BridgeSessionManager;
use crate::channels::{Channel, telegram::TelegramChannel};
use crate::config::AppConfig;
use crate::dispatch::Dispatcher;
use crate::gateway::{GatewayClient, GatewayServer};
use crate::logging;
use crate::router::{DirThreadIndex, MessageRouter};
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use crate::terminal;
use crate::toolapi::ToolApi;
use crate::tools::build_toolbox;
use crate::transcription::Transcriber;

/// Boot the full runtime: router, channels, scheduler, bridge manager, and
/// the tool-callback API. Blocks until Ctrl-C, then drains in-flight work.
pub async fn run(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    logging::init(&config.logging)?;
    std::fs::create_dir_all(&config.agent.data_dir)
        .with_context(|| format!("creating data dir {}", config.agent.data_dir.display()))?;

    let agent_url = config
        .agent
        .url
        .clone()
        .ok_or_else(|| anyhow!("agent.url must be configured to run the assistant"))?;
    let agent: Arc<dyn Agent> = Arc::new(RemoteAgent::new(
        &agent_url,
        config.agent.token.clone(),
        config.agent.timeout,
    )?);

    let router = Arc::new(MessageRouter::new(agent.clone(), &config).await?);
    router
        .sync_counters(&DirThreadIndex::new(
            config.agent.data_dir.join("checkpoints"),
        ))
        .await?;

    let bridge = if config.bridge_cli.enabled {
        let gateway_client = config
            .gateway
            .url
            .as_ref()
            .map(|url| GatewayClient::new(url, config.gateway.token.clone()));
        let manager = BridgeSessionManager::new(
            &config.bridge_cli,
            gateway_client,
            config.gateway.strip_env.clone(),
        )?;
        manager.restore().await?;
        Some(Arc::new(manager))
    } else {
        None
    };

    let task_store = Arc::new(TaskStore::new(&config.scheduler.data_file));
    let toolbox = Arc::new(build_toolbox(&config, task_store.clone()));
    let tool_api = ToolApi::new(
        toolbox,
        config.agent.token.clone(),
        config.agent.tools_port,
    );
    let tool_api_handle = tool_api.spawn().await?;

    let dispatcher = Arc::new(Dispatcher::new(router.clone(), bridge.clone()));

    let transcriber = if config.transcription.enabled {
        Some(Arc::new(Transcriber::from_config(&config.transcription)?))
    } else {
        None
    };

    let mut channels: HashMap<String, Arc<dyn Channel>> = HashMap::new();
    if config.channels.telegram.enabled {
        let telegram = Arc::new(TelegramChannel::new(
            &config.channels.telegram.token,
            dispatcher.clone(),
            transcriber.clone(),
        ));
        telegram.start().await?;
        channels.insert(telegram.name().to_string(), telegram);
    }
    if channels.is_empty() {
        warn!("No channels enabled — the assistant has no way to receive messages");
    }

    let scheduler = if config.scheduler.enabled {
        let scheduler = Scheduler::new(
            agent.clone(),
            task_store.clone(),
            channels.clone(),
            config.scheduler.poll_interval,
        );
        scheduler.start().await;
        Some(scheduler)
    } else {
        None
    };

    terminal::print_step("CianaParrot is running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("Shutting down...");

    if let Some(scheduler) = &scheduler {
        scheduler.stop().await;
    }
    for channel in channels.values() {
        if let Err(e) = channel.stop().await {
            warn!("Channel shutdown error: {:#}", e);
        }
    }
    tool_api_handle.abort();
    Ok(())
}

/// Run the host gateway server standalone (usually on the host machine,
/// while the assistant runs in a container).
pub async fn gateway(config_path: &Path) -> Result<()> {
    let config = AppConfig::load(config_path)?;
    logging::init(&config.logging)?;
    GatewayServer::from_config(&config.gateway)?.serve().await
}
