pub mod cron;
pub mod host;

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::AppConfig;
use crate::gateway::GatewayClient;
use crate::store::TaskStore;

pub use cron::ScheduleTools;
pub use host::HostTools;

/// Tools handed to the agent runtime, with their dependencies already bound.
/// Nothing here reaches for ambient state: the task store, gateway client,
/// and timeout defaults all arrive through this factory.
pub struct Toolbox {
    pub schedule: ScheduleTools,
    pub host: Option<HostTools>,
}

pub fn build_toolbox(config: &AppConfig, store: Arc<TaskStore>) -> Toolbox {
    let host = config.gateway.url.as_ref().map(|url| {
        let client = GatewayClient::new(url, config.gateway.token.clone());
        let bridges: HashMap<String, Vec<String>> = config
            .gateway
            .bridges
            .iter()
            .map(|(name, b)| (name.clone(), b.allowed_commands.clone()))
            .collect();
        HostTools::new(client, bridges, config.gateway.default_timeout)
    });
    Toolbox {
        schedule: ScheduleTools::new(store),
        host,
    }
}
