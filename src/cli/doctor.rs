use anyhow::Result;
use std::path::Path;

use crate::bridge::BridgeSessionManager;
use crate::config::AppConfig;
use crate::gateway::GatewayClient;
use crate::terminal::{print_error, print_step, print_success, print_warn};

/// Check the pieces the runtime depends on and report what is usable.
pub async fn doctor(config_path: &Path) -> Result<()> {
    print_step("Checking CianaParrot setup...");
    println!();

    let config = match AppConfig::load(config_path) {
        Ok(config) => {
            print_success(&format!("Config loads: {}", config_path.display()));
            config
        }
        Err(e) => {
            print_error(&format!("Config failed to load: {:#}", e));
            return Ok(());
        }
    };

    match std::fs::create_dir_all(&config.agent.data_dir)
        .and_then(|_| std::fs::write(config.agent.data_dir.join(".probe"), b"ok"))
    {
        Ok(()) => {
            let _ = std::fs::remove_file(config.agent.data_dir.join(".probe"));
            print_success(&format!(
                "Data dir is writable: {}",
                config.agent.data_dir.display()
            ));
        }
        Err(e) => print_error(&format!("Data dir is not writable: {}", e)),
    }

    if config.agent.url.is_some() {
        print_success("Agent runtime configured");
    } else {
        print_warn("agent.url is not set — 'run' will refuse to start");
    }

    if config.channels.telegram.enabled {
        print_success("Telegram channel enabled");
    } else {
        print_warn("Telegram channel disabled");
    }

    match &config.gateway.url {
        Some(url) => {
            let client = GatewayClient::new(url, config.gateway.token.clone());
            let (ok, body) = client.health().await;
            if ok {
                let bridges = body
                    .get("bridges")
                    .and_then(|b| b.as_array())
                    .map(|b| b.len())
                    .unwrap_or(0);
                print_success(&format!("Gateway reachable ({} bridges)", bridges));
            } else {
                print_warn(&format!(
                    "Gateway unreachable: {}",
                    body.get("error").and_then(|e| e.as_str()).unwrap_or("?")
                ));
            }
        }
        None => print_warn("Gateway client not configured (host_execute disabled)"),
    }

    if config.bridge_cli.enabled {
        let gateway_client = config
            .gateway
            .url
            .as_ref()
            .map(|url| GatewayClient::new(url, config.gateway.token.clone()));
        match BridgeSessionManager::new(
            &config.bridge_cli,
            gateway_client,
            config.gateway.strip_env.clone(),
        ) {
            Ok(manager) => {
                let (ok, detail) = manager.check_available().await;
                if ok {
                    print_success(&format!("Bridge CLI available: {}", detail));
                } else {
                    print_warn(&format!("Bridge CLI check failed: {}", detail));
                }
            }
            Err(e) => print_warn(&format!("Bridge manager failed to initialize: {:#}", e)),
        }
    }

    Ok(())
}
