mod doctor;
mod run;

use anyhow::Result;
use console::style;
use std::path::PathBuf;

use crate::terminal::{self, GuideSection};

fn print_help() {
    GuideSection::new("Core")
        .command("run", "Start the assistant runtime")
        .command("gateway", "Run the host command gateway")
        .print();

    GuideSection::new("Diagnostics")
        .command("doctor", "Check config, gateway, and bridge CLI")
        .command("help", "Show this help")
        .print();

    println!(
        "\n {} {} <command> [--config <path>]\n",
        style("Usage:").bold(),
        style("cianaparrot").green()
    );
}

/// Resolve the config path: `--config` flag, then `CIANAPARROT_CONFIG`,
/// then `./config.yaml`.
fn config_path(args: &[String]) -> PathBuf {
    if let Some(pos) = args.iter().position(|a| a == "--config")
        && let Some(path) = args.get(pos + 1)
    {
        return PathBuf::from(path);
    }
    if let Ok(path) = std::env::var("CIANAPARROT_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from("config.yaml")
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    match args.get(1).map(String::as_str) {
        Some("run") => run::run(&config_path(&args)).await,
        Some("gateway") => run::gateway(&config_path(&args)).await,
        Some("doctor") => doctor::doctor(&config_path(&args)).await,
        Some("help") | Some("--help") | Some("-h") | None => {
            print_help();
            Ok(())
        }
        Some(other) => {
            terminal::print_error(&format!("Unknown command: {}", other));
            print_help();
            Ok(())
        }
    }
}
