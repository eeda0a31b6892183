use std::collections::HashMap;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use devpod::{Coordinator, LlmClient, PodConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("devpod=info")),
        )
        .with_target(false)
        .init();

    let requests: Vec<String> = std::env::args().skip(1).collect();
    if requests.is_empty() {
        eprintln!("usage: devpod <task> [<task>...]");
        std::process::exit(2);
    }

    let config = PodConfig::load()?;

    let probe = LlmClient::new(config.llm.clone())?;
    match probe.check_connection().await {
        Ok(()) => info!(model = probe.model(), "LLM connection verified"),
        Err(err) => warn!("LLM connection check failed: {}", err),
    }

    let coordinator = Coordinator::with_default_agents(config)?;
    coordinator.start().await;

    for request in &requests {
        coordinator.submit(request, "", HashMap::new()).await?;
    }

    tokio::select! {
        _ = drained(&coordinator) => info!("all tasks finished"),
        _ = tokio::signal::ctrl_c() => warn!("interrupted, shutting down"),
    }

    coordinator.shutdown().await;

    let report = coordinator.list_tasks().await;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Resolves once every submitted task, including spawned follow-ups, has
/// reached a terminal status.
async fn drained(coordinator: &Coordinator) {
    loop {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let status = coordinator.coordinator_status().await;
        if status.active_tasks == 0 && status.queue_depth == 0 {
            return;
        }
    }
}
