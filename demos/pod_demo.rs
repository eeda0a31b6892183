use std::collections::HashMap;
use std::time::Duration;

use devpod::{Coordinator, PodConfig, TaskStatus};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    println!("DevPod Demo");
    println!("===========\n");

    let config = PodConfig::load()?;
    let coordinator = Coordinator::with_default_agents(config)?;
    coordinator.start().await;

    let requests = vec![
        "Plan a todo list web app",
        "Build a REST API for notes",
        "Write tests for the login flow",
    ];

    let mut ids = Vec::new();
    for request in &requests {
        println!("📝 Submitting: {}", request);
        let id = coordinator.submit(request, "", HashMap::new()).await?;
        ids.push(id);
    }
    println!();

    // Watch the pod work until everything, follow-ups included, settles.
    loop {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let status = coordinator.coordinator_status().await;
        println!(
            "⏳ active: {} | completed: {} | queued: {}",
            status.active_tasks, status.completed_tasks, status.queue_depth
        );
        if status.active_tasks == 0 && status.queue_depth == 0 {
            break;
        }
    }

    coordinator.shutdown().await;

    println!("\n{}\n", "=".repeat(60));
    for id in ids {
        if let Some(task) = coordinator.get_status(id).await {
            let mark = if task.status == TaskStatus::Completed {
                "✅"
            } else {
                "❌"
            };
            println!("{} {} [{}]", mark, task.title, task.status);
            if let Some(error) = task.metadata.get("error") {
                println!("   error: {}", error);
            }
        }
    }

    let report = coordinator.list_tasks().await;
    println!(
        "\nFinished tasks, follow-ups included: {}",
        report.completed.len()
    );

    Ok(())
}
