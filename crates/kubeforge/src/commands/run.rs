use colored::Colorize;
use kubeforge_cloud::{Engine, NodeObserver, TaskStatus, WorkerPool, handlers};
use kubeforge_config::KubeforgeConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::setup;

/// Block until no task is queued or running; failed tasks stay behind
async fn wait_until_drained(engine: &Engine, interval: Duration) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => return Ok(result?),
            _ = tokio::time::sleep(interval) => {}
        }
        let pending = engine
            .tasks()
            .list()
            .await?
            .into_iter()
            .filter(|t| t.status != TaskStatus::Failed)
            .count();
        if pending == 0 {
            return Ok(());
        }
        tracing::debug!("{} tasks still pending", pending);
    }
}

pub async fn handle(engine: Engine, config: &KubeforgeConfig, drain: bool) -> anyhow::Result<()> {
    setup::ensure_default_account(&engine, config).await?;

    let registry = Arc::new(handlers::registry(&engine));

    let cancel = CancellationToken::new();
    let pool = WorkerPool::spawn(
        config.workers.count,
        engine.tasks().clone(),
        registry,
        config.workers.poll_interval(),
        cancel.clone(),
    );

    let observer = (config.observer.enabled && !drain).then(|| {
        tokio::spawn(
            NodeObserver::new(engine.clone()).run(config.observer.interval(), cancel.child_token()),
        )
    });

    println!(
        "{} {} workers running{}",
        "▶".green().bold(),
        pool.len().to_string().cyan(),
        if observer.is_some() {
            format!(", observing nodes every {}s", config.observer.interval_secs)
        } else {
            String::new()
        }
    );

    if drain {
        println!("{}", "Draining the task queue".dimmed());
        wait_until_drained(&engine, config.workers.poll_interval()).await?;
    } else {
        println!("{}", "Press Ctrl-C to stop".dimmed());
        tokio::signal::ctrl_c().await?;
        println!();
    }
    println!("{}", "Shutting down...".yellow());

    cancel.cancel();
    pool.shutdown().await;
    if let Some(observer) = observer {
        observer.await?;
    }

    println!("{}", "Stopped".green());
    Ok(())
}
