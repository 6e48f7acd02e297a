use colored::Colorize;
use kubeforge_cloud::{Engine, Task, TaskStatus, TaskType, handlers};

fn status_label(status: TaskStatus) -> colored::ColoredString {
    match status {
        TaskStatus::Queued => status.to_string().yellow(),
        TaskStatus::Running => status.to_string().cyan(),
        TaskStatus::Failed => status.to_string().red(),
    }
}

fn print_row(task: &Task) {
    let error = if task.error.is_empty() {
        String::new()
    } else {
        let mut line: String = task.error.lines().next().unwrap_or_default().to_string();
        if line.chars().count() > 60 {
            line = line.chars().take(57).collect::<String>() + "...";
        }
        line
    };
    println!(
        "{:<22} {:<17} {:<9} {:>5}  {}",
        task.id,
        task.task_type.to_string(),
        status_label(task.status),
        format!("{}/{}", task.attempts, task.max_attempts),
        error.dimmed()
    );
}

pub async fn list(engine: &Engine) -> anyhow::Result<()> {
    let tasks = engine.tasks().list().await?;
    if tasks.is_empty() {
        println!("{}", "No tasks".dimmed());
        return Ok(());
    }

    println!(
        "{:<22} {:<17} {:<9} {:>5}  {}",
        "ID".bold(),
        "TYPE".bold(),
        "STATUS".bold(),
        "TRIES".bold(),
        "LAST ERROR".bold()
    );
    for task in &tasks {
        print_row(task);
    }
    Ok(())
}

pub async fn show(engine: &Engine, id: &str) -> anyhow::Result<()> {
    let task = match engine.tasks().get(id).await {
        Ok(task) => task,
        Err(e) if e.is_not_found() => {
            crate::print_error(&format!("Task '{}' not found", id));
            anyhow::bail!("task {} not found", id);
        }
        Err(e) => return Err(e.into()),
    };

    println!("{}: {}", "ID".bold(), task.id);
    println!("{}: {}", "Type".bold(), task.task_type);
    println!("{}: {}", "Status".bold(), status_label(task.status));
    println!(
        "{}: {}/{}",
        "Attempts".bold(),
        task.attempts,
        task.max_attempts
    );
    if !task.error.is_empty() {
        println!("{}: {}", "Last error".bold(), task.error.red());
    }
    println!("{}:", "Data".bold());
    println!("{}", serde_json::to_string_pretty(&task.data)?);
    Ok(())
}

pub async fn enqueue(engine: &Engine, task_type: &str, payload: &str) -> anyhow::Result<()> {
    let task_type: TaskType = task_type.parse()?;
    if handlers::registry(engine).get(task_type).is_none() {
        anyhow::bail!("no handler serves {} tasks", task_type);
    }
    let data: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| anyhow::anyhow!("payload is not valid JSON: {}", e))?;

    let task = engine.tasks().start(task_type, &data).await?;
    println!(
        "{} Queued {} task {}",
        "✓".green().bold(),
        task.task_type.to_string().cyan(),
        task.id
    );
    Ok(())
}
