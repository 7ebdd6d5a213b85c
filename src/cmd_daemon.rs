use crate::args::{Cli, Commands};
use anyhow::{Context, Result};
use std::path::PathBuf;
use steward::daemon::protocol::{ChangeInfo, TaskInfo};
use steward::daemon::supervisor::ExitReason;
use steward::{DaemonClient, DaemonConfig, DaemonServer};

/// Run a CLI command. Returns the process exit code.
pub async fn cmd_daemon(cli: Cli) -> Result<i32> {
    let client = match &cli.socket {
        Some(socket) => DaemonClient::with_socket(socket.clone()),
        None => DaemonClient::new(),
    };

    match cli.command {
        Commands::Run { plan, no_autostart } => {
            return cmd_run(cli.socket, plan, !no_autostart).await;
        }
        Commands::Services { names } => cmd_services(&client, &names).await?,
        Commands::Start { names, no_wait } => {
            let id = client.start(&names).await?;
            report_change(&client, &id, no_wait).await?;
        }
        Commands::Stop {
            names,
            all,
            no_wait,
        } => {
            let id = client.stop(&names, all).await?;
            report_change(&client, &id, no_wait).await?;
        }
        Commands::Restart { names, no_wait } => {
            let id = client.restart(&names).await?;
            report_change(&client, &id, no_wait).await?;
        }
        Commands::Replan { no_wait } => {
            let id = client.replan().await?;
            report_change(&client, &id, no_wait).await?;
        }
        Commands::Autostart { no_wait } => {
            let id = client.autostart().await?;
            report_change(&client, &id, no_wait).await?;
        }
        Commands::Checks { names, level } => cmd_checks(&client, &names, level.as_deref()).await?,
        Commands::StartChecks { names } => {
            client.start_checks(&names).await?;
            println!("Checks started: {}", names.join(", "));
        }
        Commands::StopChecks { names } => {
            client.stop_checks(&names).await?;
            println!("Checks stopped: {}", names.join(", "));
        }
        Commands::Changes => cmd_changes(&client).await?,
        Commands::Tasks { id } => {
            let (change, tasks) = client.change(&id).await?;
            print_tasks(&change, &tasks);
        }
        Commands::Abort { id } => {
            client.abort(&id).await?;
            println!("Change {} aborted", id);
        }
        Commands::Logs { name, lines } => {
            let logs = client.service_logs(&name, lines).await?;
            if logs.is_empty() {
                println!("No output captured for {}", name);
            }
            for line in logs {
                println!("{}", line);
            }
        }
        Commands::Signal { signal, names } => {
            client
                .signal(&signal, &names)
                .await
                .with_context(|| format!("Failed to send {} to {}", signal, names.join(", ")))?;
        }
        Commands::Shutdown => {
            if !client.is_running().await {
                println!("Daemon is not running");
                return Ok(0);
            }
            client.shutdown().await?;
            for _ in 0..50 {
                if !client.socket_exists() {
                    println!("Daemon stopped");
                    return Ok(0);
                }
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            println!("Daemon may still be stopping (check with `steward services`)");
        }
    }

    Ok(0)
}

async fn cmd_run(socket: Option<PathBuf>, plan: Option<PathBuf>, autostart: bool) -> Result<i32> {
    let mut config = DaemonConfig {
        autostart,
        ..DaemonConfig::default()
    };
    if let Some(socket) = socket {
        config.socket_path = socket;
    }
    if let Some(plan) = plan {
        config.plan_path = Some(plan);
    }

    eprintln!("Running steward in foreground (Ctrl+C to stop)");
    eprintln!("  Socket: {}", config.socket_path.display());
    eprintln!("  State:  {}", config.state_dir.display());
    if let Some(plan) = &config.plan_path {
        eprintln!("  Plan:   {}", plan.display());
    }

    let server = DaemonServer::new(config).await?;
    match server.run().await? {
        ExitReason::Success => Ok(0),
        ExitReason::Failure => Ok(1),
    }
}

async fn cmd_services(client: &DaemonClient, names: &[String]) -> Result<()> {
    let services = client.services(names).await?;
    if services.is_empty() {
        println!("No services in plan");
        return Ok(());
    }

    let rows = services
        .iter()
        .map(|svc| {
            vec![
                svc.name.clone(),
                svc.startup.clone(),
                svc.current.as_str().to_string(),
                svc.current_since.clone().unwrap_or_else(|| "-".to_string()),
                svc.starts.to_string(),
                svc.pid.map(|p| p.to_string()).unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(&["Service", "Startup", "Current", "Since", "Starts", "PID"], rows);
    Ok(())
}

async fn cmd_checks(client: &DaemonClient, names: &[String], level: Option<&str>) -> Result<()> {
    let checks = client.checks(names, level).await?;
    if checks.is_empty() {
        println!("No checks in plan");
        return Ok(());
    }

    let rows = checks
        .iter()
        .map(|check| {
            vec![
                check.name.clone(),
                check.level.clone(),
                check.startup.clone(),
                check.status.as_str().to_string(),
                format!("{}/{}", check.failures, check.threshold),
                check.change_id.clone().unwrap_or_else(|| "-".to_string()),
            ]
        })
        .collect();
    print_table(&["Check", "Level", "Startup", "Status", "Failures", "Change"], rows);
    Ok(())
}

async fn cmd_changes(client: &DaemonClient) -> Result<()> {
    let changes = client.changes().await?;
    if changes.is_empty() {
        println!("No changes");
        return Ok(());
    }

    let rows = changes
        .iter()
        .map(|change| {
            vec![
                change.id.clone(),
                change.status.clone(),
                change.spawn_time.clone(),
                change.ready_time.clone().unwrap_or_else(|| "-".to_string()),
                change.summary.clone(),
            ]
        })
        .collect();
    print_table(&["ID", "Status", "Spawn", "Ready", "Summary"], rows);
    Ok(())
}

/// Print the change id, or wait for it and fail when it did not finish Done.
async fn report_change(client: &DaemonClient, id: &str, no_wait: bool) -> Result<()> {
    if no_wait {
        println!("{}", id);
        return Ok(());
    }

    let (change, tasks) = client.wait_change(id, None).await?;
    if change.status == "Done" {
        println!("{}", change.summary);
        return Ok(());
    }

    print_tasks(&change, &tasks);
    let reason = change.err.unwrap_or_else(|| format!("change finished in {} status", change.status));
    anyhow::bail!("change {} failed: {}", change.id, reason)
}

fn print_tasks(change: &ChangeInfo, tasks: &[TaskInfo]) {
    println!("Change {} ({}): {}", change.id, change.status, change.summary);
    let rows = tasks
        .iter()
        .map(|task| {
            vec![
                task.id.clone(),
                task.status.clone(),
                task.spawn_time.clone(),
                task.ready_time.clone().unwrap_or_else(|| "-".to_string()),
                task.summary.clone(),
            ]
        })
        .collect();
    print_table(&["ID", "Status", "Spawn", "Ready", "Summary"], rows);

    for task in tasks.iter().filter(|t| !t.log.is_empty()) {
        println!();
        println!("......................................................................");
        println!("{}", task.summary);
        println!();
        for entry in &task.log {
            println!("{}", entry);
        }
    }
}

fn print_table(header: &[&str], rows: Vec<Vec<String>>) {
    let mut widths: Vec<usize> = header.iter().map(|h| h.len()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let line = |cells: Vec<&str>| {
        let padded: Vec<String> = cells
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = width))
            .collect();
        println!("{}", padded.join("  ").trim_end());
    };

    line(header.to_vec());
    for row in &rows {
        line(row.iter().map(String::as_str).collect());
    }
}
