//! Hive 控制台
//!
//! 入口：初始化日志、加载配置、构建运行时，并在单个会话上运行行式命令控制台。
//!
//! 运行: cargo run -- [--config path/to/hive.toml] [--session id]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use hive::checkpoint::CheckpointStatus;
use hive::core::{
    create_hive_builder, AgentLoopHandle, HiveRuntime, ShutdownManager, ShutdownReason,
    StartOptions, StepOutcome,
};
use hive::snapshot::{SnapshotFilter, SnapshotTrigger};
use tokio::io::{AsyncBufReadExt, BufReader};

const HELP: &str = "commands: start <goal> | step | run | pause [reason] | resume | approve [feedback] \
| reject <reason> | status | todos | checkpoints | snapshot [label] | snapshots | restore <id> \
| cleanup <secs> | help | quit";

/// Hive 交互式控制台
#[derive(Parser, Debug)]
#[command(name = "hive")]
#[command(about = "Interactive agent orchestration console")]
struct Args {
    /// 额外的配置文件（覆盖 config/default.toml）
    #[arg(long, env = "HIVE_CONFIG")]
    config: Option<PathBuf>,

    /// 控制台操作的会话 id
    #[arg(long, default_value = "console")]
    session: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();
    let args = Args::parse();

    let runtime = create_hive_builder(args.config).build().await;
    let handle = runtime
        .registry
        .get_or_create_default(&args.session)
        .await
        .context("Failed to create session")?;

    // 过程事件以 JSON 行输出
    let mut events = handle.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("event: {line}");
            }
        }
    });

    let shutdown = Arc::new(ShutdownManager::new());
    shutdown.install_signal_handlers();

    println!("hive session '{}' ready. {HELP}", args.session);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = shutdown.wait_for_shutdown() => break,
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (cmd, rest) = line.split_once(' ').unwrap_or((line, ""));
        let rest = rest.trim();
        if cmd == "quit" || cmd == "exit" {
            shutdown.shutdown(ShutdownReason::UserInitiated);
            break;
        }
        if let Err(e) = dispatch(&runtime, &handle, cmd, rest).await {
            println!("error: {e:#}");
        }
    }

    runtime.shutdown().await;
    Ok(())
}

fn optional(rest: &str) -> Option<String> {
    (!rest.is_empty()).then(|| rest.to_string())
}

async fn dispatch(
    runtime: &HiveRuntime,
    handle: &AgentLoopHandle,
    cmd: &str,
    rest: &str,
) -> anyhow::Result<()> {
    match cmd {
        "start" => {
            let outcome = handle.start(rest, StartOptions::default()).await?;
            for item in &outcome.todo_list.items {
                println!("  {}. [{}] {}", item.position + 1, item.category, item.content);
            }
            for warning in &outcome.todo_list.warnings {
                println!("  warning: {warning}");
            }
            println!("plan {} ({:?})", outcome.todo_list.id, outcome.status.status);
        }
        "step" => print_step(&handle.step().await?),
        "run" => loop {
            let outcome = handle.step().await?;
            print_step(&outcome);
            let done = outcome.status().status.is_terminal();
            if done || !matches!(outcome, StepOutcome::Completed { .. }) {
                break;
            }
        },
        "pause" => println!("{:?}", handle.pause(optional(rest)).await?),
        "resume" => println!("{:?}", handle.resume().await?),
        "approve" | "reject" => {
            let pending = handle
                .get_pending_checkpoints(None)
                .await?
                .into_iter()
                .find(|c| c.checkpoint.is_blocking())
                .context("no pending checkpoint")?;
            let item_id = pending.checkpoint.todo_item_id;
            let outcome = if cmd == "approve" {
                handle.approve_checkpoint(item_id, optional(rest)).await?
            } else {
                handle.reject_checkpoint(item_id, optional(rest)).await?
            };
            println!(
                "{} -> {:?} (progress {}%, next {:?})",
                outcome.checkpoint_id, outcome.status.status, outcome.status.progress, outcome.next_step
            );
            if let Some(error) = outcome.error {
                println!("  failed: {error}");
            }
        }
        "status" => {
            let status = runtime.registry.get_status(handle.session_id()).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        "todos" => match handle.get_todo_list() {
            Some(list) => {
                for item in &list.items {
                    println!(
                        "  {}. {:<11} [{}] {}",
                        item.position + 1,
                        item.status.to_string(),
                        item.category,
                        item.content
                    );
                }
            }
            None => println!("no plan yet"),
        },
        "checkpoints" => {
            for view in handle.get_pending_checkpoints(None).await? {
                let marker = if view.checkpoint.status == CheckpointStatus::Pending { "*" } else { " " };
                println!(
                    "{marker} {} item={} status={:?} remaining={:?} reason={}",
                    view.checkpoint.id,
                    view.checkpoint.todo_item_id,
                    view.checkpoint.status,
                    view.remaining_time,
                    view.checkpoint.reason
                );
            }
        }
        "snapshot" => {
            let snapshot = runtime
                .snapshots
                .create_snapshot(handle.session_id(), SnapshotTrigger::Manual, optional(rest))
                .await?;
            println!("snapshot {} at step {}", snapshot.id, snapshot.state.step_index());
        }
        "snapshots" => {
            let filter = SnapshotFilter::for_session(handle.session_id());
            for snapshot in runtime.snapshots.query(&filter).await? {
                println!(
                    "  {} {} {} {}",
                    snapshot.id,
                    snapshot.trigger,
                    snapshot.created_at.to_rfc3339(),
                    snapshot.label.unwrap_or_default()
                );
            }
        }
        "restore" => {
            if rest.is_empty() {
                bail!("usage: restore <snapshot id>");
            }
            let outcome = runtime.snapshots.restore_snapshot(rest).await?;
            println!("restored {} at step {}", outcome.snapshot_id, outcome.step_index);
        }
        "cleanup" => {
            let secs = if rest.is_empty() {
                runtime
                    .config
                    .snapshot
                    .retention_secs
                    .context("usage: cleanup <secs>")?
            } else {
                rest.parse().context("cleanup expects seconds")?
            };
            let removed = runtime
                .snapshots
                .cleanup(handle.session_id(), Duration::from_secs(secs))
                .await?;
            println!("removed {removed} snapshots");
        }
        "help" => println!("{HELP}"),
        other => println!("unknown command '{other}'. {HELP}"),
    }
    Ok(())
}

fn print_step(outcome: &StepOutcome) {
    match outcome {
        StepOutcome::Completed { item_id, output, status } => {
            println!("completed {item_id} ({}%)", status.progress);
            if let Some(output) = output {
                println!("  {output}");
            }
        }
        StepOutcome::CheckpointRaised { checkpoint, .. } => {
            println!(
                "approval needed for {}: {} (approve [feedback] / reject <reason>)",
                checkpoint.checkpoint.todo_item_id, checkpoint.checkpoint.reason
            );
        }
        StepOutcome::Finished { status } => println!("plan finished ({:?})", status.status),
        StepOutcome::Failed { item_id, error, .. } => println!("step {item_id} failed: {error}"),
    }
}
