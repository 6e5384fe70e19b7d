//! Interactive shell over an in-process replica chain.
//!
//! Spins up `--replicas` in-memory replicas, chains them in order, and reads
//! commands from stdin. Faults can be injected per replica to watch writes
//! ride out delays and repair heal a chain after an outage.
//!
//! ```bash
//! cargo run --bin chain -- --replicas 3
//! > create jobType-A jobId-A {"message": "hello"}
//! > delay 0 3000
//! > replace jobType-A jobId-A 1 {"message": "slow head"}
//! > status
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, ensure};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{info, warn};

use chain_replication::protocol::{ConsoleCommand, HELP};
use chain_replication::{ChainView, Fault, MemoryReplica, Replica, ReplicatedTable, TableConfig};

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a chain-replicated table shell")]
struct Args {
    /// Number of replicas in the chain (head first, tail last)
    #[arg(long, default_value_t = 3)]
    replicas: usize,

    /// JSON file with table tuning (see `TableConfig`)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the per-hop timeout, in milliseconds
    #[arg(long)]
    hop_timeout_ms: Option<u64>,

    /// Override the abandoned-lock timeout, in milliseconds
    #[arg(long)]
    lock_timeout_ms: Option<u64>,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

fn load_config(args: &Args) -> Result<TableConfig> {
    let mut config = match &args.config {
        Some(path) => TableConfig::load(path)?,
        None => TableConfig::default(),
    };
    if let Some(ms) = args.hop_timeout_ms {
        config.hop_timeout_ms = ms;
    }
    if let Some(ms) = args.lock_timeout_ms {
        config.lock_timeout_ms = ms;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args = Args::parse();
    ensure!(args.replicas > 0, "--replicas must be at least 1");
    let config = load_config(&args)?;

    let replicas: Vec<Arc<MemoryReplica>> = (0..args.replicas)
        .map(|i| Arc::new(MemoryReplica::new(format!("replica-{i}"))))
        .collect();
    let view = ChainView::new(
        1,
        replicas
            .iter()
            .map(|replica| Arc::clone(replica) as Arc<dyn Replica>)
            .collect(),
    )?;

    let (table, worker) = ReplicatedTable::new(view, config);
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let repairs = tokio::spawn(worker.run_until(async move {
        let _ = shutdown_rx.await;
    }));

    info!(replicas = args.replicas, "chain ready, type HELP for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let command = match ConsoleCommand::parse(&line) {
            Ok(command) => command,
            Err(err) => {
                println!("error: {err:#}");
                continue;
            }
        };
        if command == ConsoleCommand::Exit {
            break;
        }
        execute(&table, &replicas, command).await;
    }

    let _ = shutdown_tx.send(());
    let _ = repairs.await;
    Ok(())
}

async fn execute(
    table: &ReplicatedTable,
    replicas: &[Arc<MemoryReplica>],
    command: ConsoleCommand,
) {
    let started = Instant::now();
    let result = match command {
        ConsoleCommand::Create { key, payload } => {
            table.create(key, payload).await.map(describe_write)
        }
        ConsoleCommand::Replace {
            key,
            expected_version,
            payload,
        } => table.replace(key, payload, expected_version).await.map(describe_write),
        ConsoleCommand::Merge {
            key,
            expected_version,
            patch,
        } => table.merge(key, patch, expected_version).await.map(describe_write),
        ConsoleCommand::Upsert { key, payload } => {
            table.upsert(key, payload).await.map(describe_write)
        }
        ConsoleCommand::Delete {
            key,
            expected_version,
        } => table.delete(key, expected_version).await.map(describe_write),
        ConsoleCommand::Read { key } => table
            .read(&key)
            .await
            .map(|row| format!("{} v{}: {}", row.key, row.version, row.payload)),
        ConsoleCommand::Repair { key } => table.repair(&key).await.map(|report| {
            if report.was_consistent() {
                "already consistent".to_string()
            } else {
                format!("repaired {}", report.repaired.join(", "))
            }
        }),
        ConsoleCommand::Delay { replica, delay } => {
            let text = with_replica(replicas, replica, |r| set_delay(r, delay));
            println!("{text}");
            return;
        }
        ConsoleCommand::Down { replica } => {
            let text = with_replica(replicas, replica, |r| {
                r.inject(Fault::Unavailable);
                format!("{} is down", r.name())
            });
            println!("{text}");
            return;
        }
        ConsoleCommand::Up { replica } => {
            let text = with_replica(replicas, replica, |r| {
                r.clear_fault();
                format!("{} is up", r.name())
            });
            println!("{text}");
            return;
        }
        ConsoleCommand::Status => {
            print_status(table, replicas);
            return;
        }
        ConsoleCommand::Help => {
            println!("{HELP}");
            return;
        }
        ConsoleCommand::Exit => return,
    };

    let elapsed = started.elapsed();
    match result {
        Ok(text) => println!("{text} ({elapsed:.1?})"),
        Err(err) => {
            warn!(error = %err, "operation failed");
            println!("error: {err} ({elapsed:.1?})");
        }
    }
}

fn describe_write(outcome: chain_replication::WriteOutcome) -> String {
    format!("ok, version {} (view {})", outcome.version, outcome.view_id)
}

fn with_replica(
    replicas: &[Arc<MemoryReplica>],
    index: usize,
    action: impl FnOnce(&MemoryReplica) -> String,
) -> String {
    match replicas.get(index) {
        Some(replica) => action(replica.as_ref()),
        None => format!("error: no replica at position {index}"),
    }
}

fn set_delay(replica: &MemoryReplica, delay: Duration) -> String {
    if delay.is_zero() {
        replica.clear_fault();
        format!("{} delay cleared", replica.name())
    } else {
        replica.inject(Fault::Delay(delay));
        format!("{} delayed by {delay:?}", replica.name())
    }
}

fn print_status(table: &ReplicatedTable, replicas: &[Arc<MemoryReplica>]) {
    let view = table.view();
    println!("view {} ({} replicas)", view.view_id(), view.len());
    for (index, replica) in replicas.iter().enumerate() {
        let role = view
            .role_of(index)
            .map(|role| format!("{role:?}"))
            .unwrap_or_else(|| "-".to_string());
        println!("  {} [{role}] writes={}", replica.name(), replica.write_count());
        for (key, row) in replica.snapshot() {
            let mut flags = Vec::new();
            if row.tombstone {
                flags.push("tombstone");
            }
            if row.lock {
                flags.push("pending");
            }
            println!("    {key} v{} {} {}", row.version, row.payload, flags.join(" "));
        }
    }
}
