mod core_cli;

use crate::core_cli::{parse_mode, parse_target, Cli, Command, Target};
use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use log::{info, warn};
use rouilleftp::config::ClientConfig;
use rouilleftp::core_cache::ListingCache;
use rouilleftp::core_disk::OpenFiles;
use rouilleftp::core_dispatch::Dispatcher;
use rouilleftp::core_listing::{parse_listing, EntryKind};
use rouilleftp::core_log::{init_logger, SessionLogs};
use rouilleftp::core_network::{CommandOptions, ConnectParams, ControlConnection};
use rouilleftp::core_queue::{InMemoryQueue, ItemKind, ItemState, QueueItem};
use rouilleftp::core_tls::TlsMode;
use rouilleftp::core_worker::{Worker, WorkerContext, WorkerHandle, WorkerStatus};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

fn main() -> Result<()> {
    let args = Cli::parse();
    init_logger(args.verbose);

    let mut config = match &args.config {
        Some(path) => ClientConfig::load_from_file(path)
            .with_context(|| format!("Failed to load configuration file: {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(workers) = args.workers {
        config.connection.max_workers = workers.max(1);
    }

    let dispatcher = Dispatcher::start().context("Failed to start the network dispatcher")?;
    let result = match args.command {
        Command::Ls { url } => list(&dispatcher, &config, &url),
        command => run_queue(&dispatcher, config, command),
    };
    dispatcher.shutdown();
    result
}

fn connect_params(config: &ClientConfig, target: &Target) -> ConnectParams {
    let mut params = ConnectParams::from_config(config, &target.host, target.port, &target.user, &target.password);
    if target.implicit_tls {
        params.tls.mode = TlsMode::Implicit;
    }
    params
}

/// Lists one directory on a foreground connection.
fn list(dispatcher: &Dispatcher, config: &ClientConfig, url: &str) -> Result<()> {
    let target = parse_target(url)?;
    let params = connect_params(config, &target);
    let cache = Arc::new(ListingCache::new(config.cache.max_size_bytes));
    let logs = Arc::new(SessionLogs::default());
    let path = target.path.clone();

    let listing = dispatcher
        .call(async move {
            let conn = ControlConnection::new(params, logs)?;
            conn.connect().await?;
            let listing = conn
                .list_cached(&cache, &path, false, &CommandOptions::default())
                .await;
            let _ = conn.quit().await;
            listing
        })
        .with_context(|| format!("Unable to list {}", url))?;

    for entry in parse_listing(&listing) {
        match entry.kind {
            EntryKind::Directory => println!("{:>12}  {}/", "", entry.name.blue().bold()),
            EntryKind::Link => println!(
                "{:>12}  {} -> {}",
                "",
                entry.name.cyan(),
                entry.link_target.unwrap_or_default()
            ),
            EntryKind::File => println!("{:>12}  {}", entry.size, entry.name),
        }
    }
    Ok(())
}

fn root_item(command: &Command, target: &Target) -> Result<QueueItem> {
    let (dir, name) = target.split()?;
    let item = match command {
        Command::Get {
            target: local,
            move_source,
            ..
        } => {
            // A link item finds out whether the name is a file or a directory.
            let kind = if *move_source {
                ItemKind::MoveResolveLink
            } else {
                ItemKind::CopyResolveLink
            };
            QueueItem::new(kind, &dir, &name).with_local_dir(local)
        }
        Command::Put {
            source,
            move_source,
            ..
        } => {
            let metadata = std::fs::metadata(source)
                .with_context(|| format!("Cannot read {}", source.display()))?;
            let kind = match (metadata.is_dir(), *move_source) {
                (true, false) => ItemKind::UploadCopyExploreDir,
                (true, true) => ItemKind::UploadMoveExploreDir,
                (false, false) => ItemKind::UploadCopyFile,
                (false, true) => ItemKind::UploadMoveFile,
            };
            let local_name = source
                .file_name()
                .with_context(|| format!("{} has no file name", source.display()))?
                .to_string_lossy()
                .into_owned();
            let local_dir = source.parent().unwrap_or(Path::new(".")).to_path_buf();
            let local_dir = if local_dir.as_os_str().is_empty() {
                Path::new(".").to_path_buf()
            } else {
                local_dir
            };
            // The URL names the remote directory receiving the upload.
            QueueItem::new(kind, &target.path, &local_name)
                .with_local_dir(local_dir)
                .with_size(metadata.len())
        }
        Command::Rm { recursive, .. } => {
            let kind = if *recursive {
                ItemKind::DeleteExploreDir
            } else {
                ItemKind::DeleteFile
            };
            QueueItem::new(kind, &dir, &name)
        }
        Command::Chmod { mode, recursive, .. } => {
            let kind = if *recursive {
                ItemKind::ChAttrsExploreDir
            } else {
                ItemKind::ChAttrsFile
            };
            QueueItem::new(kind, &dir, &name).with_mode(parse_mode(mode)?)
        }
        Command::Ls { .. } => bail!("ls does not use the queue"),
    };
    Ok(item)
}

fn command_url(command: &Command) -> &str {
    match command {
        Command::Ls { url }
        | Command::Get { url, .. }
        | Command::Put { url, .. }
        | Command::Rm { url, .. }
        | Command::Chmod { url, .. } => url,
    }
}

/// Resolves once every worker sits in `ConnectionError` or has stopped.
async fn all_workers_disconnected(statuses: Vec<watch::Receiver<WorkerStatus>>) {
    let (tx, mut changes) = mpsc::unbounded_channel::<()>();
    for mut status in statuses.iter().cloned() {
        let tx = tx.clone();
        tokio::spawn(async move {
            while status.changed().await.is_ok() {
                if tx.send(()).is_err() {
                    break;
                }
            }
        });
    }
    drop(tx);
    loop {
        let stuck = statuses.iter().all(|status| {
            matches!(
                *status.borrow(),
                WorkerStatus::ConnectionError { .. } | WorkerStatus::Stopped
            )
        });
        if stuck || changes.recv().await.is_none() {
            return;
        }
    }
}

fn run_queue(dispatcher: &Dispatcher, config: ClientConfig, command: Command) -> Result<()> {
    let url = command_url(&command).to_string();
    let target = parse_target(&url)?;
    let queue = Arc::new(InMemoryQueue::new());
    queue.add(root_item(&command, &target)?);

    let ctx = WorkerContext {
        params: connect_params(&config, &target),
        cache: Arc::new(ListingCache::new(config.cache.max_size_bytes)),
        config: Arc::new(config),
        queue: queue.clone(),
        open_files: OpenFiles::new(),
        logs: Arc::new(SessionLogs::default()),
    };
    let workers = ctx.config.connection.max_workers;
    info!("Starting {} worker(s) for {}", workers, target.host);

    let shutdown = CancellationToken::new();
    let parent = shutdown.clone();
    let handles: Vec<WorkerHandle> = dispatcher.call(async move {
        Ok((1..=workers)
            .map(|id| Worker::spawn_with_shutdown(id, ctx.clone(), &parent))
            .collect())
    })?;
    let statuses: Vec<_> = handles.iter().map(WorkerHandle::subscribe).collect();
    let waiting = queue.clone();
    let finished = dispatcher.call(async move {
        tokio::select! {
            _ = waiting.wait_until_finished() => Ok(true),
            _ = all_workers_disconnected(statuses) => Ok(false),
        }
    })?;
    if !finished {
        for handle in &handles {
            if let WorkerStatus::ConnectionError { error } = handle.status() {
                warn!("Worker {}: {}", handle.id(), error);
            }
        }
    }

    shutdown.cancel();
    dispatcher.call(async move {
        for handle in handles {
            handle.join().await;
        }
        Ok(())
    })?;

    print_summary(&queue);
    let (done, skipped, failed) = queue.summary();
    println!(
        "{} done, {} skipped, {} failed",
        done.to_string().green(),
        skipped.to_string().yellow(),
        failed.to_string().red()
    );
    if !finished {
        bail!("Could not connect to {}", target.host);
    }
    if failed > 0 {
        bail!("{} item(s) failed", failed);
    }
    Ok(())
}

fn print_summary(queue: &InMemoryQueue) {
    for item in queue.items() {
        let location = format!("{}/{}", item.path.trim_end_matches('/'), item.name);
        let detail = item.error_text.clone().unwrap_or_default();
        match item.state {
            ItemState::Done => println!("{:>8}  {}", "done".green(), location),
            ItemState::Skipped => println!("{:>8}  {}  {}", "skipped".yellow(), location, detail),
            ItemState::Failed | ItemState::ForcedToFail => {
                println!("{:>8}  {}  {}", "failed".red(), location, detail)
            }
            _ => println!("{:>8}  {}", "pending".dimmed(), location),
        }
    }
}
