use anyhow::{Context, Result};
use crossbeam_channel::{bounded, select};
use mmdb_mcp::config::{Config, Mode};
use mmdb_mcp::{DatabaseManager, IteratorManager, McpServer, MirrorSource, Updater};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{error, info, warn};

pub fn cmd_serve(config_path: Option<PathBuf>) -> Result<()> {
    let (config, found) =
        Config::load(config_path.as_deref()).context("Failed to load configuration")?;
    match &found {
        Some(path) => info!(path = %path.display(), "loaded configuration"),
        None => info!("no configuration file found, using defaults"),
    }

    let manager = Arc::new(DatabaseManager::new());
    let updater = match config.mode {
        Mode::Directory => {
            load_directories(&manager, &config)?;
            None
        }
        Mode::Mirror => Some(start_mirror(&manager, &config)?),
    };
    info!(databases = manager.len(), "databases loaded");

    let iterators = Arc::new(IteratorManager::new(config.iterator_ttl()?));
    iterators
        .start_sweep(config.iterator_cleanup_interval()?)
        .context("Failed to start iterator sweep")?;

    let mut server = McpServer::new(Arc::clone(&manager), Arc::clone(&iterators))
        .with_max_results(config.max_results);
    if let Some(updater) = &updater {
        server = server.with_updater(Arc::clone(updater));
    }

    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.try_send(());
    })
    .context("Failed to set Ctrl+C handler")?;

    // stdin blocks, so the server runs on its own thread and is abandoned on Ctrl+C
    let (done_tx, done_rx) = bounded(1);
    thread::Builder::new()
        .name("mcp-stdio".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            let result = server.serve(stdin.lock(), std::io::stdout());
            let _ = done_tx.send(result);
        })
        .context("Failed to start stdio server")?;
    info!("MCP server ready on stdio");

    let outcome = select! {
        recv(done_rx) -> result => match result {
            Ok(Ok(())) => {
                info!("stdin closed, shutting down");
                Ok(())
            }
            Ok(Err(e)) => Err(anyhow::Error::new(e).context("MCP server failed")),
            Err(_) => Err(anyhow::anyhow!("MCP server thread exited unexpectedly")),
        },
        recv(shutdown_rx) -> _ => {
            info!("interrupted, shutting down");
            Ok(())
        },
    };

    iterators.stop_sweep();
    if let Some(updater) = &updater {
        updater.stop_scheduled();
    }
    manager.stop_watching();
    outcome
}

fn load_directories(manager: &Arc<DatabaseManager>, config: &Config) -> Result<()> {
    let dirs: Vec<PathBuf> = config.directory.paths.iter().map(PathBuf::from).collect();
    for dir in &dirs {
        match manager.load_directory(dir) {
            Ok(count) => info!(dir = %dir.display(), count, "loaded database directory"),
            Err(e) => warn!(dir = %dir.display(), error = %e, "skipping database directory"),
        }
    }

    if config.directory.watch {
        let existing: Vec<PathBuf> = dirs.into_iter().filter(|d| d.is_dir()).collect();
        if existing.is_empty() {
            warn!("no database directory exists, not watching");
        } else {
            manager
                .watch(&existing)
                .context("Failed to watch database directories")?;
        }
    }
    Ok(())
}

fn start_mirror(manager: &Arc<DatabaseManager>, config: &Config) -> Result<Arc<Updater>> {
    let database_dir = PathBuf::from(&config.mirror.database_dir);
    fs::create_dir_all(&database_dir)
        .with_context(|| format!("Failed to create {}", database_dir.display()))?;
    if let Err(e) = manager.load_directory(&database_dir) {
        warn!(dir = %database_dir.display(), error = %e, "could not load installed databases");
    }

    let updater = Arc::new(Updater::new(
        Arc::new(MirrorSource::new(&config.mirror.source)),
        Arc::clone(manager),
        database_dir,
        config.mirror.editions.clone(),
    ));

    for result in updater.update_all() {
        match &result.error {
            Some(e) => error!(edition = %result.database, error = %e, "initial update failed"),
            None if result.updated => info!(edition = %result.database, size = result.size, "installed edition"),
            None => info!(edition = %result.database, "edition up to date"),
        }
    }

    if config.auto_update {
        updater
            .start_scheduled(config.update_interval()?)
            .context("Failed to start update schedule")?;
    }
    Ok(updater)
}
