//! Server entry point.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pica_server::api::create_router;
use pica_server::{
    Database, Library, Policy, ServerOptions, Storage, TaskScheduler, TaskStore,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let options = ServerOptions::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let storage = Storage::new(&options.storage);
    storage
        .ensure_layout()
        .with_context(|| format!("cannot create storage layout at {}", storage.root().display()))?;

    let db = Database::new(&storage.db_path())
        .await
        .context("cannot open library database")?;

    let store = Arc::new(TaskStore::new(db.clone()));
    let library = Library::new(db);
    let policy = Policy::resolve(&options);
    let scheduler = TaskScheduler::new(
        Arc::clone(&store),
        library,
        storage.clone(),
        policy,
        options.task_debug,
    );

    // Recovery runs to completion before the listener binds, so clients
    // never observe a stale `running` row.
    scheduler
        .recover_and_start()
        .await
        .context("boot recovery failed")?;

    let router = create_router(Arc::clone(&scheduler), options.api_key.clone());

    let addr = format!("{}:{}", options.bind, options.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(addr = %addr, storage = %storage.root().display(), "server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    // Running tasks are left to boot recovery: they reappear as
    // failed/"server restarted" and their staging stays resumable.
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
