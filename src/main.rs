//! Local LLM chat session server
//!
//! (c) Softlandia 2025

use tokio_local_chat::api;
use tokio_local_chat::config::ChatConfig;
use tokio_local_chat::core::session::ChatSession;
use tokio_local_chat::core::traits::ChatService;
use tokio_local_chat::infrastructure::engine::EngineHandle;

use anyhow::anyhow;
use di::{Injectable, ServiceCollection};
use di_axum::RouterServiceProviderExtensions;
use log::{info, warn};
use tokio::runtime::{Builder, Runtime};

fn main() -> anyhow::Result<()> {
    // initialize tracing
    tracing_subscriber::fmt::init();

    let runtime: Runtime = Builder::new_multi_thread().enable_all().build()?;

    runtime.block_on(web_server_task())
}

async fn web_server_task() -> anyhow::Result<()> {
    let provider = ServiceCollection::new()
        .add(ChatConfig::singleton())
        .add(EngineHandle::singleton())
        .add(ChatSession::singleton())
        .build_provider()
        .map_err(|err| anyhow!("invalid service registrations: {err}"))?;

    let config = provider.get_required::<ChatConfig>();
    let session = provider.get_required::<dyn ChatService>();
    info!(
        "{} models in catalog, worker mode: {}",
        config.model_list.len(),
        config.use_worker
    );

    let app = api::router().with_provider(provider);

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down...");
    session.teardown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
}
