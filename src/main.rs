use anyhow::Context;
use rust_mediator::config::Settings;
use rust_mediator::modules::registry::ModuleRegistry;
use rust_mediator::{logging, network, supervisor};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("mediator.toml"));
    let settings = Settings::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    logging::init(&settings.log_level);
    info!(config = %config_path.display(), "mediator starting");

    let ack_timeout = Duration::from_secs(settings.session_idle_seconds);
    let listen_host = settings.listen_host.clone();
    let listen_port = settings.listen_port;

    let (handle, supervisor_task) = supervisor::spawn(settings, ModuleRegistry::standard());
    let server = tokio::spawn(network::server::serve(
        handle.clone(),
        listen_host,
        listen_port,
        ack_timeout,
        handle.shutdown_token(),
    ));

    let mut supervisor_task = supervisor_task;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            handle.shutdown();
        }
        result = &mut supervisor_task => {
            // The supervisor only ends on its own when startup failed.
            handle.shutdown();
            let _ = server.await;
            return match result {
                Ok(r) => r,
                Err(e) => Err(anyhow::anyhow!("supervisor task failed: {e}")),
            };
        }
    }

    // Let the supervisor finish module shutdown and historian teardown.
    let result = match supervisor_task.await {
        Ok(result) => result,
        Err(e) => Err(anyhow::anyhow!("supervisor task failed: {e}")),
    };
    if let Err(e) = &result {
        error!(error = %e, "supervisor ended with error");
    }
    let _ = server.await;
    result
}
