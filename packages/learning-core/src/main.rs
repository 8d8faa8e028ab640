use lumen_core::config::{Config, CoreConfig};
use lumen_core::db::Database;
use lumen_core::logging::init_tracing;
use lumen_core::workers::WorkerManager;
use lumen_core::LearningCore;

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();
    let _log_guard = init_tracing(&config.log_level);

    let db = match Database::from_config(&config).await {
        Ok(db) => db,
        Err(err) => {
            tracing::error!(error = %err, path = %config.database_path.display(), "database not initialized");
            std::process::exit(1);
        }
    };
    let core = LearningCore::new(db, CoreConfig::from_env());

    let manager = match WorkerManager::new(core.pool().clone(), core.content(), core.config(), core.bus()).await {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!(error = %e, "worker manager not initialized");
            std::process::exit(1);
        }
    };
    if let Err(e) = manager.start(config.worker_leader).await {
        tracing::error!(error = %e, "failed to start workers");
    }

    tracing::info!(leader = config.worker_leader, "lumen-core running");
    shutdown_signal().await;

    tracing::info!("shutdown signal received, stopping workers");
    manager.stop().await;
    tracing::info!("Graceful shutdown complete");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
