use crate::config::Config;
use crate::detector::{Detector, GrpcDetector};
use crate::retention::{RetentionSweeper, ReviewStore};
use crate::server::HttpServer;
use crate::uploads;

use std::{error::Error, sync::Arc};
use tokio::{signal, sync::broadcast};

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    for dir in [
        &config.storage.upload_dir,
        &config.storage.frames_dir,
        &config.storage.review_dir,
    ] {
        uploads::ensure_dir(dir)?;
    }

    let detector: Arc<dyn Detector> = match GrpcDetector::new(&config.detection_service).await {
        Ok(detector) => Arc::new(detector),
        Err(e) => {
            tracing::error!("Failed to initialize detector: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let review_store = ReviewStore::new(&config.storage.review_dir, config.retention.max_age());
    tracing::info!("Retaining flagged frames in {:?}", review_store.dir());
    let server = HttpServer::new(detector, review_store.clone(), &config).await?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let server_shutdown_rx = shutdown_tx.subscribe();
    let sweeper_shutdown_rx = shutdown_tx.subscribe();

    let sweeper_handle = RetentionSweeper::new(review_store, config.retention.sweep_interval())
        .run(sweeper_shutdown_rx);

    let server_handle = server.run(server_shutdown_rx).await?;

    shutdown_signal().await;
    tracing::info!("Shutdown signal received, starting graceful shutdown.");

    let _ = shutdown_tx.send(());
    let _ = sweeper_handle.await;
    match server_handle.await {
        Ok(Err(e)) => tracing::error!("Server exited with error: {:?}", e),
        Err(e) => tracing::error!("Server task failed: {:?}", e),
        Ok(Ok(())) => {}
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
