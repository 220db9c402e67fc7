use anyhow::{Context, Result};
use rollcall_core::detector::ScrfdDetector;
use rollcall_core::recognizer::{ArcFaceExtractor, SCRFD_MODEL_FILE};
use rollcall_core::{EmbeddingExtractor, GalleryBuilder, SqliteAttendanceLog, VectorStore};
use rollcall_hw::V4lSource;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::{BusKind, Config};
use dbus_interface::{ExtractorFactory, RollcallService, BUS_NAME, OBJECT_PATH};
use engine::{SessionConfig, SessionParts};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("rollcalld starting");

    let config = Config::load()?;
    tracing::info!(
        camera = %config.camera_device,
        store = %config.store_path.display(),
        dataset = %config.dataset_dir.display(),
        models = %config.model_dir.display(),
        "configuration loaded"
    );

    // A corrupt store is fatal: starting empty would silently drop every enrollment.
    let store = VectorStore::new(&config.store_path);
    let records = store
        .load()
        .with_context(|| format!("cannot load embedding store {}", config.store_path.display()))?;
    tracing::info!(records = records.len(), "gallery loaded");

    let detector = ScrfdDetector::load(&config.model_dir.join(SCRFD_MODEL_FILE))?;
    let extractor = ArcFaceExtractor::load(&config.model_dir)?;
    let sink = Arc::new(SqliteAttendanceLog::open(&config.attendance_db)?);

    let parts = SessionParts {
        source: Box::new(
            V4lSource::new(config.camera_device.clone()).with_resolution(config.camera_width, config.camera_height),
        ),
        detector: Box::new(detector),
        extractor: Box::new(extractor),
        sink,
    };
    let session_config = SessionConfig {
        rejection_threshold: config.rejection_threshold,
        policy: config.tracker_policy(),
        decimation: config.decimation,
        frame_interval: config.frame_interval(),
        retry: config.retry_policy(),
        max_read_failures: config.max_read_failures,
    };
    let session = tokio::task::spawn_blocking(move || engine::spawn_session(parts, records, session_config))
        .await??;

    let gallery = Arc::new(GalleryBuilder::new(&config.dataset_dir, store).with_detection(config.detect_on_build));
    let model_dir = config.model_dir.clone();
    let extractors: ExtractorFactory = Arc::new(move || {
        let extractor = ArcFaceExtractor::load(&model_dir)?;
        Ok(Box::new(extractor) as Box<dyn EmbeddingExtractor + Send>)
    });
    let service = RollcallService::new(session.clone(), gallery, extractors);

    let builder = match config.bus {
        BusKind::Session => zbus::connection::Builder::session()?,
        BusKind::System => zbus::connection::Builder::system()?,
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(bus = ?config.bus, name = BUS_NAME, "rollcalld ready");

    // The status sender lives on the session thread; `changed` fails once it exits.
    let mut status = session.subscribe();
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("rollcalld shutting down");
        }
        _ = async { while status.changed().await.is_ok() {} } => {
            let last = session.status();
            tracing::error!(state = ?last.state, "recognition session ended");
        }
    }

    tokio::task::spawn_blocking(move || session.stop()).await??;
    Ok(())
}
