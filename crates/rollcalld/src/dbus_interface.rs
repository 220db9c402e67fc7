use crate::engine::SessionHandle;
use rollcall_core::{store, EmbeddingExtractor, GalleryBuilder};
use std::sync::Arc;
use zbus::{fdo, interface};

pub const BUS_NAME: &str = "org.rollcall.Rollcall1";
pub const OBJECT_PATH: &str = "/org/rollcall/Rollcall1";

/// Builds a fresh embedding extractor for a gallery rebuild.
pub type ExtractorFactory =
    Arc<dyn Fn() -> anyhow::Result<Box<dyn EmbeddingExtractor + Send>> + Send + Sync>;

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Rollcall1
/// Object path: /org/rollcall/Rollcall1
pub struct RollcallService {
    session: SessionHandle,
    gallery: Arc<GalleryBuilder>,
    extractors: ExtractorFactory,
}

impl RollcallService {
    pub fn new(session: SessionHandle, gallery: Arc<GalleryBuilder>, extractors: ExtractorFactory) -> Self {
        Self {
            session,
            gallery,
            extractors,
        }
    }
}

async fn run_blocking<T, F>(work: F) -> fdo::Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> anyhow::Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))?
        .map_err(|e| fdo::Error::Failed(format!("{e:#}")))
}

fn to_json<T: serde::Serialize>(value: &T) -> fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| fdo::Error::Failed(e.to_string()))
}

#[interface(name = "org.rollcall.Rollcall1")]
impl RollcallService {
    /// Stop reading frames and release the camera.
    async fn pause(&self) -> fdo::Result<()> {
        tracing::info!("pause requested");
        self.session.pause().map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Reacquire the camera and continue recognizing.
    async fn resume(&self) -> fdo::Result<()> {
        tracing::info!("resume requested");
        self.session.resume().map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Embed new dataset identities, then hand the updated gallery to the
    /// session. Returns the build report as JSON.
    async fn rebuild(&self) -> fdo::Result<String> {
        tracing::info!("rebuild requested");
        let gallery = Arc::clone(&self.gallery);
        let session = self.session.clone();
        let extractors = Arc::clone(&self.extractors);

        let report = run_blocking(move || {
            let mut extractor = extractors()?;
            let report = gallery.build_or_update(&mut extractor)?;
            session.reload(gallery.store().load()?)?;
            Ok(report)
        })
        .await?;
        to_json(&report)
    }

    /// Re-read the embedding store into the session.
    async fn reload(&self) -> fdo::Result<u32> {
        tracing::info!("reload requested");
        let gallery = Arc::clone(&self.gallery);
        let session = self.session.clone();

        run_blocking(move || {
            let records = gallery.store().load()?;
            let count = records.len() as u32;
            session.reload(records)?;
            Ok(count)
        })
        .await
    }

    /// Remove an identity's images and embeddings. Returns whether anything
    /// was removed.
    async fn delete_identity(&self, label: &str) -> fdo::Result<bool> {
        tracing::info!(label, "delete identity requested");
        let gallery = Arc::clone(&self.gallery);
        let session = self.session.clone();
        let label = label.to_string();

        run_blocking(move || {
            let report = gallery.delete_identity(&label)?;
            if report.records_removed > 0 {
                session.reload(gallery.store().load()?)?;
            }
            Ok(report.removed_anything())
        })
        .await
    }

    /// Session status as JSON.
    async fn status(&self) -> fdo::Result<String> {
        let mut value =
            serde_json::to_value(self.session.status()).map_err(|e| fdo::Error::Failed(e.to_string()))?;
        value["version"] = env!("CARGO_PKG_VERSION").into();
        Ok(value.to_string())
    }

    /// Enrolled identities and their record counts as JSON.
    async fn list_identities(&self) -> fdo::Result<String> {
        let gallery = Arc::clone(&self.gallery);
        let counts = run_blocking(move || Ok(store::identity_counts(&gallery.store().load()?))).await?;
        let list: Vec<_> = counts
            .into_iter()
            .map(|(identity, records)| serde_json::json!({ "identity": identity, "records": records }))
            .collect();
        to_json(&list)
    }
}
