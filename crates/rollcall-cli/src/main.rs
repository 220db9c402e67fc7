use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use rollcall_core::enroll::{self, MinResolution};
use rollcall_core::recognizer::{default_model_dir, ArcFaceExtractor};
use rollcall_core::{store, CosineMatcher, EmbeddingExtractor, GalleryBuilder, Matcher, SqliteAttendanceLog, VectorStore};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall face-recognition attendance CLI")]
struct Cli {
    #[command(flatten)]
    paths: Paths,

    /// Talk to the daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct Paths {
    /// Dataset root, one folder of images per identity
    #[arg(long, global = true, default_value = "dataset")]
    dataset: PathBuf,
    /// Embedding store file
    #[arg(long, global = true, default_value = "embeddings.json")]
    store: PathBuf,
    /// Attendance database
    #[arg(long, global = true, default_value = "attendance.db")]
    db: PathBuf,
    /// Directory holding det_10g.onnx and w600k_r50.onnx
    #[arg(long, global = true)]
    models: Option<PathBuf>,
}

impl Paths {
    fn model_dir(&self) -> PathBuf {
        self.models.clone().unwrap_or_else(default_model_dir)
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Embed dataset identities missing from the store
    Build {
        /// Dataset images are already face crops
        #[arg(long)]
        no_detect: bool,
    },
    /// List enrolled identities
    List {
        /// Ask the running daemon instead of reading the store
        #[arg(long)]
        daemon: bool,
    },
    /// Remove an identity's images and embeddings
    Remove {
        /// Identity label
        label: String,
        /// Remove through the running daemon so its gallery is reloaded
        #[arg(long)]
        daemon: bool,
    },
    /// Copy photos of a person into the dataset
    Enroll {
        /// Person's name
        #[arg(short, long)]
        label: String,
        /// Minimum number of acceptable photos
        #[arg(long, default_value_t = enroll::DEFAULT_MIN_IMAGES)]
        min_images: usize,
        /// Smallest accepted image side in pixels
        #[arg(long, default_value_t = 80)]
        min_side: u32,
        /// Candidate photos
        #[arg(required = true)]
        images: Vec<PathBuf>,
    },
    /// Identify the face in a single image
    Match {
        image: PathBuf,
        /// Cosine distance above which the face is Unknown
        #[arg(long, default_value_t = 0.55)]
        threshold: f32,
    },
    /// Show recent attendance events
    Log {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Show daemon status
    Status,
    /// Pause recognition and release the camera
    Pause,
    /// Resume recognition
    Resume,
    /// Ask the daemon to rebuild the gallery and reload it
    Rebuild,
    /// Ask the daemon to re-read the embedding store
    Reload,
}

#[zbus::proxy(
    interface = "org.rollcall.Rollcall1",
    default_service = "org.rollcall.Rollcall1",
    default_path = "/org/rollcall/Rollcall1"
)]
trait Rollcall {
    fn pause(&self) -> zbus::Result<()>;
    fn resume(&self) -> zbus::Result<()>;
    fn rebuild(&self) -> zbus::Result<String>;
    fn reload(&self) -> zbus::Result<u32>;
    fn delete_identity(&self, label: &str) -> zbus::Result<bool>;
    fn status(&self) -> zbus::Result<String>;
    fn list_identities(&self) -> zbus::Result<String>;
}

async fn daemon(system: bool) -> Result<RollcallProxy<'static>> {
    tracing::debug!(system, "connecting to rollcalld");
    let conn = if system {
        zbus::Connection::system().await
    } else {
        zbus::Connection::session().await
    }
    .context("failed to connect to D-Bus")?;
    RollcallProxy::new(&conn).await.context("rollcalld is not reachable")
}

fn pretty(json: &str) -> String {
    serde_json::from_str::<serde_json::Value>(json)
        .and_then(|v| serde_json::to_string_pretty(&v))
        .unwrap_or_else(|_| json.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = &cli.paths;

    match cli.command {
        Commands::Build { no_detect } => {
            let mut extractor = ArcFaceExtractor::load(&paths.model_dir())?;
            let builder = GalleryBuilder::new(&paths.dataset, VectorStore::new(&paths.store)).with_detection(!no_detect);
            let report = builder.build_or_update(&mut extractor)?;
            println!(
                "Added {} embeddings ({} new identities, {} skipped, {} failed images); gallery has {} records",
                report.added,
                report.new_identities.len(),
                report.skipped_identities,
                report.failed_images,
                report.total_records
            );
        }
        Commands::List { daemon: true } => {
            let proxy = daemon(cli.system).await?;
            println!("{}", pretty(&proxy.list_identities().await?));
        }
        Commands::List { daemon: false } => {
            let records = VectorStore::new(&paths.store).load()?;
            let counts = store::identity_counts(&records);
            if counts.is_empty() {
                println!("No identities enrolled");
            }
            for (identity, n) in counts {
                println!("{identity}\t{n}");
            }
        }
        Commands::Remove { label, daemon: true } => {
            if !daemon(cli.system).await?.delete_identity(&label).await? {
                bail!("no identity named {label:?}");
            }
            println!("Removed {label:?}");
        }
        Commands::Remove { label, daemon: false } => {
            let builder = GalleryBuilder::new(&paths.dataset, VectorStore::new(&paths.store));
            let report = builder.delete_identity(&label)?;
            if !report.removed_anything() {
                bail!("no identity named {:?}", report.label);
            }
            println!(
                "Removed {:?}: {} embeddings{}",
                report.label,
                report.records_removed,
                if report.images_removed { ", dataset folder deleted" } else { "" }
            );
        }
        Commands::Enroll {
            label,
            min_images,
            min_side,
            images,
        } => {
            let gate = MinResolution { min_side };
            let enrollment = enroll::stage_images(&paths.dataset, &label, &images, &gate, min_images)?;
            for (path, reason) in &enrollment.rejected {
                println!("rejected {}: {reason}", path.display());
            }
            println!(
                "Staged {} images for {:?} in {}; run `rollcall build` or `rollcall rebuild` to embed them",
                enrollment.staged.len(),
                enrollment.label,
                enrollment.folder.display()
            );
        }
        Commands::Match { image: path, threshold } => {
            let gallery = VectorStore::new(&paths.store).load()?;
            let mut extractor = ArcFaceExtractor::load(&paths.model_dir())?;
            let picture = image::open(&path)
                .with_context(|| format!("cannot read {}", path.display()))?
                .to_luma8();
            let probe = extractor.extract(&picture, true)?;
            let result = CosineMatcher.classify(&probe, &gallery, threshold);
            println!(
                "{}\tconfidence {:.3}\tdistance {:.3}",
                result.label(),
                result.confidence,
                result.distance
            );
        }
        Commands::Log { limit } => {
            let log = SqliteAttendanceLog::open(&paths.db)?;
            for event in log.recent(limit)? {
                println!(
                    "{}\t{}\t{:.3}",
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.identity,
                    event.confidence
                );
            }
        }
        Commands::Status => {
            let proxy = daemon(cli.system).await?;
            println!("{}", pretty(&proxy.status().await?));
        }
        Commands::Pause => {
            daemon(cli.system).await?.pause().await?;
            println!("Recognition paused");
        }
        Commands::Resume => {
            daemon(cli.system).await?.resume().await?;
            println!("Recognition resumed");
        }
        Commands::Rebuild => {
            let proxy = daemon(cli.system).await?;
            println!("{}", pretty(&proxy.rebuild().await?));
        }
        Commands::Reload => {
            let records = daemon(cli.system).await?.reload().await?;
            println!("Daemon reloaded {records} embeddings");
        }
    }

    Ok(())
}
