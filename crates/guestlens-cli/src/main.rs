use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use guestlens_core::{
    compare, DescriptorExtractor, FaceExtractor, ImageFetcher, ImageSource, ModelLoader,
    OnnxModelSource,
};
use guestlens_studio::{
    open_guest_gallery, BatchProcessor, EventSummary, HttpStudioClient, IndexOutcome,
    LocalDescriptorMatch, MatchStrategy, RegistrationFlow, RemoteSelfieMatch, Selfie,
    SessionCache, StudioApi, REDIRECT_DELAY,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Parser)]
#[command(name = "guestlens", about = "Match studio guests to the event photos they appear in")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List events open for registration
    Events,
    /// Extract face descriptors from every photo of an event and upload them
    Index {
        #[arg(long)]
        event: String,
    },
    /// Register a guest with a selfie
    Register {
        #[arg(long)]
        event: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        phone: String,
        #[arg(long)]
        email: Option<String>,
        /// Selfie image file
        #[arg(long)]
        selfie: PathBuf,
        /// Match on this machine instead of on the studio endpoint
        #[arg(long)]
        local: bool,
    },
    /// Show the photos matched for the stored guest session
    Gallery {
        #[arg(long)]
        event: String,
    },
    /// Detect faces in an image (path or URL)
    Detect { image: String },
    /// Compare the most confident face of two images
    Compare {
        a: String,
        b: String,
        #[arg(long)]
        threshold: Option<f32>,
    },
    /// Inspect or remove the stored guest session
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Subcommand)]
enum SessionAction {
    Show,
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Events => {
            let events = list_events(&config).await?;
            if events.is_empty() {
                println!("No events");
            }
            for event in events {
                match event.date {
                    Some(date) => println!("{}  {}  ({date})", event.id, event.name),
                    None => println!("{}  {}", event.id, event.name),
                }
            }
        }
        Commands::Index { event } => {
            let api = studio_client(&config)?;
            let photos = api.event_photos(&event).await?;
            println!("Indexing {} photos of event {event}", photos.len());

            let processor = BatchProcessor::new(extractor(&config));
            let cancel = processor.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::info!("interrupt received, stopping after the current photo");
                    cancel.cancel();
                }
            });

            let outcome = processor
                .index_event(api.as_ref(), &event, &photos, |p| {
                    println!(
                        "[{:>3}%] {}/{} photos, {} faces",
                        p.percent(),
                        p.processed,
                        p.total,
                        p.total_faces
                    );
                })
                .await?;

            for skipped in &outcome.report().skipped {
                println!("skipped {}: {}", skipped.photo_id, skipped.reason);
            }
            match &outcome {
                IndexOutcome::Saved(report) => println!(
                    "Saved {} faces from {} of {} photos",
                    report.total_faces, report.photos_with_faces, report.photos_processed
                ),
                IndexOutcome::NoFacesFound(_) => println!("No faces found, nothing saved"),
                IndexOutcome::Cancelled(report) => println!(
                    "Interrupted after {} of {} photos, stored index left unchanged",
                    report.photos_processed,
                    photos.len()
                ),
            }
        }
        Commands::Register {
            event,
            name,
            phone,
            email,
            selfie,
            local,
        } => {
            let api = studio_client(&config)?;
            let strategy: Arc<dyn MatchStrategy> = if local {
                Arc::new(
                    LocalDescriptorMatch::new(api.clone(), extractor(&config))
                        .with_threshold(config.match_threshold),
                )
            } else {
                Arc::new(RemoteSelfieMatch::new(api.clone()))
            };
            let selfie = Selfie::from_path(&selfie)
                .with_context(|| format!("failed to read selfie {}", selfie.display()))?;

            let mut flow = RegistrationFlow::for_event(
                &event,
                api.clone(),
                strategy,
                Arc::new(open_sessions(&config)?),
            )?;
            flow.enter_details(&name, &phone, email.as_deref())?;
            flow.capture_selfie(selfie)?;
            let session = flow.submit().await?;

            match session.matched_count {
                0 => println!("Registered {}, no photos found yet", session.guest_name),
                1 => println!("Registered {}, found 1 photo", session.guest_name),
                n => println!("Registered {}, found {n} photos", session.guest_name),
            }
            tokio::time::sleep(REDIRECT_DELAY).await;
            print_gallery(api.as_ref(), &config, &event).await?;
        }
        Commands::Gallery { event } => {
            print_gallery(studio_client(&config)?.as_ref(), &config, &event).await?;
        }
        Commands::Detect { image } => {
            let detections = extractor(&config)
                .extract_all_faces(&image_source(&image))
                .await?;
            if detections.is_empty() {
                println!("No face found");
            }
            for d in &detections {
                let b = d.bounding_box;
                println!(
                    "face {}: confidence {:.3}, box {}x{} at ({}, {})",
                    d.face_index, d.confidence, b.width, b.height, b.x, b.y
                );
            }
        }
        Commands::Compare { a, b, threshold } => {
            let extractor = extractor(&config);
            let mut faces = Vec::with_capacity(2);
            for image in [&a, &b] {
                let detections = extractor.extract_all_faces(&image_source(image)).await?;
                match detections.into_iter().next() {
                    Some(face) => faces.push(face.descriptor),
                    None => bail!("no face found in {image}"),
                }
            }
            let result = compare(&faces[0], &faces[1], threshold.unwrap_or(config.match_threshold));
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Commands::Session { action } => {
            let sessions = open_sessions(&config)?;
            match action {
                SessionAction::Show => match sessions.load()? {
                    Some(session) => {
                        println!("{}", serde_json::to_string_pretty(&session)?);
                        if !SessionCache::is_valid(&session, None) {
                            println!("(expired)");
                        }
                    }
                    None => println!("No guest session"),
                },
                SessionAction::Clear => {
                    sessions.clear()?;
                    println!("Guest session cleared");
                }
            }
        }
    }

    Ok(())
}

/// Events open for registration, retried per the configured policy.
async fn list_events(config: &Config) -> Result<Vec<EventSummary>> {
    let api = studio_client(config)?;
    let events = config
        .retry_policy()
        .run("getEvents", || api.list_events())
        .await?;
    Ok(events)
}

fn studio_client(config: &Config) -> Result<Arc<dyn StudioApi>> {
    let client = HttpStudioClient::new(config.endpoint_url()?, config.request_timeout())?;
    Ok(Arc::new(client))
}

fn open_sessions(config: &Config) -> Result<SessionCache> {
    let path = config.db_path();
    SessionCache::open(&path).with_context(|| format!("failed to open {}", path.display()))
}

fn extractor(config: &Config) -> Arc<DescriptorExtractor> {
    let mut source = OnnxModelSource::new(&config.model_dir);
    if let Some(base_url) = &config.model_base_url {
        source = source.with_base_url(base_url.as_str());
    }
    let loader = Arc::new(ModelLoader::new(Arc::new(source)));
    Arc::new(
        DescriptorExtractor::new(loader, ImageFetcher::default())
            .with_min_confidence(config.min_confidence),
    )
}

fn image_source(arg: &str) -> ImageSource {
    if arg.starts_with("http://") || arg.starts_with("https://") {
        ImageSource::Url(arg.to_string())
    } else {
        ImageSource::Path(PathBuf::from(arg))
    }
}

async fn print_gallery(api: &dyn StudioApi, config: &Config, event: &str) -> Result<()> {
    let sessions = open_sessions(config)?;
    let Some(gallery) = open_guest_gallery(api, &sessions, event).await? else {
        println!("No valid guest session for event {event}, register first");
        return Ok(());
    };
    println!(
        "{} photos for {} (event {event})",
        gallery.photos.len(),
        gallery.session.guest_name
    );
    for photo in &gallery.photos {
        println!("{}  {}  {}", photo.id, photo.name, photo.url);
    }
    Ok(())
}
